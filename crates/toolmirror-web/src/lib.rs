//! Read-only projection of the local catalog over HTTP.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use toolmirror_core::ToolSummary;
use toolmirror_storage::CatalogStore;
use tracing::{error, info};

pub const CRATE_NAME: &str = "toolmirror-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CatalogStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }
}

/// One entry of the `/tools` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionEntry {
    pub name: Option<String>,
    pub author: Option<String>,
    #[serde(rename = "gitUrl")]
    pub git_url: String,
    pub path: Option<String>,
}

impl From<ToolSummary> for ProjectionEntry {
    fn from(tool: ToolSummary) -> Self {
        Self {
            name: tool.name,
            author: tool.author,
            git_url: tool.key,
            path: tool.registry_id,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/tools", get(tools_handler))
        .with_state(state)
}

pub fn web_port_from_env() -> u16 {
    std::env::var("TOOLMIRROR_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(store: Arc<dyn CatalogStore>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "projection service listening");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

async fn tools_handler(State(state): State<AppState>) -> Response {
    match state.store.list_tools().await {
        Ok(tools) => {
            let entries = tools
                .into_iter()
                .map(ProjectionEntry::from)
                .collect::<Vec<_>>();
            Json(entries).into_response()
        }
        Err(err) => {
            error!(error = %err, "listing tools failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use toolmirror_core::ToolRecord;
    use toolmirror_storage::{CatalogTxn, MemoryCatalogStore, StoreError};
    use tower::ServiceExt;

    fn tool(key: &str, author: Option<&str>) -> ToolRecord {
        ToolRecord {
            id: key.to_string(),
            registry_id: Some(format!("quay.io/test/{key}")),
            registry: None,
            organization: Some("test".into()),
            name: Some(format!("{key}-tool")),
            description: Some("does things".into()),
            author: author.map(String::from),
            tool_type: JsonValue::Null,
            meta_version: None,
            versions: Vec::new(),
        }
    }

    async fn get_tools(state: AppState) -> (StatusCode, JsonValue) {
        let resp = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/tools")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn tools_route_projects_stored_tools() {
        let store = MemoryCatalogStore::new();
        store
            .seed([tool("t2", None), tool("t1", Some("Ada"))])
            .await;

        let (status, body) = get_tools(AppState::new(Arc::new(store))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!([
                {"name": "t1-tool", "author": "Ada", "gitUrl": "t1", "path": "quay.io/test/t1"},
                {"name": "t2-tool", "author": null, "gitUrl": "t2", "path": "quay.io/test/t2"}
            ])
        );
    }

    #[tokio::test]
    async fn empty_store_projects_empty_list() {
        let (status, body) = get_tools(AppState::new(Arc::new(MemoryCatalogStore::new()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    struct DownStore;

    #[async_trait]
    impl CatalogStore for DownStore {
        async fn begin(&self) -> Result<Box<dyn CatalogTxn>, StoreError> {
            Err(StoreError::Unavailable("pool closed".into()))
        }

        async fn list_tools(&self) -> Result<Vec<ToolSummary>, StoreError> {
            Err(StoreError::Unavailable("pool closed".into()))
        }
    }

    #[tokio::test]
    async fn store_failure_is_a_server_error() {
        let (status, body) = get_tools(AppState::new(Arc::new(DownStore))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("pool closed"));
    }
}
