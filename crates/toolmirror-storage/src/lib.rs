//! Catalog persistence + HTTP fetch utilities for toolmirror.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use thiserror::Error;
use toolmirror_core::{CatalogError, ToolRecord, ToolSummary, VersionRecord};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryCatalogStore;
pub use postgres::{PgCatalogStore, TableLayout, TOOL_DATA_COLUMNS, VERSION_DATA_COLUMNS};

pub const CRATE_NAME: &str = "toolmirror-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached at all; the run cannot continue.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A single statement was refused (constraint, payload, decode).
    #[error("statement rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Maps into the run-level error kinds, attributing rejections to `key`.
    pub fn for_key(self, key: &str) -> CatalogError {
        match self {
            Self::Unavailable(msg) => CatalogError::StoreUnavailable(msg),
            Self::Rejected(cause) => CatalogError::ApplyFailure {
                key: key.to_string(),
                cause,
            },
        }
    }
}

/// Whole-store operations (key loads, counts, commit): any failure means the
/// store could not be queried.
impl From<StoreError> for CatalogError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) | StoreError::Rejected(msg) => {
                CatalogError::StoreUnavailable(msg)
            }
        }
    }
}

/// Long-lived handle on the persistent catalog.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Opens the unit of work for one reconciliation run.
    async fn begin(&self) -> Result<Box<dyn CatalogTxn>, StoreError>;

    /// Tools ordered by key, for the projection service.
    async fn list_tools(&self) -> Result<Vec<ToolSummary>, StoreError>;

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Per-run unit of work. Dropping it without `commit` discards every change.
#[async_trait]
pub trait CatalogTxn: Send {
    async fn tool_keys(&mut self) -> Result<BTreeSet<String>, StoreError>;
    async fn version_keys(&mut self) -> Result<BTreeSet<String>, StoreError>;
    async fn count_tools(&mut self) -> Result<u64, StoreError>;
    async fn count_versions(&mut self) -> Result<u64, StoreError>;

    /// Returns whether a row was removed.
    async fn delete_tool(&mut self, key: &str) -> Result<bool, StoreError>;
    async fn delete_version(&mut self, key: &str) -> Result<bool, StoreError>;

    /// Inserts the tool row only; nested versions are inserted separately.
    async fn insert_tool(&mut self, tool: &ToolRecord) -> Result<(), StoreError>;
    async fn insert_version(&mut self, version: &VersionRecord) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url` expecting JSON, retrying transient failures per the backoff policy.
    pub async fn fetch_json_bytes(
        &self,
        run_id: Uuid,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let retry_allowed = attempt < self.backoff.max_retries;
            match self
                .client
                .get(url)
                .header(ACCEPT, "application/json")
                .send()
                .await
            {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && retry_allowed {
                        debug!(attempt, %status, "retrying catalog fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && retry_allowed {
                        debug!(attempt, error = %err, "retrying catalog fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn store_errors_map_to_run_level_kinds() {
        let rejected = StoreError::Rejected("duplicate key".into()).for_key("t1");
        assert!(matches!(
            rejected,
            CatalogError::ApplyFailure { ref key, .. } if key == "t1"
        ));
        let gone = StoreError::Unavailable("connection reset".into()).for_key("t1");
        assert!(matches!(gone, CatalogError::StoreUnavailable(_)));
    }
}
