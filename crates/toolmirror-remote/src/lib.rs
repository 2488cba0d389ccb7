//! Remote catalog sources: the live HTTP listing and JSON fixture files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use toolmirror_core::{decode_snapshot, CatalogError, FieldMapping, RemoteSnapshot};
use toolmirror_storage::{FetchError, HttpFetcher};
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "toolmirror-remote";

/// Undecoded listing as handed over by a source.
#[derive(Debug, Clone)]
pub struct RawCatalog {
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    pub digest: String,
    pub tools: Vec<JsonValue>,
}

impl RawCatalog {
    pub fn into_snapshot(self, mapping: &FieldMapping) -> RemoteSnapshot {
        decode_snapshot(
            &self.tools,
            mapping,
            self.source_url,
            self.fetched_at,
            self.digest,
        )
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetching {source_url}: {reason}")]
    Unavailable { source_url: String, reason: String },
    #[error("decoding {source_url}: {reason}")]
    Decode { source_url: String, reason: String },
}

impl From<SourceError> for CatalogError {
    fn from(err: SourceError) -> Self {
        CatalogError::FetchUnavailable(err.to_string())
    }
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// URL or path the catalog is read from.
    fn location(&self) -> &str;

    async fn fetch(&self, run_id: Uuid) -> Result<RawCatalog, SourceError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Parses a listing body. The top level must be a JSON array of tools.
pub fn parse_catalog_bytes(
    source_url: &str,
    fetched_at: DateTime<Utc>,
    bytes: &[u8],
) -> Result<RawCatalog, SourceError> {
    let value: JsonValue = serde_json::from_slice(bytes).map_err(|err| SourceError::Decode {
        source_url: source_url.to_string(),
        reason: err.to_string(),
    })?;
    let JsonValue::Array(tools) = value else {
        return Err(SourceError::Decode {
            source_url: source_url.to_string(),
            reason: "expected a JSON array of tools".to_string(),
        });
    };
    Ok(RawCatalog {
        source_url: source_url.to_string(),
        fetched_at,
        digest: sha256_hex(bytes),
        tools,
    })
}

pub struct HttpCatalogSource {
    url: String,
    http: HttpFetcher,
}

impl HttpCatalogSource {
    pub fn new(url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    fn location(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, run_id: Uuid) -> Result<RawCatalog, SourceError> {
        let response = self
            .http
            .fetch_json_bytes(run_id, &self.url)
            .await
            .map_err(|err: FetchError| SourceError::Unavailable {
                source_url: self.url.clone(),
                reason: err.to_string(),
            })?;
        info!(
            %run_id,
            status = response.status.as_u16(),
            bytes = response.body.len(),
            "fetched remote catalog"
        );
        parse_catalog_bytes(&response.final_url, Utc::now(), &response.body)
    }
}

/// Reads the listing from a JSON file on disk.
pub struct FixtureCatalogSource {
    path: PathBuf,
    location: String,
}

impl FixtureCatalogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let location = path.display().to_string();
        Self { path, location }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CatalogSource for FixtureCatalogSource {
    fn location(&self) -> &str {
        &self.location
    }

    async fn fetch(&self, run_id: Uuid) -> Result<RawCatalog, SourceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|err| SourceError::Unavailable {
                source_url: self.location.clone(),
                reason: err.to_string(),
            })?;
        info!(%run_id, path = %self.location, bytes = bytes.len(), "read catalog fixture");
        parse_catalog_bytes(&self.location, Utc::now(), &bytes)
    }
}

/// A file path takes precedence over the HTTP listing.
pub fn catalog_source(
    catalog_url: &str,
    catalog_file: Option<&Path>,
    http: HttpFetcher,
) -> Box<dyn CatalogSource> {
    match catalog_file {
        Some(path) => Box::new(FixtureCatalogSource::new(path)),
        None => Box::new(HttpCatalogSource::new(catalog_url, http)),
    }
}
