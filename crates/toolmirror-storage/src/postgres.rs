use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{Connection, PgPool, Postgres, Row, Transaction};
use toolmirror_core::{CatalogError, FieldMapping, ToolRecord, ToolSummary, VersionRecord};
use tracing::{info, warn};

use crate::{CatalogStore, CatalogTxn, StoreError};

/// Fixed tool columns besides the configurable key column.
pub const TOOL_DATA_COLUMNS: [&str; 8] = [
    "registry_id",
    "registry",
    "organization",
    "toolname",
    "tooltype",
    "description",
    "author",
    "metaversion",
];

/// Fixed version columns besides the configurable key column.
pub const VERSION_DATA_COLUMNS: [&str; 6] = [
    "tool_key",
    "name",
    "image",
    "descriptor",
    "dockerfile",
    "metaversion",
];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::Configuration(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Unavailable(err.to_string()),
            sqlx::Error::Database(ref db_err)
                if db_err.code().is_some_and(|code| is_connection_sqlstate(&code)) =>
            {
                Self::Unavailable(err.to_string())
            }
            other => Self::Rejected(other.to_string()),
        }
    }
}

/// SQLSTATE class 08 (connection exception) and 57P (operator intervention,
/// e.g. admin shutdown) mean the session is gone, not that a statement failed.
fn is_connection_sqlstate(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("57P")
}

fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 63
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(kind: &str, name: &str) -> Result<(), CatalogError> {
    if is_sql_identifier(name) {
        Ok(())
    } else {
        Err(CatalogError::Config(format!(
            "{kind} `{name}` is not a plain SQL identifier"
        )))
    }
}

/// Validated table/column names and the statements built from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub create_tools: String,
    pub create_versions: String,
    pub select_tool_keys: String,
    pub select_version_keys: String,
    pub count_tools: String,
    pub count_versions: String,
    pub delete_tool: String,
    pub delete_version: String,
    pub insert_tool: String,
    pub insert_version: String,
    pub list_tools: String,
}

impl TableLayout {
    pub fn new(mapping: &FieldMapping) -> Result<Self, CatalogError> {
        mapping.validate()?;
        check_identifier("tools_table", &mapping.tools_table)?;
        check_identifier("versions_table", &mapping.versions_table)?;
        check_identifier("local_id_column", &mapping.local_id_column)?;
        check_identifier("version_id_column", &mapping.version_id_column)?;

        let tool_key = mapping.local_id_column.to_ascii_lowercase();
        let version_key = mapping.version_id_column.to_ascii_lowercase();
        if TOOL_DATA_COLUMNS.contains(&tool_key.as_str()) {
            return Err(CatalogError::Config(format!(
                "local_id_column `{tool_key}` collides with a data column"
            )));
        }
        if VERSION_DATA_COLUMNS.contains(&version_key.as_str()) {
            return Err(CatalogError::Config(format!(
                "version_id_column `{version_key}` collides with a data column"
            )));
        }

        let tools = &mapping.tools_table;
        let versions = &mapping.versions_table;
        Ok(Self {
            create_tools: format!(
                "CREATE TABLE IF NOT EXISTS {tools} ({tool_key} varchar PRIMARY KEY, \
                 registry_id varchar, registry varchar, organization varchar, toolname varchar, \
                 tooltype jsonb, description varchar, author varchar, metaversion varchar)"
            ),
            create_versions: format!(
                "CREATE TABLE IF NOT EXISTS {versions} ({version_key} varchar PRIMARY KEY, \
                 tool_key varchar, name varchar, image varchar, descriptor jsonb, \
                 dockerfile jsonb, metaversion varchar)"
            ),
            select_tool_keys: format!("SELECT {tool_key} FROM {tools}"),
            select_version_keys: format!("SELECT {version_key} FROM {versions}"),
            count_tools: format!("SELECT COUNT(*) FROM {tools}"),
            count_versions: format!("SELECT COUNT(*) FROM {versions}"),
            delete_tool: format!("DELETE FROM {tools} WHERE {tool_key} = $1"),
            delete_version: format!("DELETE FROM {versions} WHERE {version_key} = $1"),
            insert_tool: format!(
                "INSERT INTO {tools} ({tool_key}, {}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                TOOL_DATA_COLUMNS.join(", ")
            ),
            insert_version: format!(
                "INSERT INTO {versions} ({version_key}, {}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                VERSION_DATA_COLUMNS.join(", ")
            ),
            list_tools: format!(
                "SELECT {tool_key} AS tool_key, toolname, author, description, registry_id \
                 FROM {tools} ORDER BY {tool_key}"
            ),
        })
    }
}

fn json_or_null(value: &JsonValue) -> Option<Json<&JsonValue>> {
    if value.is_null() {
        None
    } else {
        Some(Json(value))
    }
}

/// PostgreSQL-backed catalog.
#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
    layout: Arc<TableLayout>,
}

impl PgCatalogStore {
    pub async fn connect(database_url: &str, mapping: &FieldMapping) -> Result<Self, CatalogError> {
        let layout = TableLayout::new(mapping)?;
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|err| CatalogError::StoreUnavailable(err.to_string()))?;
        Ok(Self::from_pool(pool, layout))
    }

    pub fn from_pool(pool: PgPool, layout: TableLayout) -> Self {
        Self {
            pool,
            layout: Arc::new(layout),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn begin(&self) -> Result<Box<dyn CatalogTxn>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgCatalogTxn {
            tx,
            layout: Arc::clone(&self.layout),
        }))
    }

    async fn list_tools(&self) -> Result<Vec<ToolSummary>, StoreError> {
        let rows = sqlx::query(&self.layout.list_tools)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<ToolSummary, StoreError> {
                Ok(ToolSummary {
                    key: row.try_get("tool_key")?,
                    name: row.try_get("toolname")?,
                    author: row.try_get("author")?,
                    description: row.try_get("description")?,
                    registry_id: row.try_get("registry_id")?,
                })
            })
            .collect()
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(&self.layout.create_tools)
            .execute(&self.pool)
            .await?;
        sqlx::query(&self.layout.create_versions)
            .execute(&self.pool)
            .await?;
        info!("catalog schema ensured");
        Ok(())
    }
}

struct PgCatalogTxn {
    tx: Transaction<'static, Postgres>,
    layout: Arc<TableLayout>,
}

/// Releases the savepoint on success and rolls back to it on failure, so a
/// rejected statement leaves the outer transaction usable.
async fn settle<T: Send>(
    savepoint: Transaction<'_, Postgres>,
    result: Result<T, sqlx::Error>,
) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            savepoint.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = savepoint.rollback().await {
                warn!(error = %rollback_err, "rolling back savepoint failed");
                return Err(StoreError::from(rollback_err));
            }
            Err(StoreError::from(err))
        }
    }
}

#[async_trait]
impl CatalogTxn for PgCatalogTxn {
    async fn tool_keys(&mut self) -> Result<BTreeSet<String>, StoreError> {
        let keys: Vec<String> = sqlx::query_scalar(&self.layout.select_tool_keys)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(keys.into_iter().collect())
    }

    async fn version_keys(&mut self) -> Result<BTreeSet<String>, StoreError> {
        let keys: Vec<String> = sqlx::query_scalar(&self.layout.select_version_keys)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(keys.into_iter().collect())
    }

    async fn count_tools(&mut self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&self.layout.count_tools)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_versions(&mut self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&self.layout.count_versions)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_tool(&mut self, key: &str) -> Result<bool, StoreError> {
        let mut savepoint = Connection::begin(&mut *self.tx).await?;
        let result = sqlx::query(&self.layout.delete_tool)
            .bind(key)
            .execute(&mut *savepoint)
            .await;
        settle(savepoint, result)
            .await
            .map(|done| done.rows_affected() > 0)
    }

    async fn delete_version(&mut self, key: &str) -> Result<bool, StoreError> {
        let mut savepoint = Connection::begin(&mut *self.tx).await?;
        let result = sqlx::query(&self.layout.delete_version)
            .bind(key)
            .execute(&mut *savepoint)
            .await;
        settle(savepoint, result)
            .await
            .map(|done| done.rows_affected() > 0)
    }

    async fn insert_tool(&mut self, tool: &ToolRecord) -> Result<(), StoreError> {
        let mut savepoint = Connection::begin(&mut *self.tx).await?;
        let result = sqlx::query(&self.layout.insert_tool)
            .bind(&tool.id)
            .bind(&tool.registry_id)
            .bind(&tool.registry)
            .bind(&tool.organization)
            .bind(&tool.name)
            .bind(json_or_null(&tool.tool_type))
            .bind(&tool.description)
            .bind(&tool.author)
            .bind(&tool.meta_version)
            .execute(&mut *savepoint)
            .await;
        settle(savepoint, result).await.map(|_| ())
    }

    async fn insert_version(&mut self, version: &VersionRecord) -> Result<(), StoreError> {
        let mut savepoint = Connection::begin(&mut *self.tx).await?;
        let result = sqlx::query(&self.layout.insert_version)
            .bind(&version.id)
            .bind(&version.parent_tool_id)
            .bind(&version.name)
            .bind(&version.image)
            .bind(json_or_null(&version.descriptor))
            .bind(json_or_null(&version.dockerfile))
            .bind(&version.meta_version)
            .execute(&mut *savepoint)
            .await;
        settle(savepoint, result).await.map(|_| ())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_sqlstates_are_unavailable() {
        for code in ["08000", "08003", "08006", "57P01", "57P02", "57P03"] {
            assert!(is_connection_sqlstate(code), "{code}");
        }
        for code in ["23505", "22P02", "42P01", "57014"] {
            assert!(!is_connection_sqlstate(code), "{code}");
        }
        assert!(StoreError::from(sqlx::Error::PoolClosed).is_unavailable());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_unavailable());
    }

    #[test]
    fn default_layout_targets_legacy_tables() {
        let layout = TableLayout::new(&FieldMapping::default()).unwrap();
        assert_eq!(layout.select_tool_keys, "SELECT url FROM gmod_tools");
        assert_eq!(
            layout.delete_version,
            "DELETE FROM gmod_tools_versions_table WHERE url = $1"
        );
        assert!(layout.insert_tool.starts_with(
            "INSERT INTO gmod_tools (url, registry_id, registry, organization, toolname"
        ));
        assert!(layout.insert_tool.ends_with("$9)"));
        assert!(layout.insert_version.ends_with("$7)"));
        assert!(layout
            .create_tools
            .starts_with("CREATE TABLE IF NOT EXISTS gmod_tools (url varchar PRIMARY KEY"));
    }

    #[test]
    fn custom_mapping_changes_key_columns() {
        let mapping = FieldMapping {
            tools_table: "catalog_tools".into(),
            versions_table: "catalog_versions".into(),
            local_id_column: "tool_url".into(),
            version_id_column: "version_url".into(),
            ..FieldMapping::default()
        };
        let layout = TableLayout::new(&mapping).unwrap();
        assert_eq!(
            layout.list_tools,
            "SELECT tool_url AS tool_key, toolname, author, description, registry_id \
             FROM catalog_tools ORDER BY tool_url"
        );
        assert_eq!(layout.count_versions, "SELECT COUNT(*) FROM catalog_versions");
    }

    #[test]
    fn rejects_unsafe_or_colliding_names() {
        let injected = FieldMapping {
            tools_table: "tools; DROP TABLE x".into(),
            ..FieldMapping::default()
        };
        assert!(matches!(
            TableLayout::new(&injected),
            Err(CatalogError::Config(_))
        ));

        let colliding = FieldMapping {
            local_id_column: "toolname".into(),
            ..FieldMapping::default()
        };
        assert!(matches!(
            TableLayout::new(&colliding),
            Err(CatalogError::Config(_))
        ));

        let version_colliding = FieldMapping {
            version_id_column: "tool_key".into(),
            ..FieldMapping::default()
        };
        assert!(TableLayout::new(&version_colliding).is_err());
    }
}
