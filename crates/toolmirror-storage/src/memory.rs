use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use toolmirror_core::{ToolRecord, ToolSummary, VersionRecord};

use crate::{CatalogStore, CatalogTxn, StoreError};

#[derive(Debug, Clone, Default)]
struct MemoryCatalog {
    tools: BTreeMap<String, ToolRecord>,
    versions: BTreeMap<String, VersionRecord>,
}

/// In-process catalog. A transaction works on a copy that replaces the shared
/// state on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalogStore {
    state: Arc<Mutex<MemoryCatalog>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores tools and their nested versions directly, bypassing reconciliation.
    pub async fn seed(&self, tools: impl IntoIterator<Item = ToolRecord>) {
        let mut state = self.state.lock().await;
        for mut tool in tools {
            for version in tool.versions.drain(..) {
                state.versions.insert(version.id.clone(), version);
            }
            state.tools.insert(tool.id.clone(), tool);
        }
    }

    pub async fn tool_keys(&self) -> BTreeSet<String> {
        self.state.lock().await.tools.keys().cloned().collect()
    }

    pub async fn version_keys(&self) -> BTreeSet<String> {
        self.state.lock().await.versions.keys().cloned().collect()
    }

    pub async fn tool(&self, key: &str) -> Option<ToolRecord> {
        self.state.lock().await.tools.get(key).cloned()
    }

    pub async fn version(&self, key: &str) -> Option<VersionRecord> {
        self.state.lock().await.versions.get(key).cloned()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn begin(&self) -> Result<Box<dyn CatalogTxn>, StoreError> {
        let working = self.state.lock().await.clone();
        Ok(Box::new(MemoryCatalogTxn {
            shared: Arc::clone(&self.state),
            working,
        }))
    }

    async fn list_tools(&self) -> Result<Vec<ToolSummary>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tools.values().map(ToolSummary::from).collect())
    }
}

struct MemoryCatalogTxn {
    shared: Arc<Mutex<MemoryCatalog>>,
    working: MemoryCatalog,
}

#[async_trait]
impl CatalogTxn for MemoryCatalogTxn {
    async fn tool_keys(&mut self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.working.tools.keys().cloned().collect())
    }

    async fn version_keys(&mut self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.working.versions.keys().cloned().collect())
    }

    async fn count_tools(&mut self) -> Result<u64, StoreError> {
        Ok(self.working.tools.len() as u64)
    }

    async fn count_versions(&mut self) -> Result<u64, StoreError> {
        Ok(self.working.versions.len() as u64)
    }

    async fn delete_tool(&mut self, key: &str) -> Result<bool, StoreError> {
        Ok(self.working.tools.remove(key).is_some())
    }

    async fn delete_version(&mut self, key: &str) -> Result<bool, StoreError> {
        Ok(self.working.versions.remove(key).is_some())
    }

    async fn insert_tool(&mut self, tool: &ToolRecord) -> Result<(), StoreError> {
        if self.working.tools.contains_key(&tool.id) {
            return Err(StoreError::Rejected(format!(
                "duplicate tool key `{}`",
                tool.id
            )));
        }
        let mut row = tool.clone();
        row.versions.clear();
        self.working.tools.insert(row.id.clone(), row);
        Ok(())
    }

    async fn insert_version(&mut self, version: &VersionRecord) -> Result<(), StoreError> {
        if self.working.versions.contains_key(&version.id) {
            return Err(StoreError::Rejected(format!(
                "duplicate version key `{}`",
                version.id
            )));
        }
        self.working
            .versions
            .insert(version.id.clone(), version.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        *this.shared.lock().await = this.working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as JsonValue;

    fn tool(key: &str, versions: &[&str]) -> ToolRecord {
        ToolRecord {
            id: key.to_string(),
            registry_id: Some(format!("quay.io/test/{key}")),
            registry: None,
            organization: Some("test".into()),
            name: Some(key.to_string()),
            description: None,
            author: Some("author".into()),
            tool_type: JsonValue::Null,
            meta_version: None,
            versions: versions
                .iter()
                .map(|v| VersionRecord {
                    id: v.to_string(),
                    parent_tool_id: key.to_string(),
                    name: Some(v.to_string()),
                    image: None,
                    descriptor: JsonValue::Null,
                    dockerfile: JsonValue::Null,
                    meta_version: None,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn uncommitted_changes_are_discarded() {
        let store = MemoryCatalogStore::new();
        store.seed([tool("t1", &["t1/v1"])]).await;

        let mut txn = store.begin().await.unwrap();
        assert!(txn.delete_tool("t1").await.unwrap());
        assert!(txn.delete_version("t1/v1").await.unwrap());
        assert_eq!(txn.count_tools().await.unwrap(), 0);
        drop(txn);

        assert_eq!(store.tool_keys().await.len(), 1);
        assert_eq!(store.version_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn commit_publishes_working_copy_and_rejects_duplicates() {
        let store = MemoryCatalogStore::new();
        store.seed([tool("t1", &[])]).await;

        let mut txn = store.begin().await.unwrap();
        let err = txn.insert_tool(&tool("t1", &[])).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        txn.insert_tool(&tool("t2", &["t2/v1"])).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(
            store.tool_keys().await.into_iter().collect::<Vec<_>>(),
            vec!["t1", "t2"]
        );
        // insert_tool never writes nested versions.
        assert!(store.version_keys().await.is_empty());
        assert!(store.tool("t2").await.unwrap().versions.is_empty());
    }

    #[tokio::test]
    async fn list_tools_is_ordered_by_key() {
        let store = MemoryCatalogStore::new();
        store.seed([tool("b", &[]), tool("a", &[])]).await;
        let rows = store.list_tools().await.unwrap();
        assert_eq!(rows[0].key, "a");
        assert_eq!(rows[1].registry_id.as_deref(), Some("quay.io/test/b"));
    }
}
