// State Store - optional persistence collaborator
//
// The engine only checkpoints through this contract and keeps working
// in memory when no store is configured.

use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn put(&self, key: &str, value: Value) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// All entries whose key starts with `prefix`, ordered by key
    async fn query(&self, prefix: &str) -> Result<Vec<(String, Value)>>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// In-process store, mostly for tests and single-run CLI use
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn query(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }
}
