//! In-memory [`KvStore`].
//!
//! Not durable and not shared between processes. Used by tests and by the
//! single-process emulator when no store directory is configured.

use super::{KvStore, StoreError, StoreResult, Table};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryKv {
    tables: RwLock<HashMap<Table, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of keys across all tables.
    pub async fn len(&self) -> usize {
        self.tables.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, table: Table, key: &str) -> StoreResult<Vec<u8>> {
        let tables = self.tables.read().await;
        tables
            .get(&table)
            .and_then(|t| t.get(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                table,
                key: key.to_string(),
            })
    }

    async fn put(&self, table: Table, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.entry(table).or_default().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, table: Table, key: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(t) = tables.get_mut(&table) {
            t.remove(key);
        }
        Ok(())
    }

    async fn scan_prefix(
        &self,
        table: Table,
        prefix: &str,
    ) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let tables = self.tables.read().await;
        let Some(t) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(t
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
