use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::evolution::type_map::PersistedTable;
use crate::naming::TableName;

/// Last known definition of one warehouse table.
#[derive(Debug, Default)]
pub struct CachedTable {
    /// `None` until the table has been looked up since the last invalidation.
    lookup: Option<Option<PersistedTable>>,
}

impl CachedTable {
    /// Returns the cached definition, or `None` when a lookup is needed.
    ///
    /// `Some(None)` means the table is known not to exist.
    pub fn get(&self) -> Option<Option<&PersistedTable>> {
        self.lookup.as_ref().map(Option::as_ref)
    }

    pub fn store(&mut self, table: Option<PersistedTable>) {
        self.lookup = Some(table);
    }

    /// Forgets the cached definition. Called after DDL has been applied to the table.
    pub fn invalidate(&mut self) {
        self.lookup = None;
    }
}

/// Cache of persisted table definitions keyed by warehouse table.
///
/// Every table has its own lock. Holding it serializes evolution of that table while other
/// tables proceed. The map lock is only held to find or insert an entry.
#[derive(Debug, Clone, Default)]
pub struct SchemaCache {
    tables: Arc<Mutex<HashMap<TableName, Arc<Mutex<CachedTable>>>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the entry of `table`, creating an empty one on first use.
    pub async fn lock(&self, table: &TableName) -> OwnedMutexGuard<CachedTable> {
        let entry = {
            let mut tables = self.tables.lock().await;
            tables.entry(table.clone()).or_default().clone()
        };

        entry.lock_owned().await
    }

    /// Drops the entry of a table that no longer exists under this name.
    pub async fn remove(&self, table: &TableName) {
        self.tables.lock().await.remove(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::type_map::{PersistedColumn, WarehouseType};

    #[tokio::test]
    async fn entries_survive_until_invalidated() {
        let cache = SchemaCache::new();
        let table = TableName::new("public", "users");

        {
            let mut entry = cache.lock(&table).await;
            assert!(entry.get().is_none());
            entry.store(Some(PersistedTable {
                columns: vec![PersistedColumn {
                    name: "id".to_string(),
                    ty: WarehouseType::BigInt,
                }],
            }));
        }

        {
            let mut entry = cache.lock(&table).await;
            let cached = entry.get().flatten().unwrap();
            assert_eq!(cached.columns.len(), 1);
            entry.invalidate();
        }

        assert!(cache.lock(&table).await.get().is_none());
    }

    #[tokio::test]
    async fn missing_table_is_cached_as_absent() {
        let cache = SchemaCache::new();
        let table = TableName::new("public", "events");

        cache.lock(&table).await.store(None);

        assert!(matches!(cache.lock(&table).await.get(), Some(None)));
    }
}
