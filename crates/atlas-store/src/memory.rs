//! In-process store implementation.

use crate::error::{StoreError, StoreResult};
use crate::journal::JournalWriter;
use crate::store::{
    merge_row, row_key, BoxFuture, Change, ChangeKind, ChangeStream, Filter, Precondition, Query,
    Store, Table, KEY_COLUMN,
};
use atlas_core::{Clock, SystemClock};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

type Rows = BTreeMap<String, Value>;

/// Store held in memory, optionally journaling every change to disk.
///
/// Mutations are serialized under a write lock, so a conditional update
/// is an atomic compare-and-swap. With a journal attached, a change is
/// applied only after it was appended.
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, Rows>>,
    changes: broadcast::Sender<Change>,
    journal: Option<Mutex<JournalWriter>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tables: RwLock::new(HashMap::new()),
            changes,
            journal: None,
            clock,
        }
    }

    /// Journal every committed change.
    pub fn with_journal(mut self, journal: JournalWriter) -> Self {
        self.journal = Some(Mutex::new(journal));
        self
    }

    /// Rebuild state from journaled changes without re-journaling them.
    pub fn replay(&self, changes: impl IntoIterator<Item = Change>) -> usize {
        let mut tables = self.tables.write();
        let mut applied = 0;
        for change in changes {
            let rows = tables.entry(change.table).or_default();
            match change.kind {
                ChangeKind::Insert | ChangeKind::Update => {
                    rows.insert(change.key, change.row);
                }
                ChangeKind::Delete => {
                    rows.remove(&change.key);
                }
            }
            applied += 1;
        }
        debug!(applied, "Replayed journal");
        applied
    }

    /// Row count of `table`.
    pub fn count(&self, table: Table) -> usize {
        self.tables.read().get(&table).map(BTreeMap::len).unwrap_or(0)
    }

    /// Journal `change` before it is applied. A failed append fails the
    /// mutation, so no row exists in memory that the journal lacks.
    ///
    /// The append is a blocking buffered write plus flush, done while the
    /// table lock is held to keep the journal in commit order.
    fn record(&self, table: Table, kind: ChangeKind, key: &str, row: Value) -> StoreResult<Change> {
        let change = Change {
            table,
            kind,
            key: key.to_string(),
            row,
            at: self.clock.now(),
        };
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.lock().append(&change) {
                warn!(error = %e, %table, key, "Failed to journal change, mutation rejected");
                return Err(e);
            }
        }
        Ok(change)
    }

    fn broadcast(&self, change: Change) {
        // No receivers is fine.
        let _ = self.changes.send(change);
    }

    fn insert_sync(&self, table: Table, mut values: Value) -> StoreResult<String> {
        let Value::Object(fields) = &mut values else {
            return Err(StoreError::InvalidRow(format!(
                "{table} row must be a JSON object"
            )));
        };
        let key = match fields.get(KEY_COLUMN).and_then(Value::as_str) {
            Some(k) if !k.is_empty() => k.to_string(),
            _ => {
                let k = uuid::Uuid::new_v4().to_string();
                fields.insert(KEY_COLUMN.to_string(), Value::String(k.clone()));
                k
            }
        };

        {
            let mut tables = self.tables.write();
            let rows = tables.entry(table).or_default();
            if rows.contains_key(&key) {
                return Err(StoreError::Duplicate {
                    table: table.to_string(),
                    column: KEY_COLUMN.to_string(),
                    value: key,
                });
            }
            for column in table.unique_columns() {
                let Some(value) = values.get(*column).filter(|v| !v.is_null()) else {
                    continue;
                };
                if rows.values().any(|r| r.get(*column) == Some(value)) {
                    return Err(StoreError::Duplicate {
                        table: table.to_string(),
                        column: column.to_string(),
                        value: value.to_string(),
                    });
                }
            }
            let change = self.record(table, ChangeKind::Insert, &key, values.clone())?;
            rows.insert(key.clone(), values);
            self.broadcast(change);
        }
        Ok(key)
    }

    fn update_sync(
        &self,
        table: Table,
        key: &str,
        partial: Value,
        precondition: Option<Precondition>,
    ) -> StoreResult<Value> {
        let Value::Object(partial) = partial else {
            return Err(StoreError::InvalidRow(format!(
                "{table} update must be a JSON object"
            )));
        };
        let updated = {
            let mut tables = self.tables.write();
            let row = tables
                .get_mut(&table)
                .and_then(|rows| rows.get_mut(key))
                .ok_or_else(|| StoreError::NotFound {
                    table: table.to_string(),
                    key: key.to_string(),
                })?;
            if let Some(precondition) = &precondition {
                precondition.check(row)?;
            }
            let mut updated = row.clone();
            merge_row(&mut updated, &partial);
            let change = self.record(table, ChangeKind::Update, key, updated.clone())?;
            *row = updated.clone();
            self.broadcast(change);
            updated
        };
        Ok(updated)
    }

    fn delete_sync(&self, table: Table, key: &str) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        let Some(rows) = tables.get_mut(&table) else {
            return Ok(false);
        };
        let Some(row) = rows.get(key).cloned() else {
            return Ok(false);
        };
        let change = self.record(table, ChangeKind::Delete, key, row)?;
        rows.remove(key);
        self.broadcast(change);
        Ok(true)
    }
}

impl Store for MemoryStore {
    fn read_row<'a>(&'a self, table: Table, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Value>>> {
        Box::pin(async move {
            Ok(self
                .tables
                .read()
                .get(&table)
                .and_then(|rows| rows.get(key))
                .cloned())
        })
    }

    fn insert_row(&self, table: Table, values: Value) -> BoxFuture<'_, StoreResult<String>> {
        Box::pin(async move { self.insert_sync(table, values) })
    }

    fn update_row<'a>(
        &'a self,
        table: Table,
        key: &'a str,
        partial: Value,
        precondition: Option<Precondition>,
    ) -> BoxFuture<'a, StoreResult<Value>> {
        Box::pin(async move { self.update_sync(table, key, partial, precondition) })
    }

    fn delete_row<'a>(&'a self, table: Table, key: &'a str) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move { self.delete_sync(table, key) })
    }

    fn query_rows(&self, table: Table, query: Query) -> BoxFuture<'_, StoreResult<Vec<Value>>> {
        Box::pin(async move {
            let tables = self.tables.read();
            Ok(match tables.get(&table) {
                Some(rows) => query.apply(rows.values()),
                None => Vec::new(),
            })
        })
    }

    fn subscribe_changes(&self, table: Table, filter: Option<Filter>) -> ChangeStream {
        ChangeStream::new(table, filter, self.changes.subscribe())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        let counts: BTreeMap<&str, usize> = tables.iter().map(|(t, r)| (t.as_str(), r.len())).collect();
        f.debug_struct("MemoryStore")
            .field("rows", &counts)
            .field("journaled", &self.journal.is_some())
            .finish()
    }
}

/// Keys of rows, in order.
pub fn keys_of(rows: &[Value]) -> Vec<String> {
    rows.iter().filter_map(row_key).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::read_journal;
    use crate::store::SortOrder;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_insert_read_update() {
        let store = MemoryStore::new();
        let key = store
            .insert_row(Table::Strategies, json!({"id": "s1", "current_state": "IDLE"}))
            .await
            .unwrap();
        assert_eq!(key, "s1");

        let row = store
            .update_row(
                Table::Strategies,
                "s1",
                json!({"current_state": "SETUP"}),
                Some(Precondition::new("current_state", "IDLE")),
            )
            .await
            .unwrap();
        assert_eq!(row["current_state"], "SETUP");

        let read = store.read_row(Table::Strategies, "s1").await.unwrap().unwrap();
        assert_eq!(read["current_state"], "SETUP");
    }

    #[tokio::test]
    async fn test_precondition_failure_leaves_row() {
        let store = MemoryStore::new();
        store
            .insert_row(Table::Strategies, json!({"id": "s1", "current_state": "SETUP"}))
            .await
            .unwrap();
        let err = store
            .update_row(
                Table::Strategies,
                "s1",
                json!({"current_state": "TRIGGERED"}),
                Some(Precondition::new("current_state", "IDLE")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed { .. }));
        let read = store.read_row(Table::Strategies, "s1").await.unwrap().unwrap();
        assert_eq!(read["current_state"], "SETUP");
    }

    #[tokio::test]
    async fn test_generated_key_and_unique_columns() {
        let store = MemoryStore::new();
        let key = store
            .insert_row(Table::Orders, json!({"client_order_id": "c1"}))
            .await
            .unwrap();
        assert!(!key.is_empty());

        let err = store
            .insert_row(Table::Orders, json!({"client_order_id": "c1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
        assert_eq!(store.count(Table::Orders), 1);
    }

    #[tokio::test]
    async fn test_update_missing_row() {
        let store = MemoryStore::new();
        let err = store
            .update_row(Table::Orders, "nope", json!({"status": "filled"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_query_rows() {
        let store = MemoryStore::new();
        for (id, open, ts) in [
            ("p1", true, "2026-01-05T10:00:00Z"),
            ("p2", false, "2026-01-05T11:00:00Z"),
            ("p3", false, "2026-01-05T12:00:00Z"),
        ] {
            store
                .insert_row(Table::Positions, json!({"id": id, "is_open": open, "closed_at": ts}))
                .await
                .unwrap();
        }
        let rows = store
            .query_rows(
                Table::Positions,
                Query::new()
                    .filter(Filter::eq("is_open", false))
                    .order_by("closed_at", SortOrder::Desc),
            )
            .await
            .unwrap();
        assert_eq!(keys_of(&rows), vec!["p3", "p2"]);
    }

    #[tokio::test]
    async fn test_change_stream_filters_by_table_and_row() {
        let store = MemoryStore::new();
        let mut stream = store.subscribe_changes(Table::Orders, Some(Filter::eq("status", "filled")));

        store.insert_row(Table::Fills, json!({"id": "f1"})).await.unwrap();
        store
            .insert_row(Table::Orders, json!({"id": "o1", "status": "pending"}))
            .await
            .unwrap();
        store
            .update_row(Table::Orders, "o1", json!({"status": "filled"}), None)
            .await
            .unwrap();

        let change = stream.next().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Update);
        assert_eq!(change.key, "o1");
        assert!(stream.try_next().is_none());
    }

    #[tokio::test]
    async fn test_delete_publishes_change() {
        let store = MemoryStore::new();
        let mut stream = store.subscribe_changes(Table::Fills, None);
        store.insert_row(Table::Fills, json!({"id": "f1"})).await.unwrap();
        assert!(store.delete_row(Table::Fills, "f1").await.unwrap());
        assert!(!store.delete_row(Table::Fills, "f1").await.unwrap());

        assert_eq!(stream.next().await.unwrap().kind, ChangeKind::Insert);
        assert_eq!(stream.next().await.unwrap().kind, ChangeKind::Delete);
    }

    #[tokio::test]
    async fn test_journal_replay_restores_state() {
        let dir = TempDir::new().unwrap();
        {
            let store = MemoryStore::new().with_journal(JournalWriter::new(dir.path()).unwrap());
            store
                .insert_row(Table::Orders, json!({"id": "o1", "status": "pending"}))
                .await
                .unwrap();
            store
                .update_row(Table::Orders, "o1", json!({"status": "filled"}), None)
                .await
                .unwrap();
            store.insert_row(Table::Fills, json!({"id": "f1"})).await.unwrap();
            store.delete_row(Table::Fills, "f1").await.unwrap();
        }

        let restored = MemoryStore::new();
        assert_eq!(restored.replay(read_journal(dir.path()).unwrap()), 4);
        let order = restored.read_row(Table::Orders, "o1").await.unwrap().unwrap();
        assert_eq!(order["status"], "filled");
        assert_eq!(restored.count(Table::Fills), 0);
    }

    #[tokio::test]
    async fn test_journal_failure_rejects_mutation() {
        let dir = TempDir::new().unwrap();
        let journal_dir = dir.path().join("journal");
        let store = MemoryStore::new().with_journal(JournalWriter::new(&journal_dir).unwrap());
        std::fs::remove_dir_all(&journal_dir).unwrap();

        let err = store
            .insert_row(Table::Orders, json!({"id": "o2", "status": "pending"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(store.read_row(Table::Orders, "o2").await.unwrap().is_none());
        assert_eq!(store.count(Table::Orders), 0);
    }

    #[tokio::test]
    async fn test_journal_failure_keeps_row_unchanged() {
        let dir = TempDir::new().unwrap();
        let journal_dir = dir.path().join("journal");
        let store = MemoryStore::new().with_journal(JournalWriter::new(&journal_dir).unwrap());
        std::fs::remove_dir_all(&journal_dir).unwrap();
        store.replay([Change {
            table: Table::Orders,
            kind: ChangeKind::Insert,
            key: "o1".to_string(),
            row: json!({"id": "o1", "status": "pending"}),
            at: chrono::Utc::now(),
        }]);

        assert!(store
            .update_row(Table::Orders, "o1", json!({"status": "filled"}), None)
            .await
            .is_err());
        assert!(store.delete_row(Table::Orders, "o1").await.is_err());
        let row = store.read_row(Table::Orders, "o1").await.unwrap().unwrap();
        assert_eq!(row["status"], "pending");
    }
}
