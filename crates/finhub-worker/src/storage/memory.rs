//! In-memory record store for tests and dry runs

use super::RecordStore;
use crate::model::{FlatRecord, StorageOutcome};
use crate::schema::{CompositeKey, SchemaDescriptor, SqlValue};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

type Table = BTreeMap<CompositeKey, Vec<SqlValue>>;

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, Table>,
    failures: HashMap<(String, CompositeKey), String>,
    attempts: u64,
}

/// Composite-key maps per table, with the same outcome rules as Postgres.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make inserts of `key` into `table` fail with `message`.
    pub async fn inject_failure(&self, table: &str, key: CompositeKey, message: impl Into<String>) {
        self.inner
            .lock()
            .await
            .failures
            .insert((table.to_string(), key), message.into());
    }

    pub async fn count(&self, table: &str) -> usize {
        self.inner.lock().await.tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Stored rows of `table`, ordered by key.
    pub async fn rows(&self, table: &str) -> Vec<(CompositeKey, Vec<SqlValue>)> {
        self.inner
            .lock()
            .await
            .tables
            .get(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub async fn contains(&self, table: &str, key: &CompositeKey) -> bool {
        self.inner
            .lock()
            .await
            .tables
            .get(table)
            .is_some_and(|t| t.contains_key(key))
    }

    /// Insert attempts seen, whatever their outcome.
    pub async fn attempts(&self) -> u64 {
        self.inner.lock().await.attempts
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert_or_skip(&self, schema: &SchemaDescriptor, record: &FlatRecord) -> StorageOutcome {
        let mut inner = self.inner.lock().await;
        inner.attempts += 1;

        let (key, row) = match schema.key_of(record).and_then(|key| Ok((key, schema.bind_row(record)?))) {
            Ok(pair) => pair,
            Err(detail) => return StorageOutcome::Error(detail),
        };

        if let Some(message) = inner.failures.get(&(schema.table().to_string(), key.clone())) {
            return StorageOutcome::Error(format!("{}: {message}", schema.table()));
        }

        let table = inner.tables.entry(schema.table().to_string()).or_default();
        if table.contains_key(&key) {
            return StorageOutcome::AlreadyExists;
        }
        table.insert(key, row);
        StorageOutcome::Stored
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn record(value: Value) -> FlatRecord {
        value.as_object().cloned().unwrap()
    }

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::builder("company_profiles_v2")
            .text("ticker")
            .text("name")
            .key(["ticker"])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_second_insert_is_already_exists() {
        let store = MemoryRecordStore::new();
        let rec = record(json!({"ticker": "AAPL", "name": "Apple Inc"}));

        assert_eq!(store.upsert_or_skip(&schema(), &rec).await, StorageOutcome::Stored);
        assert_eq!(store.upsert_or_skip(&schema(), &rec).await, StorageOutcome::AlreadyExists);
        assert_eq!(store.count("company_profiles_v2").await, 1);
        assert_eq!(store.attempts().await, 2);
    }

    #[tokio::test]
    async fn test_first_write_wins() {
        let store = MemoryRecordStore::new();
        store
            .upsert_or_skip(&schema(), &record(json!({"ticker": "AAPL", "name": "Apple Inc"})))
            .await;
        store
            .upsert_or_skip(&schema(), &record(json!({"ticker": "AAPL", "name": "Renamed"})))
            .await;

        let rows = store.rows("company_profiles_v2").await;
        assert_eq!(rows[0].1[1], SqlValue::Text(Some("Apple Inc".into())));
    }

    #[tokio::test]
    async fn test_missing_key_and_injected_failure_are_errors() {
        let store = MemoryRecordStore::new();
        let outcome = store.upsert_or_skip(&schema(), &record(json!({"name": "x"}))).await;
        assert!(matches!(outcome, StorageOutcome::Error(detail) if detail.contains("ticker")));

        store
            .inject_failure("company_profiles_v2", CompositeKey::new(["MSFT"]), "disk full")
            .await;
        let outcome = store.upsert_or_skip(&schema(), &record(json!({"ticker": "MSFT"}))).await;
        assert_eq!(outcome, StorageOutcome::Error("company_profiles_v2: disk full".into()));
        assert!(!store.contains("company_profiles_v2", &CompositeKey::new(["MSFT"])).await);
    }
}
