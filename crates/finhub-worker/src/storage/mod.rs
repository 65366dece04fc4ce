//! Idempotent record storage
//!
//! Every record is persisted on its own: one record, one transaction. A key
//! collision is an expected outcome ([`StorageOutcome::AlreadyExists`]) and
//! any other failure is reported as [`StorageOutcome::Error`]; neither stops
//! the caller from storing the rest of the batch. Stores never retry.

pub mod memory;
pub mod postgres;

use crate::model::{FlatRecord, StorageOutcome};
use crate::schema::SchemaDescriptor;
use async_trait::async_trait;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert `record` into `schema`'s table unless its composite key exists.
    async fn upsert_or_skip(&self, schema: &SchemaDescriptor, record: &FlatRecord) -> StorageOutcome;
}
