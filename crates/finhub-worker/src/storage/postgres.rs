//! Postgres record store

use super::RecordStore;
use crate::model::{FlatRecord, StorageOutcome};
use crate::schema::{SchemaDescriptor, SqlValue};
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{Error as SqlxError, PgPool, Postgres, QueryBuilder};
use tracing::{debug, warn};

/// Plain `INSERT` per record in its own transaction.
///
/// Relies on the target table's primary key matching the schema's composite
/// key; the unique violation is what reports the duplicate.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, schema: &SchemaDescriptor, row: Vec<SqlValue>) -> Result<(), SqlxError> {
        let mut tx = self.pool.begin().await?;

        let mut builder = insert_statement(schema, row);
        if let Err(err) = builder.build().execute(&mut *tx).await {
            if let Err(rollback) = tx.rollback().await {
                warn!(table = schema.table(), error = %rollback, "Rollback failed");
            }
            return Err(err);
        }

        tx.commit().await
    }
}

/// `INSERT INTO table (c1, c2, ..) VALUES ($1, $2, ..)`
///
/// Table and column names come from a validated [`SchemaDescriptor`], so they
/// are plain identifiers and safe to splice.
fn insert_statement(schema: &SchemaDescriptor, row: Vec<SqlValue>) -> QueryBuilder<'static, Postgres> {
    let columns = schema
        .columns()
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let mut builder = QueryBuilder::new(format!("INSERT INTO {} ({columns}) VALUES (", schema.table()));
    let mut values = builder.separated(", ");
    for value in row {
        match value {
            SqlValue::Text(v) => values.push_bind(v),
            SqlValue::BigInt(v) => values.push_bind(v),
            SqlValue::Double(v) => values.push_bind(v),
            SqlValue::Json(v) => values.push_bind(v.map(Json)),
        };
    }
    values.push_unseparated(")");
    builder
}

fn is_unique_violation(error: &SqlxError) -> bool {
    if let SqlxError::Database(db_err) = error {
        return db_err.is_unique_violation();
    }
    false
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert_or_skip(&self, schema: &SchemaDescriptor, record: &FlatRecord) -> StorageOutcome {
        let row = match schema.bind_row(record) {
            Ok(row) => row,
            Err(detail) => {
                warn!(table = schema.table(), %detail, "Record rejected before insert");
                return StorageOutcome::Error(detail);
            },
        };

        match self.insert(schema, row).await {
            Ok(()) => StorageOutcome::Stored,
            Err(err) if is_unique_violation(&err) => {
                debug!(table = schema.table(), "Record already exists");
                StorageOutcome::AlreadyExists
            },
            Err(err) => {
                warn!(table = schema.table(), error = %err, "Failed to store record");
                StorageOutcome::Error(format!("{}: {err}", schema.table()))
            },
        }
    }
}
