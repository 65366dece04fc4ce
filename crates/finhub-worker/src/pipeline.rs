//! Fetch, normalize, store
//!
//! One invocation handles one work item against one [`TaskDescriptor`]. Only
//! fetch and normalize failures abort it; storage outcomes are tallied per
//! record into the returned [`BatchResult`].

use crate::error::{FetchError, NormalizeError, PipelineError};
use crate::model::{BatchResult, FlatRecord, NormalizeContext, RawResponse};
use crate::registry::TaskDescriptor;
use crate::storage::RecordStore;
use chrono::{NaiveDate, Utc};
use finhub_common::types::{Params, WorkItem};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Stage a pipeline run is entering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetching,
    Normalizing,
    Storing,
}

pub struct Pipeline {
    store: Arc<dyn RecordStore>,
    fetch_timeout: Duration,
    fixed_date: Option<NaiveDate>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn RecordStore>, fetch_timeout: Duration) -> Self {
        Self {
            store,
            fetch_timeout,
            fixed_date: None,
        }
    }

    /// Compute date windows relative to `date` instead of today.
    pub fn with_fixed_date(mut self, date: NaiveDate) -> Self {
        self.fixed_date = Some(date);
        self
    }

    pub async fn run(
        &self,
        descriptor: &TaskDescriptor,
        item: &WorkItem,
    ) -> Result<BatchResult, PipelineError> {
        self.run_observed(descriptor, item, |_| {}).await
    }

    /// [`Pipeline::run`], calling `on_stage` as each stage begins.
    pub async fn run_observed<F>(
        &self,
        descriptor: &TaskDescriptor,
        item: &WorkItem,
        mut on_stage: F,
    ) -> Result<BatchResult, PipelineError>
    where
        F: FnMut(Stage) + Send,
    {
        let params = self.params_for(descriptor, item);

        on_stage(Stage::Fetching);
        let raw = self.fetch(descriptor, &params).await?;

        on_stage(Stage::Normalizing);
        let records = self.normalize(descriptor, item, &params, &raw)?;

        on_stage(Stage::Storing);
        if records.is_empty() {
            debug!(handler_key = %item.handler_key, subject_id = %item.subject_id, "Empty response");
            return Ok(BatchResult::new());
        }

        Ok(self.store(descriptor, &records).await)
    }

    fn params_for(&self, descriptor: &TaskDescriptor, item: &WorkItem) -> Params {
        let today = self.fixed_date.unwrap_or_else(|| Utc::now().date_naive());
        descriptor.merge_params(item, today)
    }

    /// Call the descriptor's fetcher, bounded by the fetch timeout.
    async fn fetch(&self, descriptor: &TaskDescriptor, params: &Params) -> Result<RawResponse, FetchError> {
        match tokio::time::timeout(self.fetch_timeout, descriptor.fetcher().fetch(params)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(format!(
                "{} did not respond within {:?}",
                descriptor.fetcher().describe(),
                self.fetch_timeout
            ))),
        }
    }

    fn normalize(
        &self,
        descriptor: &TaskDescriptor,
        item: &WorkItem,
        params: &Params,
        raw: &RawResponse,
    ) -> Result<Vec<FlatRecord>, NormalizeError> {
        if is_empty_response(raw) {
            return Ok(Vec::new());
        }
        let ctx = NormalizeContext {
            subject_id: &item.subject_id,
            params,
        };
        descriptor.normalizer().normalize(raw, &ctx)
    }

    /// Store records one by one, never stopping early.
    async fn store(&self, descriptor: &TaskDescriptor, records: &[FlatRecord]) -> BatchResult {
        let mut batch = BatchResult::new();
        for record in records {
            batch.record(self.store.upsert_or_skip(descriptor.target(), record).await);
        }
        batch
    }
}

/// Null, an empty string, `[]` or `{}`.
fn is_empty_response(raw: &RawResponse) -> bool {
    match raw {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
