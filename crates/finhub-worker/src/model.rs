//! Values flowing through one pipeline invocation

use finhub_common::types::Params;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// Opaque upstream payload. Never persisted directly.
pub type RawResponse = Value;

/// A single row-shaped record ready for storage.
pub type FlatRecord = Map<String, Value>;

/// Context handed to a normalizer alongside the raw response.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext<'a> {
    pub subject_id: &'a str,
    /// The merged parameters the fetch was made with.
    pub params: &'a Params,
}

/// Result of persisting one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOutcome {
    Stored,
    /// The composite key already exists. Not a failure.
    AlreadyExists,
    Error(String),
}

/// Per work item tally of storage outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub stored: usize,
    pub already_exists: usize,
    pub errors: Vec<String>,
}

impl BatchResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: StorageOutcome) {
        match outcome {
            StorageOutcome::Stored => self.stored += 1,
            StorageOutcome::AlreadyExists => self.already_exists += 1,
            StorageOutcome::Error(detail) => self.errors.push(detail),
        }
    }

    pub fn merge(&mut self, other: BatchResult) {
        self.stored += other.stored;
        self.already_exists += other.already_exists;
        self.errors.extend(other.errors);
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Records attempted, whatever their outcome.
    pub fn total(&self) -> usize {
        self.stored + self.already_exists + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl FromIterator<StorageOutcome> for BatchResult {
    fn from_iter<I: IntoIterator<Item = StorageOutcome>>(iter: I) -> Self {
        let mut result = BatchResult::new();
        for outcome in iter {
            result.record(outcome);
        }
        result
    }
}

impl fmt::Display for BatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stored={}, duplicate={}, errors={}",
            self.stored,
            self.already_exists,
            self.errors.len()
        )
    }
}
