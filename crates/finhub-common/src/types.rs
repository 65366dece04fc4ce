//! Wire types shared by producers and workers

use crate::error::{FinhubError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Loosely typed parameter map passed to a fetch capability.
pub type Params = Map<String, Value>;

/// Highest priority a work item can carry.
pub const MIN_PRIORITY: u8 = 1;

/// Lowest priority a work item can carry.
pub const MAX_PRIORITY: u8 = 10;

/// Priority assigned when the producer does not set one.
pub const DEFAULT_PRIORITY: u8 = 5;

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

/// A queued unit of work naming a subject and a handler key.
///
/// Serialized as `{"subjectId", "handlerKey", "params", "priority"}`. Older
/// publishers sent `symbol` and `handler`; both spellings are accepted on
/// decode, only the camelCase form is written.
///
/// A work item has no identity of its own: a redelivered message decodes to an
/// equal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    #[serde(alias = "symbol")]
    pub subject_id: String,

    #[serde(alias = "handler")]
    pub handler_key: String,

    /// Overrides merged on top of the handler's default parameters.
    #[serde(default, alias = "overrideParams")]
    pub params: Params,

    /// 1 is the most urgent, 10 the least.
    #[serde(default = "default_priority")]
    pub priority: u8,
}

impl WorkItem {
    pub fn new(subject_id: impl Into<String>, handler_key: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            handler_key: handler_key.into(),
            params: Params::new(),
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params.extend(params);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.subject_id.trim().is_empty() {
            return Err(FinhubError::InvalidWorkItem("subjectId is empty".to_string()));
        }
        if self.handler_key.trim().is_empty() {
            return Err(FinhubError::InvalidWorkItem("handlerKey is empty".to_string()));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(FinhubError::InvalidWorkItem(format!(
                "priority {} outside {}..={}",
                self.priority, MIN_PRIORITY, MAX_PRIORITY
            )));
        }
        Ok(())
    }

    /// Encode for publishing. Invalid items are refused before they hit the wire.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message body and validate it.
    pub fn from_json_slice(body: &[u8]) -> Result<Self> {
        let item: WorkItem = serde_json::from_slice(body)?;
        item.validate()?;
        Ok(item)
    }
}
