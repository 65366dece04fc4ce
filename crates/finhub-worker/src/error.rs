//! Error taxonomy for the ingestion engine
//!
//! Only message-level errors ([`MalformedMessageError`], [`RegistryError`],
//! [`PipelineError`]) reach the consumer's ack/reject decision. Record-level
//! persistence failures are values ([`crate::model::StorageOutcome`]), never
//! errors.

use crate::broker::DeliveryTag;
use finhub_common::FinhubError;
use thiserror::Error;

/// Registry construction and lookup failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler '{0}' is already registered")]
    DuplicateKey(String),

    #[error("unknown handler '{0}'")]
    UnknownHandler(String),

    #[error("invalid schema for '{table}': {reason}")]
    InvalidSchema { table: String, reason: String },
}

impl RegistryError {
    pub fn invalid_schema(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchema {
            table: table.into(),
            reason: reason.into(),
        }
    }
}

/// A message body that cannot be decoded into a valid work item.
#[derive(Error, Debug)]
#[error("malformed message: {0}")]
pub struct MalformedMessageError(#[from] pub FinhubError);

/// Fetch capability failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("fetch timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("upstream returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    Request(String),
}

impl FetchError {
    /// Whether retrying the same request later can succeed.
    ///
    /// Timeouts, connection failures, 408, 429 and 5xx are transient. Other
    /// statuses and bodies that fail to decode are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Connection(_) => true,
            FetchError::Status { status, .. } => {
                matches!(*status, 408 | 429) || (500..600).contains(status)
            },
            FetchError::Decode(_) | FetchError::Request(_) => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            FetchError::Connection(err.to_string())
        } else if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_builder() {
            FetchError::Request(err.to_string())
        } else {
            FetchError::Connection(err.to_string())
        }
    }
}

/// A raw response whose shape does not match the handler's normalizer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("expected {expected}, found {found}")]
    UnexpectedShape { expected: &'static str, found: String },

    #[error("column '{column}' has {found} values, expected {expected}")]
    RaggedColumns {
        column: String,
        expected: usize,
        found: usize,
    },
}

/// Pipeline failures that abort a work item
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Fetch(err) => err.is_transient(),
            PipelineError::Normalize(_) => false,
        }
    }
}

/// Broker operation failures
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("exchange '{0}' is not declared")]
    UnknownExchange(String),

    #[error("queue '{0}' is not declared")]
    UnknownQueue(String),

    #[error("exchange '{name}' already declared as {existing}")]
    ExchangeKindMismatch { name: String, existing: String },

    #[error("delivery {0} is no longer held by this consumer")]
    StaleDelivery(DeliveryTag),
}

/// Producer failures
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("refusing to publish invalid work item: {0}")]
    InvalidItem(#[from] FinhubError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("no queue bound to '{exchange}' matches routing key '{routing_key}'")]
    Unroutable { exchange: String, routing_key: String },
}
