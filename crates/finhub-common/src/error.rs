//! Error types shared across Finhub crates

use thiserror::Error;

/// Result type alias for shared Finhub operations
pub type Result<T> = std::result::Result<T, FinhubError>;

/// Errors raised by the shared crate
#[derive(Error, Debug)]
pub enum FinhubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The payload decoded but violates the work item contract.
    #[error("Invalid work item: {0}")]
    InvalidWorkItem(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
