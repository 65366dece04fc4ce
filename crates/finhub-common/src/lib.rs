//! Finhub Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging and error handling for the Finhub ingestion workspace.
//!
//! - **Work items**: the wire format exchanged between producers and workers
//! - **Logging**: one place to configure `tracing` for every binary
//! - **Universe**: loading the list of subjects (ticker symbols) to seed work for
//!
//! # Example
//!
//! ```no_run
//! use finhub_common::types::WorkItem;
//!
//! let item = WorkItem::new("AAPL", "company_profile2");
//! let body = item.to_json_bytes()?;
//! let decoded = WorkItem::from_json_slice(&body)?;
//! assert_eq!(item, decoded);
//! # Ok::<(), finhub_common::FinhubError>(())
//! ```

pub mod error;
pub mod logging;
pub mod types;
pub mod universe;

pub use error::{FinhubError, Result};
