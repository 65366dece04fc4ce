//! Finhub Worker Library
//!
//! Task dispatch and idempotent ingestion of Finnhub market data.
//!
//! # Overview
//!
//! - **Registry**: handler key to fetch, normalize and store triple ([`registry`], [`catalog`])
//! - **Producer**: publishes work items to a durable topic exchange ([`producer`])
//! - **Worker**: consumes work items and settles each delivery ([`consumer`])
//! - **Pipeline**: fetch, normalize, store for one work item ([`pipeline`])
//! - **Storage**: one record, one transaction; duplicates are skipped ([`storage`])
//! - **Broker**: Postgres-backed queue with an in-memory twin ([`broker`])

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod broker;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod fetch;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod producer;
pub mod registry;
pub mod schema;
pub mod shutdown;
pub mod storage;

pub use cli::{BrokerKind, Cli, Commands};
pub use config::WorkerConfig;
pub use consumer::{DeliveryOutcome, Disposition, Worker, WorkerSettings, WorkerState, WorkerStats};
pub use error::{FetchError, PipelineError, PublishError, RegistryError};
pub use model::{BatchResult, StorageOutcome};
pub use pipeline::Pipeline;
pub use producer::Producer;
pub use registry::{TaskDescriptor, TaskRegistry};
