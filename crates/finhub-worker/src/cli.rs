//! Command-line interface

use clap::{Parser, Subcommand, ValueEnum};
use finhub_common::types::DEFAULT_PRIORITY;
use serde_json::Value;
use std::path::PathBuf;

/// Finhub ingestion worker
#[derive(Parser, Debug)]
#[command(name = "finhub-worker")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BrokerKind {
    /// Queue tables in Postgres
    Postgres,
    /// In-process queue and record store, nothing persisted
    Memory,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consume work items until SIGINT or SIGTERM
    Worker {
        #[arg(long, value_enum, default_value_t = BrokerKind::Postgres)]
        broker: BrokerKind,

        /// Deliveries in flight at once (overrides WORKER_PREFETCH)
        #[arg(long)]
        prefetch: Option<usize>,
    },

    /// Publish one work item
    Publish {
        /// Handler key, e.g. company_profile2
        #[arg(long)]
        handler: String,

        /// Subject id, usually a ticker symbol
        #[arg(long)]
        subject: String,

        /// Parameter override as key=value; JSON values are parsed
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,

        /// 1 (most urgent) to 10
        #[arg(long, default_value_t = DEFAULT_PRIORITY)]
        priority: u8,
    },

    /// Publish work items for every symbol in a universe CSV
    Seed {
        /// CSV with a `symbol` column (or symbols in the first column)
        #[arg(long)]
        universe: PathBuf,

        /// Keep only rows of this exchange
        #[arg(long)]
        exchange: Option<String>,

        /// Handler keys to publish for each symbol
        #[arg(long = "handler", required = true)]
        handlers: Vec<String>,

        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,

        #[arg(long, default_value_t = DEFAULT_PRIORITY)]
        priority: u8,
    },

    /// List registered handlers and their target tables
    Handlers,

    /// Show queue depth
    Stats,

    /// Run database migrations
    Migrate,
}

/// Parse `key=value`. The value is read as JSON when it parses, else as a string.
pub fn parse_param(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{s}'"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
