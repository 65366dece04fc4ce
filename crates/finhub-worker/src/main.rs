//! Finhub worker - main entry point

mod commands;

use clap::Parser;
use finhub_common::logging::{init_logging, LogConfig, LogLevel};
use finhub_worker::{Cli, Commands, WorkerConfig};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let base = LogConfig::builder()
        .level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        })
        .log_file_prefix("finhub-worker")
        .build();

    // LOG_* variables take precedence over the flag
    let log_config = LogConfig::from_env_with(base.clone()).unwrap_or(base);

    let guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {e}");
            process::exit(1);
        },
    };

    if let Err(e) = execute_command(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        drop(guard);
        process::exit(1);
    }
}

async fn execute_command(cli: &Cli) -> anyhow::Result<()> {
    let config = WorkerConfig::load()?;

    match &cli.command {
        Commands::Worker { broker, prefetch } => {
            commands::run_worker(&config, *broker, *prefetch).await
        },

        Commands::Publish {
            handler,
            subject,
            params,
            priority,
        } => commands::publish(&config, handler, subject, params, *priority).await,

        Commands::Seed {
            universe,
            exchange,
            handlers,
            params,
            priority,
        } => {
            commands::seed(&config, universe, exchange.as_deref(), handlers, params, *priority).await
        },

        Commands::Handlers => commands::handlers(),

        Commands::Stats => commands::stats(&config).await,

        Commands::Migrate => commands::migrate(&config).await,
    }
}
