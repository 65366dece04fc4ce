//! Subcommand implementations

use anyhow::{Context, Result};
use finhub_common::types::{Params, WorkItem};
use finhub_common::universe::{load_symbols, UniverseFilter};
use finhub_worker::broker::{Broker, MemoryBroker, PgBroker, Topology};
use finhub_worker::catalog::{self, HANDLERS};
use finhub_worker::fetch::FinnhubClient;
use finhub_worker::producer::work_items_for;
use finhub_worker::storage::{MemoryRecordStore, PgRecordStore, RecordStore};
use finhub_worker::{db, shutdown, BrokerKind, Pipeline, Producer, Worker, WorkerConfig, WorkerSettings};
use serde_json::Value;
use sqlx::PgPool;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Record pool, plus a separate broker pool when the broker lives elsewhere.
async fn pools(config: &WorkerConfig) -> Result<(PgPool, PgPool)> {
    let records = db::create_pool(&config.database)
        .await
        .context("Failed to connect to the record database")?;
    db::health_check(&records)
        .await
        .context("Record database health check failed")?;

    let broker = if config.broker.url == config.database.url {
        records.clone()
    } else {
        broker_pool(config).await?
    };

    Ok((records, broker))
}

async fn broker_pool(config: &WorkerConfig) -> Result<PgPool> {
    let pool = db::connect(&config.broker.url, &config.database)
        .await
        .context("Failed to connect to the broker database")?;
    db::health_check(&pool)
        .await
        .context("Broker database health check failed")?;
    Ok(pool)
}

fn pg_broker(pool: PgPool, config: &WorkerConfig) -> Arc<dyn Broker> {
    Arc::new(PgBroker::new(pool, config.broker.visibility_timeout()))
}

pub async fn run_worker(
    config: &WorkerConfig,
    kind: BrokerKind,
    prefetch: Option<usize>,
) -> Result<()> {
    let client = FinnhubClient::new(
        config.require_api_key()?,
        &config.finnhub.base_url,
        config.finnhub.fetch_timeout(),
    )?;
    let registry = Arc::new(catalog::finnhub_registry(Arc::new(client))?);

    let (broker, store): (Arc<dyn Broker>, Arc<dyn RecordStore>) = match kind {
        BrokerKind::Postgres => {
            let (records, broker) = pools(config).await?;
            (pg_broker(broker, config), Arc::new(PgRecordStore::new(records)))
        },
        BrokerKind::Memory => {
            warn!("Memory broker selected: nothing is persisted and the queue starts empty");
            (Arc::new(MemoryBroker::new()), Arc::new(MemoryRecordStore::new()))
        },
    };

    Topology::from_config(&config.broker)
        .declare(broker.as_ref())
        .await
        .context("Failed to declare broker topology")?;

    let mut settings = WorkerSettings::from_config(config);
    if let Some(prefetch) = prefetch {
        settings = settings.with_prefetch(prefetch);
    }

    info!(
        queue = %settings.queue,
        prefetch = settings.prefetch,
        handlers = registry.len(),
        "Starting worker"
    );

    let pipeline = Pipeline::new(store, config.finnhub.fetch_timeout());
    let worker = Arc::new(Worker::new(broker, registry, pipeline, settings));

    let token = CancellationToken::new();
    let listener = shutdown::cancel_on(shutdown::shutdown_signal(), token.clone());

    let stats = worker.run(token.clone()).await;
    token.cancel();
    let _ = listener.await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

pub async fn publish(
    config: &WorkerConfig,
    handler: &str,
    subject: &str,
    params: &[(String, Value)],
    priority: u8,
) -> Result<()> {
    if !HANDLERS.iter().any(|&(key, _)| key == handler) {
        warn!(handler, "Handler is not in the catalog; workers will dead-letter this item");
    }

    let item = WorkItem::new(subject, handler)
        .with_params(params.iter().cloned().collect())
        .with_priority(priority);

    let producer = Producer::new(
        pg_broker(broker_pool(config).await?, config),
        Topology::from_config(&config.broker),
    );
    producer.publish(&item).await?;

    println!("Published {handler} for {subject} (priority {priority})");
    Ok(())
}

pub async fn seed(
    config: &WorkerConfig,
    universe: &Path,
    exchange: Option<&str>,
    handlers: &[String],
    params: &[(String, Value)],
    priority: u8,
) -> Result<()> {
    for handler in handlers {
        if !HANDLERS.iter().any(|&(key, _)| key == handler) {
            warn!(handler = %handler, "Handler is not in the catalog");
        }
    }

    let filter = UniverseFilter {
        exchange: exchange.map(str::to_string),
    };
    let symbols = load_symbols(universe, &filter)?;
    let params: Params = params.iter().cloned().collect();
    let items = work_items_for(&symbols, handlers, &params, priority);

    let producer = Producer::new(
        pg_broker(broker_pool(config).await?, config),
        Topology::from_config(&config.broker),
    );
    let report = producer.publish_batch(&items).await;

    println!(
        "Published {} of {} work items ({} symbols x {} handlers)",
        report.published,
        items.len(),
        symbols.len(),
        handlers.len()
    );
    if !report.is_complete() {
        anyhow::bail!("{} work items failed to publish", report.failed.len());
    }
    Ok(())
}

pub fn handlers() -> Result<()> {
    // Descriptions only; the key is never sent
    let client = FinnhubClient::new(
        "",
        finhub_worker::config::DEFAULT_FINNHUB_BASE_URL,
        std::time::Duration::from_secs(1),
    )?;
    let registry = catalog::finnhub_registry(Arc::new(client))?;

    println!("{:<24} {:<32} {:<26} KEY", "HANDLER", "ENDPOINT", "TABLE");
    for key in registry.keys() {
        let descriptor = registry.resolve(key)?;
        println!(
            "{:<24} {:<32} {:<26} {}",
            descriptor.handler_key(),
            descriptor.fetcher().describe(),
            descriptor.target().table(),
            descriptor.target().key().join(", ")
        );
    }
    Ok(())
}

pub async fn stats(config: &WorkerConfig) -> Result<()> {
    let broker = pg_broker(broker_pool(config).await?, config);
    let depth = broker.queue_depth(&config.broker.queue).await?;
    println!("{}: {}", config.broker.queue, depth);
    Ok(())
}

pub async fn migrate(config: &WorkerConfig) -> Result<()> {
    let (records, broker) = pools(config).await?;
    db::run_migrations(&records).await?;
    if config.broker.url != config.database.url {
        db::run_migrations(&broker).await?;
    }
    println!("Migrations applied");
    Ok(())
}
