//! Postgres-backed broker and record store tests
//!
//! Each test starts its own PostgreSQL container and applies the migrations.
//! Run with `cargo test -- --ignored` on a machine with Docker.

use anyhow::Result;
use finhub_common::types::WorkItem;
use finhub_worker::broker::{
    Broker, ExchangeKind, OutgoingMessage, PgBroker, QueueSpec, Rejection, Topology,
};
use finhub_worker::catalog::build_registry;
use finhub_worker::config::DatabaseConfig;
use finhub_worker::db;
use finhub_worker::error::BrokerError;
use finhub_worker::fetch::{Fetcher, FnFetcher};
use finhub_worker::storage::{PgRecordStore, RecordStore};
use finhub_worker::{
    Disposition, FetchError, Pipeline, Producer, StorageOutcome, Worker, WorkerSettings,
};
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,finhub_worker=debug")),
        )
        .with_test_writer()
        .try_init();
}

async fn start_postgres() -> Result<(ContainerAsync<Postgres>, PgPool)> {
    init_tracing();

    let container = Postgres::default().with_tag("16-alpine").start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

    let config = DatabaseConfig {
        url: url.clone(),
        max_connections: 5,
        min_connections: 1,
        connect_timeout_secs: 10,
        idle_timeout_secs: 0,
    };
    let pool = db::create_pool(&config).await?;
    db::run_migrations(&pool).await?;
    db::health_check(&pool).await?;

    Ok((container, pool))
}

fn message(body: &str, priority: u8) -> OutgoingMessage {
    OutgoingMessage::json(body.as_bytes().to_vec(), priority)
}

async fn declared_broker(pool: &PgPool, visibility_timeout: Duration) -> Result<PgBroker> {
    let broker = PgBroker::new(pool.clone(), visibility_timeout).with_poll_interval(Duration::from_millis(20));
    Topology::new("finhub_exchange", QueueSpec::durable("finhub_tasks"), "finhub_tasks")
        .declare(&broker)
        .await?;
    Ok(broker)
}

// ============================================================================
// Record store
// ============================================================================

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_record_store_classifies_duplicates() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let store = PgRecordStore::new(pool.clone());

    let registry = build_registry(|endpoint| -> Arc<dyn Fetcher> {
        Arc::new(FnFetcher::new(endpoint, |_| async { Ok::<_, FetchError>(json!(null)) }))
    })?;
    let peers = registry.resolve("company_peers")?;
    let record = json!({"symbol": "AAPL", "peer": "MSFT"}).as_object().cloned().unwrap();

    assert_eq!(store.upsert_or_skip(peers.target(), &record).await, StorageOutcome::Stored);
    assert_eq!(
        store.upsert_or_skip(peers.target(), &record).await,
        StorageOutcome::AlreadyExists
    );

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM company_peers").fetch_one(&pool).await?;
    assert_eq!(count, 1);
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_record_store_failure_is_isolated() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let store = PgRecordStore::new(pool.clone());

    let registry = build_registry(|endpoint| -> Arc<dyn Fetcher> {
        Arc::new(FnFetcher::new(endpoint, |_| async { Ok::<_, FetchError>(json!(null)) }))
    })?;
    let quotes = registry.resolve("realtime_quote")?;

    // Drop a column so inserts fail with something other than a key conflict
    sqlx::query("ALTER TABLE stock_quotes DROP COLUMN previous_close")
        .execute(&pool)
        .await?;

    let record = json!({"symbol": "AAPL", "t": 1_706_817_601, "c": 184.4})
        .as_object()
        .cloned()
        .unwrap();
    match store.upsert_or_skip(quotes.target(), &record).await {
        StorageOutcome::Error(detail) => assert!(detail.contains("stock_quotes"), "{detail}"),
        other => panic!("unexpected outcome {other:?}"),
    }

    // The pool is still usable for the next record
    let peers = registry.resolve("company_peers")?;
    let peer = json!({"symbol": "AAPL", "peer": "MSFT"}).as_object().cloned().unwrap();
    assert_eq!(store.upsert_or_skip(peers.target(), &peer).await, StorageOutcome::Stored);
    Ok(())
}

// ============================================================================
// Broker
// ============================================================================

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_broker_priority_ack_and_depth() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let broker = declared_broker(&pool, Duration::from_secs(300)).await?;

    assert_eq!(broker.publish("finhub_exchange", "finhub_tasks", message("low", 9)).await?, 1);
    assert_eq!(broker.publish("finhub_exchange", "finhub_tasks", message("high", 1)).await?, 1);
    assert_eq!(broker.publish("finhub_exchange", "elsewhere", message("lost", 1)).await?, 0);

    let first = broker.receive("finhub_tasks", Duration::ZERO).await?.unwrap();
    assert_eq!(first.body, b"high");
    assert_eq!(first.delivery_count, 1);
    assert!(first.persistent);

    let depth = broker.queue_depth("finhub_tasks").await?;
    assert_eq!((depth.ready, depth.unacked, depth.dead_lettered), (1, 1, 0));

    broker.ack(&first).await?;
    assert!(matches!(broker.ack(&first).await, Err(BrokerError::StaleDelivery(_))));

    let depth = broker.queue_depth("finhub_tasks").await?;
    assert_eq!((depth.ready, depth.unacked), (1, 0));
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_broker_reject_requeues_or_dead_letters() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let broker = declared_broker(&pool, Duration::from_secs(300)).await?;
    broker.publish("finhub_exchange", "finhub_tasks", message("{}", 5)).await?;

    let delivery = broker.receive("finhub_tasks", Duration::ZERO).await?.unwrap();
    broker
        .reject(&delivery, Rejection::requeue_after(Duration::from_secs(1)))
        .await?;

    // Held back until the delay passes
    assert!(broker.receive("finhub_tasks", Duration::ZERO).await?.is_none());
    assert_eq!(broker.queue_depth("finhub_tasks").await?.ready, 1);

    let started = Instant::now();
    let again = broker.receive("finhub_tasks", Duration::from_secs(5)).await?.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(again.tag.message_id, delivery.tag.message_id);
    assert_eq!(again.delivery_count, 2);
    assert!(again.redelivered());

    broker.reject(&again, Rejection::dead_letter("gave up")).await?;
    let depth = broker.queue_depth("finhub_tasks").await?;
    assert_eq!((depth.ready, depth.unacked, depth.dead_lettered), (0, 0, 1));

    let reason: Option<String> = sqlx::query_scalar("SELECT dead_reason FROM broker_messages WHERE id = $1")
        .bind(again.tag.message_id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(reason.as_deref(), Some("gave up"));
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_broker_reclaims_after_visibility_timeout() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let broker = declared_broker(&pool, Duration::from_secs(1)).await?;
    broker.publish("finhub_exchange", "finhub_tasks", message("{}", 5)).await?;

    let abandoned = broker.receive("finhub_tasks", Duration::ZERO).await?.unwrap();
    assert!(broker.receive("finhub_tasks", Duration::ZERO).await?.is_none());

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let reclaimed = broker.receive("finhub_tasks", Duration::ZERO).await?.unwrap();
    assert_eq!(reclaimed.tag.message_id, abandoned.tag.message_id);
    assert_ne!(reclaimed.tag.claim, abandoned.tag.claim);

    // The first claim can no longer settle the message
    assert!(broker.ack(&abandoned).await.is_err());
    broker.ack(&reclaimed).await?;
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_exchange_kind_mismatch_is_rejected() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let broker = declared_broker(&pool, Duration::from_secs(300)).await?;

    let err = broker
        .declare_exchange("finhub_exchange", ExchangeKind::Direct)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ExchangeKindMismatch { .. }), "{err:?}");
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_max_length_drops_oldest() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let broker = PgBroker::new(pool.clone(), Duration::from_secs(300));
    Topology::new(
        "finhub_exchange",
        QueueSpec::durable("bounded").with_max_length(Some(2)),
        "bounded",
    )
    .declare(&broker)
    .await?;

    for body in ["one", "two", "three"] {
        broker.publish("finhub_exchange", "bounded", message(body, 5)).await?;
    }

    let first = broker.receive("bounded", Duration::ZERO).await?.unwrap();
    assert_eq!(first.body, b"two");
    assert_eq!(broker.queue_depth("bounded").await?.ready, 1);
    Ok(())
}

// ============================================================================
// Worker over Postgres
// ============================================================================

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_worker_stores_then_skips_redelivery() -> Result<()> {
    let (_container, pool) = start_postgres().await?;
    let broker = Arc::new(declared_broker(&pool, Duration::from_secs(300)).await?);

    let registry = build_registry(|endpoint| -> Arc<dyn Fetcher> {
        Arc::new(FnFetcher::new(endpoint, |_| async {
            Ok::<_, FetchError>(json!({"ticker": "AAPL", "name": "Apple Inc", "marketCapitalization": 2_950_000.5}))
        }))
    })?;
    let pipeline = Pipeline::new(Arc::new(PgRecordStore::new(pool.clone())), Duration::from_secs(5));
    let worker = Worker::new(
        broker.clone(),
        Arc::new(registry),
        pipeline,
        WorkerSettings::new("finhub_tasks"),
    );
    let producer = Producer::new(
        broker.clone(),
        Topology::new("finhub_exchange", QueueSpec::durable("finhub_tasks"), "finhub_tasks"),
    );

    let item = WorkItem::new("AAPL", "company_profile2");
    let mut batches = Vec::new();
    for _ in 0..2 {
        producer.publish(&item).await?;
        let delivery = broker.receive("finhub_tasks", Duration::from_secs(1)).await?.unwrap();
        let outcome = worker.handle_delivery(&delivery).await;
        assert_eq!(outcome.disposition, Disposition::Acked);
        batches.push(outcome.batch.unwrap());
    }

    assert_eq!((batches[0].stored, batches[0].already_exists), (1, 0));
    assert_eq!((batches[1].stored, batches[1].already_exists), (0, 1));

    let (name, cap): (Option<String>, Option<f64>) = sqlx::query_as(
        "SELECT name, market_capitalization FROM company_profiles_v2 WHERE ticker = 'AAPL'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(name.as_deref(), Some("Apple Inc"));
    assert_eq!(cap, Some(2_950_000.5));

    let depth = broker.queue_depth("finhub_tasks").await?;
    assert_eq!((depth.ready, depth.unacked), (0, 0));
    Ok(())
}
