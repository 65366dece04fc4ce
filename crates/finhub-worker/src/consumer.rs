//! Consumer / worker
//!
//! A worker pulls deliveries from one queue and walks each through
//!
//! ```text
//! Idle -> Dispatched -> Fetching -> Normalizing -> Storing -> Acked
//!                 \            \             \
//!                  +------------+-------------+--> Rejected { requeue }
//! ```
//!
//! Malformed bodies, unknown handlers, permanent fetch errors and responses the
//! normalizer cannot read are rejected without requeue (dead-lettered).
//! Transient fetch errors requeue until the delivery has been attempted
//! `max_redeliveries` times, then dead-letter too. Each requeue holds the
//! message back for `retry_backoff`, doubling per delivery up to
//! `max_retry_backoff`. A pipeline that ran to the end is acked even when some
//! records failed to store.

use crate::broker::{Broker, Delivery, Rejection};
use crate::config::WorkerConfig;
use crate::error::{MalformedMessageError, PipelineError};
use crate::model::BatchResult;
use crate::pipeline::{Pipeline, Stage};
use crate::registry::TaskRegistry;
use finhub_common::types::WorkItem;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on the wait between attempts after broker errors.
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Idle,
    Dispatched,
    Fetching,
    Normalizing,
    Storing,
    Acked,
    Rejected { requeue: bool },
}

impl From<Stage> for WorkerState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Fetching => WorkerState::Fetching,
            Stage::Normalizing => WorkerState::Normalizing,
            Stage::Storing => WorkerState::Storing,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => f.write_str("idle"),
            WorkerState::Dispatched => f.write_str("dispatched"),
            WorkerState::Fetching => f.write_str("fetching"),
            WorkerState::Normalizing => f.write_str("normalizing"),
            WorkerState::Storing => f.write_str("storing"),
            WorkerState::Acked => f.write_str("acked"),
            WorkerState::Rejected { requeue: true } => f.write_str("rejected(requeue)"),
            WorkerState::Rejected { requeue: false } => f.write_str("rejected"),
        }
    }
}

/// What happened to a delivery at the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Acked,
    Requeued,
    DeadLettered,
}

impl Disposition {
    fn terminal_state(self) -> WorkerState {
        match self {
            Disposition::Acked => WorkerState::Acked,
            Disposition::Requeued => WorkerState::Rejected { requeue: true },
            Disposition::DeadLettered => WorkerState::Rejected { requeue: false },
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Disposition::Acked => "acked",
            Disposition::Requeued => "requeued",
            Disposition::DeadLettered => "dead_lettered",
        })
    }
}

/// Result of handling one delivery
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub disposition: Disposition,
    /// States visited, from `Dispatched` to the terminal state.
    pub states: Vec<WorkerState>,
    /// Present when the pipeline ran to completion.
    pub batch: Option<BatchResult>,
    /// Present when the body decoded.
    pub item: Option<WorkItem>,
    /// Why the delivery was rejected.
    pub reason: Option<String>,
    /// How long a requeued delivery is held back.
    pub retry_in: Option<Duration>,
    /// Whether the broker accepted the ack or reject.
    pub settled: bool,
}

impl DeliveryOutcome {
    pub fn final_state(&self) -> WorkerState {
        self.states
            .last()
            .copied()
            .unwrap_or(WorkerState::Idle)
    }
}

/// Cumulative counters of a worker run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub records_stored: u64,
    pub records_duplicate: u64,
    pub record_errors: u64,
    pub settle_failures: u64,
    pub panicked: u64,
}

impl WorkerStats {
    pub fn observe(&mut self, outcome: &DeliveryOutcome) {
        self.received += 1;
        match outcome.disposition {
            Disposition::Acked => self.acked += 1,
            Disposition::Requeued => self.requeued += 1,
            Disposition::DeadLettered => self.dead_lettered += 1,
        }
        if let Some(batch) = &outcome.batch {
            self.records_stored += batch.stored as u64;
            self.records_duplicate += batch.already_exists as u64;
            self.record_errors += batch.error_count() as u64;
        }
        if !outcome.settled {
            self.settle_failures += 1;
        }
    }
}

/// Consumer loop tuning
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue: String,
    /// Deliveries in flight at once.
    pub prefetch: usize,
    /// Attempts before a transient failure is dead-lettered.
    pub max_redeliveries: u32,
    /// Requeue delay after the first failed delivery.
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    /// How long one receive waits for a message.
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight deliveries.
    pub shutdown_timeout: Duration,
}

impl WorkerSettings {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch: crate::config::DEFAULT_WORKER_PREFETCH,
            max_redeliveries: crate::config::DEFAULT_WORKER_MAX_REDELIVERIES,
            retry_backoff: Duration::from_millis(crate::config::DEFAULT_WORKER_RETRY_BACKOFF_MS),
            max_retry_backoff: Duration::from_millis(crate::config::DEFAULT_WORKER_MAX_RETRY_BACKOFF_MS),
            poll_interval: Duration::from_millis(crate::config::DEFAULT_WORKER_POLL_INTERVAL_MS),
            shutdown_timeout: Duration::from_secs(crate::config::DEFAULT_WORKER_SHUTDOWN_TIMEOUT_SECS),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            queue: config.broker.queue.clone(),
            prefetch: config.worker.prefetch.max(1),
            max_redeliveries: config.worker.max_redeliveries.max(1),
            retry_backoff: config.worker.retry_backoff(),
            max_retry_backoff: config.worker.max_retry_backoff(),
            poll_interval: config.worker.poll_interval(),
            shutdown_timeout: config.worker.shutdown_timeout(),
        }
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = max_redeliveries.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// First requeue delay and its ceiling.
    pub fn with_retry_backoff(mut self, backoff: Duration, max: Duration) -> Self {
        self.retry_backoff = backoff;
        self.max_retry_backoff = max.max(backoff);
        self
    }

    /// Delay before redelivering a message that failed its `delivery_count`th delivery.
    pub fn requeue_delay(&self, delivery_count: u32) -> Duration {
        let doublings = delivery_count.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1 << doublings)
            .min(self.max_retry_backoff)
    }
}

enum Verdict {
    Ack(BatchResult),
    Requeue { delay: Duration, reason: String },
    DeadLetter { reason: String },
}

pub struct Worker {
    broker: Arc<dyn Broker>,
    registry: Arc<TaskRegistry>,
    pipeline: Pipeline,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<TaskRegistry>,
        pipeline: Pipeline,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            broker,
            registry,
            pipeline,
            settings,
        }
    }

    /// Run one delivery through the state machine and settle it.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> DeliveryOutcome {
        let mut states = vec![WorkerState::Dispatched];
        debug!(
            tag = %delivery.tag,
            delivery_count = delivery.delivery_count,
            state = %WorkerState::Dispatched,
            "Worker state"
        );

        let item = match WorkItem::from_json_slice(&delivery.body).map_err(MalformedMessageError) {
            Ok(item) => item,
            Err(err) => {
                let verdict = Verdict::DeadLetter {
                    reason: err.to_string(),
                };
                return self.settle(delivery, None, states, verdict).await;
            },
        };

        let verdict = self.process(delivery, &item, &mut states).await;
        self.settle(delivery, Some(item), states, verdict).await
    }

    async fn process(&self, delivery: &Delivery, item: &WorkItem, states: &mut Vec<WorkerState>) -> Verdict {
        let descriptor = match self.registry.resolve(&item.handler_key) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                return Verdict::DeadLetter {
                    reason: err.to_string(),
                }
            },
        };

        let result = self
            .pipeline
            .run_observed(&descriptor, item, |stage| {
                let state = WorkerState::from(stage);
                debug!(
                    handler_key = %item.handler_key,
                    subject_id = %item.subject_id,
                    state = %state,
                    "Worker state"
                );
                states.push(state);
            })
            .await;

        match result {
            Ok(batch) => Verdict::Ack(batch),
            Err(err) => self.failure(delivery, err),
        }
    }

    fn failure(&self, delivery: &Delivery, err: PipelineError) -> Verdict {
        if !err.is_transient() {
            return Verdict::DeadLetter {
                reason: err.to_string(),
            };
        }
        if delivery.delivery_count >= self.settings.max_redeliveries {
            return Verdict::DeadLetter {
                reason: format!(
                    "{err} (gave up after {} deliveries)",
                    delivery.delivery_count
                ),
            };
        }
        Verdict::Requeue {
            delay: self.settings.requeue_delay(delivery.delivery_count),
            reason: err.to_string(),
        }
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        item: Option<WorkItem>,
        mut states: Vec<WorkerState>,
        verdict: Verdict,
    ) -> DeliveryOutcome {
        let (disposition, batch, reason, retry_in) = match verdict {
            Verdict::Ack(batch) => (Disposition::Acked, Some(batch), None, None),
            Verdict::Requeue { delay, reason } => (Disposition::Requeued, None, Some(reason), Some(delay)),
            Verdict::DeadLetter { reason } => (Disposition::DeadLettered, None, Some(reason), None),
        };

        let terminal = disposition.terminal_state();
        debug!(
            tag = %delivery.tag,
            state = %terminal,
            retry_in_ms = retry_in.map(|d| d.as_millis() as u64),
            "Worker state"
        );

        let result = match disposition {
            Disposition::Acked => self.broker.ack(delivery).await,
            Disposition::Requeued => {
                let rejection = Rejection::requeue_after(retry_in.unwrap_or_default());
                self.broker.reject(delivery, rejection).await
            },
            Disposition::DeadLettered => {
                let rejection = Rejection::dead_letter(reason.clone().unwrap_or_default());
                self.broker.reject(delivery, rejection).await
            },
        };

        let settled = match result {
            Ok(()) => true,
            Err(err) => {
                warn!(tag = %delivery.tag, error = %err, "Failed to settle delivery");
                false
            },
        };

        states.push(terminal);
        let outcome = DeliveryOutcome {
            disposition,
            states,
            batch,
            item,
            reason,
            retry_in,
            settled,
        };
        log_outcome(delivery, &outcome);
        outcome
    }

    /// Consume until `shutdown` fires, then drain in-flight deliveries.
    ///
    /// At most `prefetch` deliveries are handled concurrently. Broker errors
    /// back off and retry; they never end the loop.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> WorkerStats {
        let permits = Arc::new(Semaphore::new(self.settings.prefetch));
        let mut tasks: JoinSet<DeliveryOutcome> = JoinSet::new();
        let mut stats = WorkerStats::default();
        let mut backoff = self.settings.poll_interval;

        info!(
            queue = %self.settings.queue,
            prefetch = self.settings.prefetch,
            max_redeliveries = self.settings.max_redeliveries,
            "Worker started"
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                record_joined(&mut stats, joined);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if shutdown.is_cancelled() {
                break;
            }

            // Not raced against shutdown: a claim dropped mid-flight would sit
            // unacked until the visibility timeout.
            match self
                .broker
                .receive(&self.settings.queue, self.settings.poll_interval)
                .await
            {
                Ok(Some(delivery)) => {
                    backoff = self.settings.poll_interval;
                    let worker = Arc::clone(&self);
                    tasks.spawn(async move {
                        let _permit = permit;
                        worker.handle_delivery(&delivery).await
                    });
                },
                Ok(None) => drop(permit),
                Err(err) => {
                    drop(permit);
                    warn!(queue = %self.settings.queue, error = %err, backoff_ms = backoff.as_millis() as u64, "Receive failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {},
                    }
                    backoff = (backoff * 2).clamp(Duration::from_millis(100), MAX_ERROR_BACKOFF);
                },
            }
        }

        info!(in_flight = tasks.len(), "Worker stopping, draining in-flight deliveries");
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                record_joined(&mut stats, joined);
            }
        };
        if tokio::time::timeout(self.settings.shutdown_timeout, drain).await.is_err() {
            warn!(
                abandoned = tasks.len(),
                "Shutdown timeout reached, abandoning in-flight deliveries"
            );
            tasks.abort_all();
        }

        info!(
            received = stats.received,
            acked = stats.acked,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            "Worker stopped"
        );
        stats
    }
}

fn record_joined(stats: &mut WorkerStats, joined: Result<DeliveryOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => stats.observe(&outcome),
        Err(err) => {
            stats.panicked += 1;
            error!(error = %err, "Delivery task failed");
        },
    }
}

fn log_outcome(delivery: &Delivery, outcome: &DeliveryOutcome) {
    let handler_key = outcome.item.as_ref().map_or("-", |i| i.handler_key.as_str());
    let subject_id = outcome.item.as_ref().map_or("-", |i| i.subject_id.as_str());
    let batch = outcome.batch.clone().unwrap_or_default();

    match outcome.disposition {
        Disposition::Acked => info!(
            handler_key,
            subject_id,
            disposition = %outcome.disposition,
            delivery_count = delivery.delivery_count,
            "{batch}"
        ),
        _ => warn!(
            handler_key,
            subject_id,
            disposition = %outcome.disposition,
            delivery_count = delivery.delivery_count,
            reason = outcome.reason.as_deref().unwrap_or(""),
            "{batch}"
        ),
    }

    for detail in &batch.errors {
        debug!(handler_key, subject_id, %detail, "Record not stored");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, OutgoingMessage, QueueSpec, Topology};
    use crate::error::FetchError;
    use crate::fetch::{Fetcher, FnFetcher};
    use crate::registry::TaskDescriptor;
    use crate::schema::SchemaDescriptor;
    use crate::storage::MemoryRecordStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn setup(fetcher: Arc<dyn Fetcher>) -> (Arc<MemoryBroker>, Worker) {
        let broker = Arc::new(MemoryBroker::new());
        let topology = Topology::new("finhub_exchange", QueueSpec::durable("finhub_tasks"), "finhub_tasks");
        topology.declare(broker.as_ref()).await.unwrap();

        let schema = SchemaDescriptor::builder("company_profiles_v2")
            .text("ticker")
            .text("name")
            .key(["ticker"])
            .build()
            .unwrap();
        let mut registry = TaskRegistry::new();
        registry
            .register(TaskDescriptor::builder("company_profile2", fetcher, schema).build())
            .unwrap();

        let pipeline = Pipeline::new(Arc::new(MemoryRecordStore::new()), Duration::from_secs(1));
        let settings = WorkerSettings::new("finhub_tasks")
            .with_max_redeliveries(2)
            .with_retry_backoff(Duration::ZERO, Duration::ZERO)
            .with_poll_interval(Duration::from_millis(20));
        let worker = Worker::new(broker.clone(), Arc::new(registry), pipeline, settings);
        (broker, worker)
    }

    fn profile_fetcher() -> Arc<dyn Fetcher> {
        Arc::new(FnFetcher::new("profile", |_| async {
            Ok::<_, FetchError>(json!({"ticker": "AAPL", "name": "Apple Inc"}))
        }))
    }

    fn failing_fetcher(status: u16) -> Arc<dyn Fetcher> {
        Arc::new(FnFetcher::new("failing", move |_| async move {
            Err::<serde_json::Value, _>(FetchError::Status {
                status,
                message: "upstream".into(),
            })
        }))
    }

    async fn publish(broker: &MemoryBroker, body: Vec<u8>) {
        broker
            .publish("finhub_exchange", "finhub_tasks", OutgoingMessage::json(body, 5))
            .await
            .unwrap();
    }

    async fn deliver(broker: &MemoryBroker, body: Vec<u8>) -> Delivery {
        publish(broker, body).await;
        broker
            .receive("finhub_tasks", Duration::ZERO)
            .await
            .unwrap()
            .unwrap()
    }

    fn body(subject: &str) -> Vec<u8> {
        WorkItem::new(subject, "company_profile2").to_json_bytes().unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_visits_every_state() {
        let (broker, worker) = setup(profile_fetcher()).await;

        let outcome = worker.handle_delivery(&deliver(&broker, body("AAPL")).await).await;
        assert_eq!(
            outcome.states,
            vec![
                WorkerState::Dispatched,
                WorkerState::Fetching,
                WorkerState::Normalizing,
                WorkerState::Storing,
                WorkerState::Acked,
            ]
        );
        assert_eq!(outcome.batch.unwrap().stored, 1);
        assert!(outcome.settled);
        assert_eq!(broker.queue_depth("finhub_tasks").await.unwrap().unacked, 0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_dead_lettered() {
        let (broker, worker) = setup(profile_fetcher()).await;

        let outcome = worker
            .handle_delivery(&deliver(&broker, b"not json".to_vec()).await)
            .await;
        assert_eq!(outcome.disposition, Disposition::DeadLettered);
        assert_eq!(
            outcome.states,
            vec![WorkerState::Dispatched, WorkerState::Rejected { requeue: false }]
        );
        assert!(outcome.item.is_none());
        assert_eq!(broker.dead_letters("finhub_tasks").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let fetcher: Arc<dyn Fetcher> = Arc::new(FnFetcher::new("flaky", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<serde_json::Value, _>(FetchError::Status {
                    status: 503,
                    message: "unavailable".into(),
                })
            }
        }));
        let (broker, worker) = setup(fetcher).await;

        let first = worker.handle_delivery(&deliver(&broker, body("AAPL")).await).await;
        assert_eq!(first.disposition, Disposition::Requeued);

        let redelivered = broker
            .receive("finhub_tasks", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.delivery_count, 2);
        let second = worker.handle_delivery(&redelivered).await;
        assert_eq!(second.disposition, Disposition::DeadLettered);
        assert!(second.reason.unwrap().contains("gave up"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_requeue_delay_doubles_up_to_ceiling() {
        let settings = WorkerSettings::new("finhub_tasks")
            .with_retry_backoff(Duration::from_secs(5), Duration::from_secs(30));

        let delays: Vec<u64> = (1..=5).map(|n| settings.requeue_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30]);
        assert_eq!(settings.requeue_delay(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_item_waits_before_redelivery() {
        let (broker, worker) = setup(failing_fetcher(429)).await;
        let worker = Worker {
            settings: worker
                .settings
                .clone()
                .with_max_redeliveries(5)
                .with_retry_backoff(Duration::from_secs(2), Duration::from_secs(60)),
            ..worker
        };

        let first = worker.handle_delivery(&deliver(&broker, body("AAPL")).await).await;
        assert_eq!(first.disposition, Disposition::Requeued);
        assert_eq!(first.retry_in, Some(Duration::from_secs(2)));
        assert!(broker
            .receive("finhub_tasks", Duration::from_secs(1))
            .await
            .unwrap()
            .is_none());

        let second = broker
            .receive("finhub_tasks", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        let outcome = worker.handle_delivery(&second).await;
        assert_eq!(outcome.retry_in, Some(Duration::from_secs(4)));
    }

    #[tokio::test]
    async fn test_permanent_fetch_error_is_not_retried() {
        let (broker, worker) = setup(failing_fetcher(403)).await;

        let outcome = worker.handle_delivery(&deliver(&broker, body("AAPL")).await).await;
        assert_eq!(outcome.final_state(), WorkerState::Rejected { requeue: false });
        assert_eq!(outcome.states.len(), 3);
        assert_eq!(broker.queue_depth("finhub_tasks").await.unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_run_drains_and_stops_on_shutdown() {
        let (broker, worker) = setup(profile_fetcher()).await;
        for subject in ["AAPL", "MSFT", "GOOG"] {
            publish(&broker, body(subject)).await;
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(worker).run(shutdown.clone()));

        for _ in 0..200 {
            let depth = broker.queue_depth("finhub_tasks").await.unwrap();
            if depth.ready == 0 && depth.unacked == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();

        let stats = handle.await.unwrap();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.acked, 3);
        // every fetch answers with the AAPL profile
        assert_eq!(stats.records_stored, 1);
        assert_eq!(stats.records_duplicate, 2);
    }
}
