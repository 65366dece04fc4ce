//! In-process broker
//!
//! Same delivery semantics as [`super::PgBroker`] without durability. Used by
//! tests and by `finhub-worker worker --broker memory` dry runs.

use super::{
    Broker, Delivery, DeliveryTag, ExchangeKind, OutgoingMessage, QueueDepth, QueueSpec,
    Rejection,
};
use crate::error::BrokerError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    routing_key: String,
    body: Vec<u8>,
    content_type: String,
    persistent: bool,
    priority: u8,
    delivery_count: u32,
    enqueued_at: Instant,
    /// Not deliverable before this instant.
    visible_at: Instant,
}

enum Claim {
    Claimed(Delivery),
    Empty,
    /// Only delayed messages are ready; the earliest becomes visible then.
    NotBefore(Instant),
}

/// A message rejected without requeue.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: i64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub delivery_count: u32,
    pub reason: String,
}

#[derive(Debug)]
struct MemoryQueue {
    spec: QueueSpec,
    /// Keyed by (priority, id) so iteration order is delivery order.
    ready: BTreeMap<(u8, i64), StoredMessage>,
    unacked: HashMap<i64, (Uuid, StoredMessage)>,
    dead: Vec<DeadLetter>,
}

impl MemoryQueue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: BTreeMap::new(),
            unacked: HashMap::new(),
            dead: Vec::new(),
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let Some(ttl) = self.spec.message_ttl else {
            return;
        };
        let before = self.ready.len();
        self.ready.retain(|_, msg| now.duration_since(msg.enqueued_at) < ttl);
        let expired = before - self.ready.len();
        if expired > 0 {
            debug!(queue = %self.spec.name, expired, "Discarded expired messages");
        }
    }

    fn enforce_max_length(&mut self) {
        let Some(max) = self.spec.max_length else {
            return;
        };
        while self.ready.len() as u64 > max {
            let oldest = self
                .ready
                .iter()
                .min_by_key(|(_, msg)| msg.id)
                .map(|(key, _)| *key);
            match oldest {
                Some(key) => {
                    self.ready.remove(&key);
                    warn!(queue = %self.spec.name, message_id = key.1, "Queue full, dropped oldest message");
                },
                None => break,
            }
        }
    }

    fn enqueue(&mut self, msg: StoredMessage) {
        self.ready.insert((msg.priority, msg.id), msg);
    }
}

#[derive(Debug, Default)]
struct Inner {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<(String, String, String)>,
    next_id: i64,
}

impl Inner {
    fn queue_mut(&mut self, name: &str) -> Result<&mut MemoryQueue, BrokerError> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    arrivals: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages dead-lettered on `queue`, oldest first.
    pub async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BrokerError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.queue_mut(queue)?.dead.clone())
    }

    async fn try_claim(&self, queue: &str) -> Result<Claim, BrokerError> {
        let mut inner = self.inner.lock().await;
        let q = inner.queue_mut(queue)?;
        let now = Instant::now();
        q.purge_expired(now);

        let visible = q
            .ready
            .iter()
            .find(|(_, msg)| msg.visible_at <= now)
            .map(|(key, _)| *key);
        let Some(mut msg) = visible.and_then(|key| q.ready.remove(&key)) else {
            return Ok(match q.ready.values().map(|msg| msg.visible_at).min() {
                Some(at) => Claim::NotBefore(at),
                None => Claim::Empty,
            });
        };

        msg.delivery_count += 1;
        let claim = Uuid::new_v4();
        let delivery = Delivery {
            tag: DeliveryTag {
                message_id: msg.id,
                claim,
            },
            queue: queue.to_string(),
            routing_key: msg.routing_key.clone(),
            body: msg.body.clone(),
            content_type: msg.content_type.clone(),
            persistent: msg.persistent,
            priority: msg.priority,
            delivery_count: msg.delivery_count,
        };
        q.unacked.insert(msg.id, (claim, msg));
        Ok(Claim::Claimed(delivery))
    }

    async fn settle(&self, delivery: &Delivery) -> Result<(StoredMessage, tokio::sync::MutexGuard<'_, Inner>), BrokerError> {
        let mut inner = self.inner.lock().await;
        let q = inner.queue_mut(&delivery.queue)?;
        match q.unacked.get(&delivery.tag.message_id) {
            Some((claim, _)) if *claim == delivery.tag.claim => {},
            _ => return Err(BrokerError::StaleDelivery(delivery.tag)),
        }
        let (_, msg) = q
            .unacked
            .remove(&delivery.tag.message_id)
            .ok_or(BrokerError::StaleDelivery(delivery.tag))?;
        Ok((msg, inner))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        match inner.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::ExchangeKindMismatch {
                name: name.to_string(),
                existing: existing.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                inner.exchanges.insert(name.to_string(), kind);
                Ok(())
            },
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        match inner.queues.get_mut(&spec.name) {
            Some(queue) => queue.spec = spec.clone(),
            None => {
                inner
                    .queues
                    .insert(spec.name.clone(), MemoryQueue::new(spec.clone()));
            },
        }
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        if !inner.exchanges.contains_key(exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }
        if !inner.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        let binding = (queue.to_string(), exchange.to_string(), binding_key.to_string());
        if !inner.bindings.contains(&binding) {
            inner.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<usize, BrokerError> {
        let mut inner = self.inner.lock().await;
        let kind = *inner
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        let mut targets: Vec<String> = inner
            .bindings
            .iter()
            .filter(|(_, ex, key)| ex == exchange && kind.routes(key, routing_key))
            .map(|(queue, _, _)| queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        let now = Instant::now();
        for queue in &targets {
            inner.next_id += 1;
            let msg = StoredMessage {
                id: inner.next_id,
                routing_key: routing_key.to_string(),
                body: message.body.clone(),
                content_type: message.content_type.clone(),
                persistent: message.persistent,
                priority: message.priority,
                delivery_count: 0,
                enqueued_at: now,
                visible_at: now,
            };
            let q = inner.queue_mut(queue)?;
            q.enqueue(msg);
            q.enforce_max_length();
        }
        drop(inner);

        if !targets.is_empty() {
            self.arrivals.notify_waiters();
        }
        Ok(targets.len())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let wake = match self.try_claim(queue).await? {
                Claim::Claimed(delivery) => return Ok(Some(delivery)),
                Claim::Empty => deadline,
                Claim::NotBefore(at) => at.min(deadline),
            };

            if tokio::time::timeout_at(wake, arrival).await.is_err() && Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.settle(delivery).await?;
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, rejection: Rejection) -> Result<(), BrokerError> {
        let (mut msg, mut inner) = self.settle(delivery).await?;
        let q = inner.queue_mut(&delivery.queue)?;
        match rejection {
            Rejection::Requeue { delay } => {
                msg.visible_at = Instant::now() + delay;
                q.enqueue(msg);
                drop(inner);
                self.arrivals.notify_waiters();
            },
            Rejection::DeadLetter { reason } => q.dead.push(DeadLetter {
                message_id: msg.id,
                routing_key: msg.routing_key,
                body: msg.body,
                delivery_count: msg.delivery_count,
                reason,
            }),
        }
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth, BrokerError> {
        let mut inner = self.inner.lock().await;
        let q = inner.queue_mut(queue)?;
        q.purge_expired(Instant::now());
        Ok(QueueDepth {
            ready: q.ready.len() as u64,
            unacked: q.unacked.len() as u64,
            dead_lettered: q.dead.len() as u64,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::Topology;

    fn topology() -> Topology {
        Topology::new("finhub_exchange", QueueSpec::durable("finhub_tasks"), "finhub_tasks")
    }

    async fn declared() -> MemoryBroker {
        let broker = MemoryBroker::new();
        topology().declare(&broker).await.unwrap();
        broker
    }

    async fn publish(broker: &MemoryBroker, body: &str, priority: u8) -> usize {
        broker
            .publish(
                "finhub_exchange",
                "finhub_tasks",
                OutgoingMessage::json(body.as_bytes().to_vec(), priority),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let broker = declared().await;
        topology().declare(&broker).await.unwrap();
        assert_eq!(publish(&broker, "a", 5).await, 1);
    }

    #[tokio::test]
    async fn test_exchange_kind_conflict() {
        let broker = declared().await;
        let err = broker
            .declare_exchange("finhub_exchange", ExchangeKind::Direct)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ExchangeKindMismatch { .. }));
    }

    #[tokio::test]
    async fn test_unroutable_publish_routes_nowhere() {
        let broker = declared().await;
        let routed = broker
            .publish("finhub_exchange", "elsewhere", OutgoingMessage::json(b"x".to_vec(), 5))
            .await
            .unwrap();
        assert_eq!(routed, 0);
        assert_eq!(broker.queue_depth("finhub_tasks").await.unwrap().ready, 0);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let broker = declared().await;
        publish(&broker, "low-1", 9).await;
        publish(&broker, "urgent", 1).await;
        publish(&broker, "low-2", 9).await;

        let mut order = Vec::new();
        while let Some(d) = broker.receive("finhub_tasks", Duration::ZERO).await.unwrap() {
            order.push(String::from_utf8(d.body.clone()).unwrap());
            broker.ack(&d).await.unwrap();
        }
        assert_eq!(order, vec!["urgent", "low-1", "low-2"]);
    }

    #[tokio::test]
    async fn test_requeue_redelivers_with_count() {
        let broker = declared().await;
        publish(&broker, "job", 5).await;

        let first = broker.receive("finhub_tasks", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.delivery_count, 1);
        assert!(!first.redelivered());
        broker.reject(&first, Rejection::requeue()).await.unwrap();

        let second = broker.receive("finhub_tasks", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.delivery_count, 2);
        assert!(second.redelivered());
        assert_eq!(second.body, first.body);

        // The first claim is spent.
        assert!(matches!(
            broker.ack(&first).await.unwrap_err(),
            BrokerError::StaleDelivery(_)
        ));
        broker.ack(&second).await.unwrap();
        assert_eq!(broker.queue_depth("finhub_tasks").await.unwrap(), QueueDepth::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_delay_holds_message_back() {
        let broker = declared().await;
        publish(&broker, "rate-limited", 5).await;

        let first = broker.receive("finhub_tasks", Duration::ZERO).await.unwrap().unwrap();
        broker
            .reject(&first, Rejection::requeue_after(Duration::from_secs(10)))
            .await
            .unwrap();

        // Counted as ready but not handed out yet.
        assert_eq!(broker.queue_depth("finhub_tasks").await.unwrap().ready, 1);
        assert!(broker.receive("finhub_tasks", Duration::ZERO).await.unwrap().is_none());
        assert!(broker
            .receive("finhub_tasks", Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());

        // A waiting receive wakes when the delay runs out.
        let started = Instant::now();
        let second = broker
            .receive("finhub_tasks", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.delivery_count, 2);
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_message_does_not_block_others() {
        let broker = declared().await;
        publish(&broker, "urgent", 1).await;
        publish(&broker, "routine", 9).await;

        let urgent = broker.receive("finhub_tasks", Duration::ZERO).await.unwrap().unwrap();
        broker
            .reject(&urgent, Rejection::requeue_after(Duration::from_secs(60)))
            .await
            .unwrap();

        let next = broker.receive("finhub_tasks", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(next.body, b"routine");
    }

    #[tokio::test]
    async fn test_reject_without_requeue_dead_letters() {
        let broker = declared().await;
        publish(&broker, "poison", 5).await;

        let d = broker.receive("finhub_tasks", Duration::ZERO).await.unwrap().unwrap();
        broker.reject(&d, Rejection::dead_letter("malformed message")).await.unwrap();

        let depth = broker.queue_depth("finhub_tasks").await.unwrap();
        assert_eq!(depth.ready, 0);
        assert_eq!(depth.dead_lettered, 1);
        let dead = broker.dead_letters("finhub_tasks").await.unwrap();
        assert_eq!(dead[0].reason, "malformed message");
    }

    #[tokio::test]
    async fn test_receive_waits_for_publish() {
        let broker = std::sync::Arc::new(declared().await);
        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.receive("finhub_tasks", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        publish(&broker, "late", 5).await;

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.body, b"late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_empty() {
        let broker = declared().await;
        let got = broker.receive("finhub_tasks", Duration::from_secs(1)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_and_max_length() {
        let broker = MemoryBroker::new();
        Topology::new(
            "ex",
            QueueSpec::durable("q")
                .with_message_ttl(Some(Duration::from_secs(60)))
                .with_max_length(Some(2)),
            "k",
        )
        .declare(&broker)
        .await
        .unwrap();

        for body in ["1", "2", "3"] {
            broker
                .publish("ex", "k", OutgoingMessage::json(body.as_bytes().to_vec(), 5))
                .await
                .unwrap();
        }
        // Oldest dropped to respect max length.
        let d = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(d.body, b"2");
        broker.ack(&d).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(broker.queue_depth("q").await.unwrap().ready, 0);
    }

    #[tokio::test]
    async fn test_unknown_queue() {
        let broker = MemoryBroker::new();
        let err = broker.receive("missing", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownQueue(_)));
    }
}
