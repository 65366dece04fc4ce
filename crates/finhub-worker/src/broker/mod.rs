//! Durable message broker
//!
//! The [`Broker`] trait models the slice of AMQP the engine needs: durable
//! exchanges routing by key to durable queues, at-least-once delivery with
//! explicit ack or reject, and a dead-letter state for rejected messages.
//!
//! Two backends implement it:
//!
//! - [`PgBroker`]: Postgres tables, claiming with `FOR UPDATE SKIP LOCKED` so
//!   any number of worker processes can share a queue
//! - [`MemoryBroker`]: in-process, for tests and dry runs
//!
//! Ready messages are delivered lowest priority value first (1 is most
//! urgent), FIFO within a priority. A message requeued with a delay is skipped
//! until the delay has passed.

pub mod memory;
pub mod postgres;

use crate::error::BrokerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub use memory::MemoryBroker;
pub use postgres::PgBroker;

/// Content type of JSON message bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Binding keys are patterns; `*` matches one word, `#` zero or more.
    Topic,
    /// Binding keys must equal the routing key.
    Direct,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "topic" => Some(ExchangeKind::Topic),
            "direct" => Some(ExchangeKind::Direct),
            _ => None,
        }
    }

    pub fn routes(self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Topic => topic_matches(binding_key, routing_key),
            ExchangeKind::Direct => binding_key == routing_key,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue declaration arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Ready messages older than this are discarded.
    pub message_ttl: Option<Duration>,
    /// Oldest ready messages are dropped beyond this many.
    pub max_length: Option<u64>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            message_ttl: None,
            max_length: None,
        }
    }

    pub fn with_message_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.message_ttl = ttl;
        self
    }

    pub fn with_max_length(mut self, max_length: Option<u64>) -> Self {
        self.max_length = max_length;
        self
    }
}

/// A message to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    /// Survives a broker restart.
    pub persistent: bool,
    pub priority: u8,
}

impl OutgoingMessage {
    pub fn json(body: Vec<u8>, priority: u8) -> Self {
        Self {
            body,
            content_type: JSON_CONTENT_TYPE.to_string(),
            persistent: true,
            priority,
        }
    }
}

/// Identifies one claim on one message.
///
/// A message reclaimed after its visibility timeout gets a fresh claim, so a
/// slow consumer can no longer settle it with the old tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub message_id: i64,
    pub claim: Uuid,
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.message_id, self.claim)
    }
}

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub persistent: bool,
    pub priority: u8,
    /// Times this message has been handed out, this delivery included.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

/// How a rejected delivery leaves the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Back onto the queue; not deliverable again until `delay` has passed.
    Requeue { delay: Duration },
    /// Out of the queue for good, with the reason kept for inspection.
    DeadLetter { reason: String },
}

impl Rejection {
    /// Requeue for immediate redelivery.
    pub fn requeue() -> Self {
        Rejection::Requeue {
            delay: Duration::ZERO,
        }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Rejection::Requeue { delay }
    }

    pub fn dead_letter(reason: impl Into<String>) -> Self {
        Rejection::DeadLetter {
            reason: reason.into(),
        }
    }

    pub fn is_requeue(&self) -> bool {
        matches!(self, Rejection::Requeue { .. })
    }
}

/// Message counts of one queue
///
/// `ready` includes requeued messages still waiting out their delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: u64,
    pub unacked: u64,
    pub dead_lettered: u64,
}

impl fmt::Display for QueueDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ready={}, unacked={}, dead_lettered={}",
            self.ready, self.unacked, self.dead_lettered
        )
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotent. Redeclaring with another kind fails.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Idempotent. Redeclaring updates the queue arguments.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    /// Idempotent.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), BrokerError>;

    /// Route a message to every matching queue. Returns how many queues got it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<usize, BrokerError>;

    /// Claim the next ready message, waiting up to `wait` for one to arrive.
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Remove a settled message.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Return the message to the queue, or dead-letter it.
    async fn reject(&self, delivery: &Delivery, rejection: Rejection) -> Result<(), BrokerError>;

    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth, BrokerError>;
}

/// Exchange, queue and binding one producer/consumer pair agrees on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub queue: QueueSpec,
    pub routing_key: String,
}

impl Topology {
    /// A durable topic exchange with one durable queue bound on `routing_key`.
    pub fn new(
        exchange: impl Into<String>,
        queue: QueueSpec,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_kind: ExchangeKind::Topic,
            queue,
            routing_key: routing_key.into(),
        }
    }

    pub fn from_config(config: &crate::config::BrokerConfig) -> Self {
        let queue = QueueSpec::durable(&config.queue)
            .with_message_ttl(config.message_ttl())
            .with_max_length(config.max_length());
        Self::new(&config.exchange, queue, &config.routing_key)
    }

    /// Declare everything. Safe to repeat.
    pub async fn declare(&self, broker: &dyn Broker) -> Result<(), BrokerError> {
        broker
            .declare_exchange(&self.exchange, self.exchange_kind)
            .await?;
        broker.declare_queue(&self.queue).await?;
        broker
            .bind_queue(&self.queue.name, &self.exchange, &self.routing_key)
            .await?;
        debug!(
            exchange = %self.exchange,
            queue = %self.queue.name,
            routing_key = %self.routing_key,
            "Broker topology declared"
        );
        Ok(())
    }
}

/// AMQP topic matching over `.`-separated words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) if word == "*" || word == head => match_words(rest, tail),
            _ => false,
        },
    }
}
