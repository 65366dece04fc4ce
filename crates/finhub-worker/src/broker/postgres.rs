//! Postgres-backed broker
//!
//! Exchanges, queues and bindings are rows; every routed copy of a message is
//! a row in `broker_messages` moving between `ready`, `unacked` and `dead`.
//! Consumers claim with `FOR UPDATE SKIP LOCKED`, so concurrent workers never
//! block on or double-claim the same message. A claim older than the
//! visibility timeout is treated as abandoned (the consumer crashed) and the
//! message becomes claimable again. A requeue with a delay pushes
//! `visible_at` into the future.

use super::{
    Broker, Delivery, DeliveryTag, ExchangeKind, OutgoingMessage, QueueDepth, QueueSpec,
    Rejection,
};
use crate::error::BrokerError;
use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Poll interval while waiting for a message.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: i64,
    routing_key: String,
    body: Vec<u8>,
    content_type: String,
    persistent: bool,
    priority: i16,
    delivery_count: i32,
}

#[derive(Debug, Clone)]
pub struct PgBroker {
    pool: PgPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PgBroker {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn ensure_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let exists: Option<String> =
            sqlx::query_scalar("SELECT name FROM broker_queues WHERE name = $1")
                .bind(queue)
                .fetch_optional(&self.pool)
                .await?;
        exists
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))
    }

    async fn try_claim(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        sqlx::query(
            "DELETE FROM broker_messages
             WHERE queue_name = $1 AND status = 'ready' AND expires_at <= NOW()",
        )
        .bind(queue)
        .execute(&self.pool)
        .await?;

        let claim = Uuid::new_v4();
        let row: Option<MessageRow> = sqlx::query_as(
            r#"
            UPDATE broker_messages
            SET status = 'unacked',
                delivery_count = delivery_count + 1,
                claim_token = $2,
                claimed_at = NOW()
            WHERE id = (
                SELECT id FROM broker_messages
                WHERE queue_name = $1
                  AND (
                    (status = 'ready'
                     AND visible_at <= NOW()
                     AND (expires_at IS NULL OR expires_at > NOW()))
                    OR (status = 'unacked' AND claimed_at < NOW() - make_interval(secs => $3))
                  )
                ORDER BY priority ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, routing_key, body, content_type, persistent, priority, delivery_count
            "#,
        )
        .bind(queue)
        .bind(claim)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            if row.delivery_count > 1 {
                debug!(queue, message_id = row.id, delivery_count = row.delivery_count, "Redelivering message");
            }
            Delivery {
                tag: DeliveryTag {
                    message_id: row.id,
                    claim,
                },
                queue: queue.to_string(),
                routing_key: row.routing_key,
                body: row.body,
                content_type: row.content_type,
                persistent: row.persistent,
                priority: u8::try_from(row.priority).unwrap_or(u8::MAX),
                delivery_count: u32::try_from(row.delivery_count).unwrap_or(0),
            }
        }))
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        sqlx::query(
            "INSERT INTO broker_exchanges (name, kind) VALUES ($1, $2)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;

        let existing: String = sqlx::query_scalar("SELECT kind FROM broker_exchanges WHERE name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;

        if existing != kind.as_str() {
            return Err(BrokerError::ExchangeKindMismatch {
                name: name.to_string(),
                existing,
            });
        }
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let ttl_ms = spec
            .message_ttl
            .map(|ttl| i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        let max_length = spec.max_length.map(|n| i64::try_from(n).unwrap_or(i64::MAX));

        sqlx::query(
            r#"
            INSERT INTO broker_queues (name, durable, message_ttl_ms, max_length)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE
            SET durable = EXCLUDED.durable,
                message_ttl_ms = EXCLUDED.message_ttl_ms,
                max_length = EXCLUDED.max_length
            "#,
        )
        .bind(&spec.name)
        .bind(spec.durable)
        .bind(ttl_ms)
        .bind(max_length)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), BrokerError> {
        let exchange_exists: Option<String> =
            sqlx::query_scalar("SELECT name FROM broker_exchanges WHERE name = $1")
                .bind(exchange)
                .fetch_optional(&self.pool)
                .await?;
        if exchange_exists.is_none() {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }
        self.ensure_queue(queue).await?;

        sqlx::query(
            "INSERT INTO broker_bindings (queue_name, exchange_name, binding_key)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(queue)
        .bind(exchange)
        .bind(binding_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<usize, BrokerError> {
        let mut tx = self.pool.begin().await?;

        let kind: Option<String> =
            sqlx::query_scalar("SELECT kind FROM broker_exchanges WHERE name = $1")
                .bind(exchange)
                .fetch_optional(&mut *tx)
                .await?;
        let kind = kind
            .as_deref()
            .and_then(ExchangeKind::parse)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        let bindings: Vec<(String, String, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT b.queue_name, b.binding_key, q.max_length
            FROM broker_bindings b
            JOIN broker_queues q ON q.name = b.queue_name
            WHERE b.exchange_name = $1
            ORDER BY b.queue_name
            "#,
        )
        .bind(exchange)
        .fetch_all(&mut *tx)
        .await?;

        let mut routed: Vec<(String, Option<i64>)> = Vec::new();
        for (queue, binding_key, max_length) in bindings {
            if kind.routes(&binding_key, routing_key) && !routed.iter().any(|(q, _)| *q == queue) {
                routed.push((queue, max_length));
            }
        }

        for (queue, max_length) in &routed {
            sqlx::query(
                r#"
                INSERT INTO broker_messages
                    (queue_name, routing_key, body, content_type, persistent, priority, expires_at)
                SELECT $1, $2, $3, $4, $5, $6,
                       CASE WHEN q.message_ttl_ms IS NULL THEN NULL
                            ELSE NOW() + make_interval(secs => q.message_ttl_ms / 1000.0)
                       END
                FROM broker_queues q WHERE q.name = $1
                "#,
            )
            .bind(queue)
            .bind(routing_key)
            .bind(&message.body)
            .bind(&message.content_type)
            .bind(message.persistent)
            .bind(i16::from(message.priority))
            .execute(&mut *tx)
            .await?;

            if let Some(max_length) = max_length {
                let dropped = sqlx::query(
                    r#"
                    DELETE FROM broker_messages WHERE id IN (
                        SELECT id FROM broker_messages
                        WHERE queue_name = $1 AND status = 'ready'
                        ORDER BY id DESC
                        OFFSET $2
                    )
                    "#,
                )
                .bind(queue)
                .bind(max_length)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if dropped > 0 {
                    warn!(queue = %queue, dropped, "Queue full, dropped oldest messages");
                }
            }
        }

        tx.commit().await?;
        Ok(routed.len())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_queue(queue).await?;
        let deadline = Instant::now() + wait;

        loop {
            if let Some(delivery) = self.try_claim(queue).await? {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let result = sqlx::query(
            "DELETE FROM broker_messages
             WHERE id = $1 AND claim_token = $2 AND status = 'unacked'",
        )
        .bind(delivery.tag.message_id)
        .bind(delivery.tag.claim)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::StaleDelivery(delivery.tag));
        }
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, rejection: Rejection) -> Result<(), BrokerError> {
        let result = match &rejection {
            Rejection::Requeue { delay } => {
                sqlx::query(
                    r#"
                    UPDATE broker_messages
                    SET status = 'ready', claim_token = NULL, claimed_at = NULL,
                        visible_at = NOW() + make_interval(secs => $3)
                    WHERE id = $1 AND claim_token = $2 AND status = 'unacked'
                    "#,
                )
                .bind(delivery.tag.message_id)
                .bind(delivery.tag.claim)
                .bind(delay.as_secs_f64())
                .execute(&self.pool)
                .await?
            },
            Rejection::DeadLetter { reason } => {
                sqlx::query(
                    r#"
                    UPDATE broker_messages
                    SET status = 'dead', claim_token = NULL, dead_reason = $3, dead_at = NOW()
                    WHERE id = $1 AND claim_token = $2 AND status = 'unacked'
                    "#,
                )
                .bind(delivery.tag.message_id)
                .bind(delivery.tag.claim)
                .bind(reason)
                .execute(&self.pool)
                .await?
            },
        };

        if result.rows_affected() == 0 {
            return Err(BrokerError::StaleDelivery(delivery.tag));
        }
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth, BrokerError> {
        self.ensure_queue(queue).await?;

        let (ready, unacked, dead): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'ready' AND (expires_at IS NULL OR expires_at > NOW())),
                COUNT(*) FILTER (WHERE status = 'unacked'),
                COUNT(*) FILTER (WHERE status = 'dead')
            FROM broker_messages
            WHERE queue_name = $1
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        let count = |n: i64| u64::try_from(n).unwrap_or(0);
        Ok(QueueDepth {
            ready: count(ready),
            unacked: count(unacked),
            dead_lettered: count(dead),
        })
    }
}
