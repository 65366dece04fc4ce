//! Work item producer
//!
//! Serializes [`WorkItem`]s and publishes them as persistent JSON messages to
//! the configured exchange. The topology is declared lazily, once per
//! producer, before the first publish.

use crate::broker::{Broker, OutgoingMessage, Topology};
use crate::error::PublishError;
use finhub_common::types::{Params, WorkItem};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Outcome of [`Producer::publish_batch`]
#[derive(Debug, Default)]
pub struct BatchPublishReport {
    pub published: usize,
    /// Index into the batch and the error that item hit.
    pub failed: Vec<(usize, String)>,
}

impl BatchPublishReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Producer {
    broker: Arc<dyn Broker>,
    topology: Topology,
    declared: OnceCell<()>,
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology) -> Self {
        Self {
            broker,
            topology,
            declared: OnceCell::new(),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Declare exchange, queue and binding. Runs once; later calls are no-ops.
    pub async fn ensure_topology(&self) -> Result<(), PublishError> {
        self.declared
            .get_or_try_init(|| async { self.topology.declare(self.broker.as_ref()).await })
            .await?;
        Ok(())
    }

    /// Publish under the topology's routing key.
    pub async fn publish(&self, item: &WorkItem) -> Result<(), PublishError> {
        self.publish_with_key(item, &self.topology.routing_key).await
    }

    pub async fn publish_with_key(&self, item: &WorkItem, routing_key: &str) -> Result<(), PublishError> {
        let body = item.to_json_bytes()?;
        self.ensure_topology().await?;

        let routed = self
            .broker
            .publish(
                &self.topology.exchange,
                routing_key,
                OutgoingMessage::json(body, item.priority),
            )
            .await?;

        if routed == 0 {
            return Err(PublishError::Unroutable {
                exchange: self.topology.exchange.clone(),
                routing_key: routing_key.to_string(),
            });
        }

        debug!(
            subject_id = %item.subject_id,
            handler_key = %item.handler_key,
            priority = item.priority,
            routing_key,
            "Published work item"
        );
        Ok(())
    }

    /// Publish items one after another.
    ///
    /// Not transactional: a failed item is recorded and the rest still go out.
    pub async fn publish_batch(&self, items: &[WorkItem]) -> BatchPublishReport {
        let mut report = BatchPublishReport::default();

        for (index, item) in items.iter().enumerate() {
            match self.publish(item).await {
                Ok(()) => report.published += 1,
                Err(err) => {
                    warn!(
                        index,
                        subject_id = %item.subject_id,
                        handler_key = %item.handler_key,
                        error = %err,
                        "Failed to publish work item"
                    );
                    report.failed.push((index, err.to_string()));
                },
            }
        }

        info!(
            published = report.published,
            failed = report.failed.len(),
            "Batch publish finished"
        );
        report
    }
}

/// Every (symbol, handler) pair, symbols outermost.
pub fn work_items_for(
    symbols: &[String],
    handler_keys: &[String],
    params: &Params,
    priority: u8,
) -> Vec<WorkItem> {
    symbols
        .iter()
        .flat_map(|symbol| {
            handler_keys.iter().map(move |handler| {
                WorkItem::new(symbol.clone(), handler.clone())
                    .with_params(params.clone())
                    .with_priority(priority)
            })
        })
        .collect()
}
