//! Outbox publisher
//!
//! Polls the service's outbox table, relays due rows to the broker and
//! records the outcome in the same claim transaction.
//!
//! ```text
//! PENDING ──send ok──────────────────────────▶ COMPLETED
//!    │
//!    └─send err──▶ retry_count += 1
//!                   ├─ retry_count <= max ──▶ PENDING, next_attempt = now + backoff
//!                   └─ retry_count >  max ──▶ dead-letter send (best effort) ──▶ FAILED
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::store::{OutboxError, OutboxStore};
use crate::broker::{BrokerMessage, EVENT_TYPE_HEADER, EXCEPTION_MESSAGE_HEADER, MessageBroker};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub batch_size: usize,
    pub polling_interval: Duration,
    pub max_retries: i32,
    pub topic: String,
    pub dlq_topic: String,
    pub backoff: BackoffPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            polling_interval: Duration::from_millis(500),
            max_retries: 5,
            topic: "transfer-out-0".to_string(),
            dlq_topic: "transfer-dlq-0".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Counts for one polling cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

impl PublishReport {
    pub fn total(&self) -> usize {
        self.published + self.rescheduled + self.failed
    }
}

pub struct OutboxPublisher {
    name: &'static str,
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn MessageBroker>,
    config: PublisherConfig,
}

impl OutboxPublisher {
    pub fn new(
        name: &'static str,
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn MessageBroker>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            name,
            store,
            broker,
            config,
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub async fn run(&self) {
        info!(
            publisher = self.name,
            topic = %self.config.topic,
            interval_ms = self.config.polling_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting outbox publisher"
        );

        loop {
            if let Err(e) = self.process_batch().await {
                error!(publisher = self.name, error = %e, "Outbox polling failed");
            }
            tokio::time::sleep(self.config.polling_interval).await;
        }
    }

    pub async fn process_batch(&self) -> Result<PublishReport, OutboxError> {
        self.process_batch_at(Utc::now()).await
    }

    /// Run one claim/publish/record cycle as of `now`.
    pub async fn process_batch_at(&self, now: DateTime<Utc>) -> Result<PublishReport, OutboxError> {
        let mut batch = self.store.claim_batch(now, self.config.batch_size).await?;
        let entries = batch.entries().to_vec();
        let mut report = PublishReport::default();

        if entries.is_empty() {
            return Ok(report);
        }
        debug!(publisher = self.name, claimed = entries.len(), "Claimed outbox batch");

        for record in entries {
            let message = BrokerMessage::new(record.aggregate_id.clone(), record.payload.clone())
                .with_header(EVENT_TYPE_HEADER, record.event_type.clone());

            let send_error = match self.broker.send(&self.config.topic, message).await {
                Ok(()) => {
                    batch.mark_completed(record.id, now).await?;
                    report.published += 1;
                    info!(
                        publisher = self.name,
                        outbox_id = record.id,
                        event_type = %record.event_type,
                        aggregate_id = %record.aggregate_id,
                        "Outbox event published"
                    );
                    continue;
                }
                Err(e) => e,
            };

            let retry_count = record.retry_count + 1;
            if retry_count <= self.config.max_retries {
                let next_attempt = self.config.backoff.next_attempt_at(now, retry_count);
                warn!(
                    publisher = self.name,
                    outbox_id = record.id,
                    retry_count,
                    next_attempt = %next_attempt,
                    error = %send_error,
                    "Outbox publish failed, retry scheduled"
                );
                batch
                    .reschedule(record.id, retry_count, next_attempt, now)
                    .await?;
                report.rescheduled += 1;
                continue;
            }

            warn!(
                publisher = self.name,
                outbox_id = record.id,
                max_retries = self.config.max_retries,
                "Max retries reached, moving to dead-letter topic"
            );
            let dead = BrokerMessage::new(record.aggregate_id.clone(), record.payload.clone())
                .with_header(EVENT_TYPE_HEADER, record.event_type.clone())
                .with_header(EXCEPTION_MESSAGE_HEADER, send_error.to_string());
            if let Err(dlq_err) = self.broker.send(&self.config.dlq_topic, dead).await {
                error!(
                    publisher = self.name,
                    outbox_id = record.id,
                    error = %dlq_err,
                    "Dead-letter send failed too, marking FAILED in database only"
                );
            }
            batch.mark_failed(record.id, retry_count, now).await?;
            report.failed += 1;
        }

        batch.commit().await?;
        Ok(report)
    }
}
