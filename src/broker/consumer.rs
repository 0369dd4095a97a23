//! Consumer runtime shared by both services
//!
//! Routing rules for an inbound message:
//! - no or unknown `eventType` header: ignored
//! - handler says the payload is poison: dead-lettered at once
//! - transient handler error: retried with backoff, dead-lettered when the
//!   attempts run out

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{BrokerMessage, EXCEPTION_MESSAGE_HEADER, MessageBroker};
use crate::events::{self, EventType, SagaEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handling {
    Handled,
    /// Event type is not relevant to this consumer
    Ignored,
}

#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// The payload can never be processed (undeserializable, unserializable reply)
    #[error("Poison message: {0}")]
    Poison(String),

    /// Infrastructure fault; the same message may succeed later
    #[error("Transient failure: {0}")]
    Transient(String),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Deserialize a payload of a recognized type; failure makes it poison.
pub fn decode_payload<E: SagaEvent>(payload: &str) -> Result<E, HandlerError> {
    events::decode(payload)
        .map_err(|e| HandlerError::Poison(format!("Cannot deserialize {}: {}", E::TYPE, e)))
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event_type: EventType, payload: &str)
    -> Result<Handling, HandlerError>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Total delivery attempts for a transiently failing message
    pub max_attempts: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Outcome of dispatching one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Handled,
    Ignored,
    DeadLettered,
}

pub struct EventConsumer {
    name: &'static str,
    handler: Arc<dyn EventHandler>,
    broker: Arc<dyn MessageBroker>,
    dlq_topic: String,
    config: ConsumerConfig,
}

impl EventConsumer {
    pub fn new(
        name: &'static str,
        handler: Arc<dyn EventHandler>,
        broker: Arc<dyn MessageBroker>,
        dlq_topic: impl Into<String>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            name,
            handler,
            broker,
            dlq_topic: dlq_topic.into(),
            config,
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.min_delay)
            .with_max_delay(self.config.max_delay)
            .with_max_times(self.config.max_attempts.saturating_sub(1))
            .with_jitter()
    }

    /// Consume until every sender of the topic is gone.
    pub async fn run(self, mut rx: mpsc::Receiver<BrokerMessage>) {
        info!(consumer = self.name, "Starting event consumer");
        while let Some(message) = rx.recv().await {
            self.dispatch(message).await;
        }
        info!(consumer = self.name, "Event consumer stopped: topic closed");
    }

    pub async fn dispatch(&self, message: BrokerMessage) -> Delivery {
        let Some(event_type) = message
            .event_type()
            .and_then(|name| name.parse::<EventType>().ok())
        else {
            debug!(
                consumer = self.name,
                event_type = message.event_type().unwrap_or("<missing>"),
                "Ignoring message with unrecognized event type"
            );
            return Delivery::Ignored;
        };

        let payload = message.payload.as_str();
        let result = (|| async { self.handler.handle(event_type, payload).await })
            .retry(self.backoff())
            .when(HandlerError::is_transient)
            .notify(|err: &HandlerError, dur: Duration| {
                warn!(
                    consumer = self.name,
                    event_type = %event_type,
                    error = %err,
                    delay = ?dur,
                    "Handler failed, retrying"
                );
            })
            .await;

        match result {
            Ok(Handling::Handled) => Delivery::Handled,
            Ok(Handling::Ignored) => Delivery::Ignored,
            Err(err) => {
                self.dead_letter(message, event_type, &err).await;
                Delivery::DeadLettered
            }
        }
    }

    async fn dead_letter(&self, message: BrokerMessage, event_type: EventType, err: &HandlerError) {
        error!(
            consumer = self.name,
            event_type = %event_type,
            key = %message.key,
            error = %err,
            "Routing message to dead-letter topic"
        );
        let dead = message.with_header(EXCEPTION_MESSAGE_HEADER, err.to_string());
        if let Err(e) = self.broker.send(&self.dlq_topic, dead).await {
            error!(
                consumer = self.name,
                dlq_topic = %self.dlq_topic,
                error = %e,
                "Dead-letter send failed, message dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EVENT_TYPE_HEADER;
    use crate::broker::mock::MockBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedHandler {
        calls: AtomicUsize,
        fail_first: usize,
        error: HandlerError,
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        async fn handle(&self, event_type: EventType, _payload: &str) -> Result<Handling, HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if event_type != EventType::TransferInitiated {
                return Ok(Handling::Ignored);
            }
            if n < self.fail_first {
                return Err(self.error.clone());
            }
            Ok(Handling::Handled)
        }
    }

    fn consumer(handler: Arc<ScriptedHandler>, broker: Arc<MockBroker>) -> EventConsumer {
        EventConsumer::new(
            "test",
            handler,
            broker,
            "dlq",
            ConsumerConfig {
                max_attempts: 3,
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        )
    }

    fn message(event_type: &str) -> BrokerMessage {
        BrokerMessage::new("tx-1", "{}").with_header(EVENT_TYPE_HEADER, event_type)
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_ignored() {
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            error: HandlerError::Transient("x".into()),
        });
        let broker = Arc::new(MockBroker::new());
        let consumer = consumer(handler.clone(), broker.clone());

        assert_eq!(consumer.dispatch(message("ACCOUNT_OPENED")).await, Delivery::Ignored);
        assert_eq!(
            consumer.dispatch(BrokerMessage::new("k", "{}")).await,
            Delivery::Ignored
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
            fail_first: 2,
            error: HandlerError::Transient("db down".into()),
        });
        let broker = Arc::new(MockBroker::new());
        let consumer = consumer(handler.clone(), broker.clone());

        assert_eq!(
            consumer.dispatch(message("TRANSFER_INITIATED")).await,
            Delivery::Handled
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(broker.sent_to("dlq").is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_go_to_dead_letter() {
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
            error: HandlerError::Transient("db down".into()),
        });
        let broker = Arc::new(MockBroker::new());
        let consumer = consumer(handler.clone(), broker.clone());

        assert_eq!(
            consumer.dispatch(message("TRANSFER_INITIATED")).await,
            Delivery::DeadLettered
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(broker.sent_to("dlq").len(), 1);
    }

    #[tokio::test]
    async fn test_poison_is_dead_lettered_without_retry() {
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
            error: HandlerError::Poison("missing field `amount`".into()),
        });
        let broker = Arc::new(MockBroker::new());
        let consumer = consumer(handler.clone(), broker.clone());

        assert_eq!(
            consumer.dispatch(message("TRANSFER_INITIATED")).await,
            Delivery::DeadLettered
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let dead = broker.sent_to("dlq");
        assert_eq!(dead[0].payload, "{}");
        assert_eq!(dead[0].event_type(), Some("TRANSFER_INITIATED"));
        assert!(
            dead[0]
                .header(EXCEPTION_MESSAGE_HEADER)
                .unwrap()
                .contains("missing field")
        );
    }
}
