//! Message broker seam
//!
//! Services only ever talk through topics. A message carries the ordering
//! key (aggregate id), string headers and the serialized payload.

pub mod channel;
pub mod consumer;
pub mod dlq;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

pub use channel::ChannelBroker;
pub use consumer::{
    ConsumerConfig, Delivery, EventConsumer, EventHandler, HandlerError, Handling, decode_payload,
};
pub use dlq::DeadLetterMonitor;

/// Header carrying the event type name
pub const EVENT_TYPE_HEADER: &str = "eventType";
/// Header carrying the failure that sent a message to a dead-letter topic
pub const EXCEPTION_MESSAGE_HEADER: &str = "x-exception-message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub key: String,
    pub headers: BTreeMap<String, String>,
    pub payload: String,
}

impl BrokerMessage {
    pub fn new(key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header(EVENT_TYPE_HEADER)
    }
}

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Topic {0} is closed")]
    Closed(String),

    #[error("Send to {topic} failed: {reason}")]
    SendFailed { topic: String, reason: String },
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Resolves once the broker has accepted the message.
    async fn send(&self, topic: &str, message: BrokerMessage) -> Result<(), BrokerError>;
}
