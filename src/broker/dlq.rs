//! Dead-letter monitor
//!
//! Nothing consumes a dead-letter topic automatically. The monitor raises a
//! loud alert for every message so an operator can replay or repair it.

use tokio::sync::mpsc;
use tracing::{error, info};

use super::{BrokerMessage, EXCEPTION_MESSAGE_HEADER};

pub struct DeadLetterMonitor {
    topic: String,
}

impl DeadLetterMonitor {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }

    pub fn alert(&self, message: &BrokerMessage) {
        error!(
            alert = "CRITICAL",
            dlq_topic = %self.topic,
            key = %message.key,
            event_type = message.event_type().unwrap_or("<missing>"),
            reason = message.header(EXCEPTION_MESSAGE_HEADER).unwrap_or("unknown"),
            payload = %message.payload,
            "Message landed in dead-letter topic, manual intervention required"
        );
    }

    pub async fn run(self, mut rx: mpsc::Receiver<BrokerMessage>) {
        info!(dlq_topic = %self.topic, "Starting dead-letter monitor");
        while let Some(message) = rx.recv().await {
            self.alert(&message);
        }
    }
}
