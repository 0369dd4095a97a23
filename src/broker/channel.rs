//! In-process broker: one bounded tokio channel per topic.
//!
//! A topic has a single consumer. Ordering is FIFO per topic, which also
//! keeps per-key order.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{BrokerError, BrokerMessage, MessageBroker};

const DEFAULT_CAPACITY: usize = 1024;

struct Topic {
    tx: mpsc::Sender<BrokerMessage>,
    rx: Option<mpsc::Receiver<BrokerMessage>>,
}

impl Topic {
    fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx: Some(rx) }
    }
}

pub struct ChannelBroker {
    topics: DashMap<String, Topic>,
    capacity: usize,
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChannelBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity,
        }
    }

    fn sender(&self, topic: &str) -> mpsc::Sender<BrokerMessage> {
        // Clone the sender out so no map shard lock is held across an await
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::with_capacity(self.capacity))
            .tx
            .clone()
    }

    /// Take the receiving end of `topic`. Returns `None` if another consumer
    /// already subscribed.
    pub fn subscribe(&self, topic: &str) -> Option<mpsc::Receiver<BrokerMessage>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::with_capacity(self.capacity))
            .rx
            .take()
    }
}

#[async_trait]
impl MessageBroker for ChannelBroker {
    async fn send(&self, topic: &str, message: BrokerMessage) -> Result<(), BrokerError> {
        let tx = self.sender(topic);
        tx.send(message)
            .await
            .map_err(|_| BrokerError::Closed(topic.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let broker = ChannelBroker::default();
        let mut rx = broker.subscribe("transfer-out-0").unwrap();

        for i in 0..3 {
            broker
                .send("transfer-out-0", BrokerMessage::new("k", i.to_string()))
                .await
                .unwrap();
        }

        for i in 0..3 {
            assert_eq!(rx.recv().await.unwrap().payload, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_single_subscriber_per_topic() {
        let broker = ChannelBroker::default();
        assert!(broker.subscribe("account-out-0").is_some());
        assert!(broker.subscribe("account-out-0").is_none());
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_fails() {
        let broker = ChannelBroker::default();
        drop(broker.subscribe("gone"));
        let err = broker
            .send("gone", BrokerMessage::new("k", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Closed(t) if t == "gone"));
    }
}
