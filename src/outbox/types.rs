//! Outbox row types

use std::fmt;

use chrono::{DateTime, Utc};

use crate::events::{self, EventType, SagaEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
    Pending,
    Completed,
    /// Terminal: retries exhausted, payload handed to the dead-letter topic
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Completed => "COMPLETED",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OutboxStatus::Pending),
            "COMPLETED" => Some(OutboxStatus::Completed),
            "FAILED" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateType {
    Transfer,
    Account,
}

impl AggregateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateType::Transfer => "TRANSFER",
            AggregateType::Account => "ACCOUNT",
        }
    }
}

/// A row to be written in the same transaction as the mutation it announces
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEntry {
    pub aggregate_type: AggregateType,
    /// Broker ordering key
    pub aggregate_id: String,
    pub event_type: EventType,
    pub payload: String,
}

impl NewOutboxEntry {
    /// Serialize `event` into an entry. A serialization fault is returned to
    /// the caller so the surrounding transaction rolls back.
    pub fn for_event<E: SagaEvent>(
        aggregate_type: AggregateType,
        aggregate_id: impl Into<String>,
        event: &E,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            aggregate_type,
            aggregate_id: aggregate_id.into(),
            event_type: E::TYPE,
            payload: events::encode(event)?,
        })
    }
}

/// A persisted outbox row
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: i64,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: String,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub next_attempt_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Whether the publisher may pick this row up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_attempt_time.is_none_or(|t| t <= now)
    }
}
