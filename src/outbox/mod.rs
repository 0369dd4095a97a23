//! Transactional outbox
//!
//! Every write that must notify another service inserts an outbox row in
//! the same database transaction as the state change. A polling publisher
//! relays rows to the broker with capped exponential retry and a
//! dead-letter fallback; a cleanup job trims published rows.

pub mod backoff;
pub mod cleanup;
pub mod pg;
pub mod publisher;
pub mod store;
pub mod types;

pub use backoff::BackoffPolicy;
pub use cleanup::{CleanupConfig, OutboxCleanup};
pub use pg::PgOutboxStore;
pub use publisher::{OutboxPublisher, PublishReport, PublisherConfig};
pub use store::{MemoryOutbox, OutboxBatch, OutboxError, OutboxStore};
pub use types::{AggregateType, NewOutboxEntry, OutboxRecord, OutboxStatus};
