//! Outbox storage seam
//!
//! A claimed batch owns its rows until it is committed or dropped. Dropping
//! an uncommitted batch releases the claim without applying any update, the
//! same way a rolled-back `FOR UPDATE` transaction would.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::{NewOutboxEntry, OutboxRecord, OutboxStatus};
use crate::events::EventType;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt outbox row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

impl From<sqlx::Error> for OutboxError {
    fn from(e: sqlx::Error) -> Self {
        OutboxError::Database(e.to_string())
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` due PENDING rows ordered by id, skipping rows held
    /// by another claim.
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Box<dyn OutboxBatch>, OutboxError>;

    /// Delete at most `limit` COMPLETED rows created before `threshold`.
    async fn delete_completed_before(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, OutboxError>;
}

#[async_trait]
pub trait OutboxBatch: Send {
    fn entries(&self) -> &[OutboxRecord];

    async fn mark_completed(&mut self, id: i64, now: DateTime<Utc>) -> Result<(), OutboxError>;

    async fn reschedule(
        &mut self,
        id: i64,
        retry_count: i32,
        next_attempt: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxError>;

    async fn mark_failed(
        &mut self,
        id: i64,
        retry_count: i32,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxError>;

    async fn commit(self: Box<Self>) -> Result<(), OutboxError>;
}

// ============================================================================
// In-memory table
// ============================================================================

#[derive(Debug, Default)]
struct OutboxTable {
    next_id: i64,
    rows: BTreeMap<i64, OutboxRecord>,
    claimed: HashSet<i64>,
}

/// Process-local outbox table shared by a memory store and its publisher
#[derive(Debug, Clone, Default)]
pub struct MemoryOutbox {
    table: Arc<Mutex<OutboxTable>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, OutboxTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append rows as PENDING. Callers invoke this from their own commit so
    /// the rows become visible together with the mutation.
    pub fn append(&self, entries: Vec<NewOutboxEntry>, now: DateTime<Utc>) -> Vec<i64> {
        let mut table = self.lock();
        entries
            .into_iter()
            .map(|entry| {
                table.next_id += 1;
                let id = table.next_id;
                table.rows.insert(
                    id,
                    OutboxRecord {
                        id,
                        aggregate_type: entry.aggregate_type.as_str().to_string(),
                        aggregate_id: entry.aggregate_id,
                        event_type: entry.event_type.as_str().to_string(),
                        payload: entry.payload,
                        status: OutboxStatus::Pending,
                        retry_count: 0,
                        next_attempt_time: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
                id
            })
            .collect()
    }

    /// All rows in id order
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.lock().rows.values().cloned().collect()
    }

    pub fn records_of_type(&self, event_type: EventType) -> Vec<OutboxRecord> {
        self.lock()
            .rows
            .values()
            .filter(|r| r.event_type == event_type.as_str())
            .cloned()
            .collect()
    }

    pub fn get(&self, id: i64) -> Option<OutboxRecord> {
        self.lock().rows.get(&id).cloned()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutbox {
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Box<dyn OutboxBatch>, OutboxError> {
        let mut table = self.lock();
        let entries: Vec<OutboxRecord> = table
            .rows
            .values()
            .filter(|r| r.is_due(now) && !table.claimed.contains(&r.id))
            .take(limit)
            .cloned()
            .collect();
        table.claimed.extend(entries.iter().map(|r| r.id));
        drop(table);

        Ok(Box::new(MemoryBatch {
            outbox: self.clone(),
            entries,
            updates: Vec::new(),
            released: false,
        }))
    }

    async fn delete_completed_before(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, OutboxError> {
        let mut table = self.lock();
        let doomed: Vec<i64> = table
            .rows
            .values()
            .filter(|r| r.status == OutboxStatus::Completed && r.created_at < threshold)
            .take(limit)
            .map(|r| r.id)
            .collect();
        for id in &doomed {
            table.rows.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[derive(Debug)]
enum RowUpdate {
    Completed,
    Rescheduled {
        retry_count: i32,
        next_attempt: DateTime<Utc>,
    },
    Failed {
        retry_count: i32,
    },
}

struct MemoryBatch {
    outbox: MemoryOutbox,
    entries: Vec<OutboxRecord>,
    updates: Vec<(i64, RowUpdate, DateTime<Utc>)>,
    released: bool,
}

impl MemoryBatch {
    fn release(&mut self) {
        if self.released {
            return;
        }
        let mut table = self.outbox.lock();
        for record in &self.entries {
            table.claimed.remove(&record.id);
        }
        self.released = true;
    }
}

impl Drop for MemoryBatch {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl OutboxBatch for MemoryBatch {
    fn entries(&self) -> &[OutboxRecord] {
        &self.entries
    }

    async fn mark_completed(&mut self, id: i64, now: DateTime<Utc>) -> Result<(), OutboxError> {
        self.updates.push((id, RowUpdate::Completed, now));
        Ok(())
    }

    async fn reschedule(
        &mut self,
        id: i64,
        retry_count: i32,
        next_attempt: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        self.updates.push((
            id,
            RowUpdate::Rescheduled {
                retry_count,
                next_attempt,
            },
            now,
        ));
        Ok(())
    }

    async fn mark_failed(
        &mut self,
        id: i64,
        retry_count: i32,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        self.updates
            .push((id, RowUpdate::Failed { retry_count }, now));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), OutboxError> {
        let mut batch = self;
        {
            let mut table = batch.outbox.lock();
            for (id, update, now) in batch.updates.drain(..) {
                let Some(row) = table.rows.get_mut(&id) else {
                    return Err(OutboxError::Corrupt {
                        id,
                        reason: "row vanished while claimed".to_string(),
                    });
                };
                match update {
                    RowUpdate::Completed => {
                        row.status = OutboxStatus::Completed;
                        row.next_attempt_time = None;
                    }
                    RowUpdate::Rescheduled {
                        retry_count,
                        next_attempt,
                    } => {
                        row.retry_count = retry_count;
                        row.next_attempt_time = Some(next_attempt);
                    }
                    RowUpdate::Failed { retry_count } => {
                        row.status = OutboxStatus::Failed;
                        row.retry_count = retry_count;
                        row.next_attempt_time = None;
                    }
                }
                row.updated_at = now;
            }
        }
        batch.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::types::AggregateType;

    fn entry(id: &str) -> NewOutboxEntry {
        NewOutboxEntry {
            aggregate_type: AggregateType::Transfer,
            aggregate_id: id.to_string(),
            event_type: EventType::TransferInitiated,
            payload: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_do_not_overlap() {
        let outbox = MemoryOutbox::new();
        let now = Utc::now();
        outbox.append((0..5).map(|i| entry(&i.to_string())).collect(), now);

        let first = outbox.claim_batch(now, 3).await.unwrap();
        let second = outbox.claim_batch(now, 3).await.unwrap();

        let first_ids: Vec<i64> = first.entries().iter().map(|r| r.id).collect();
        let second_ids: Vec<i64> = second.entries().iter().map(|r| r.id).collect();
        assert_eq!(first_ids, vec![1, 2, 3]);
        assert_eq!(second_ids, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_dropped_batch_releases_claim_without_updates() {
        let outbox = MemoryOutbox::new();
        let now = Utc::now();
        outbox.append(vec![entry("a")], now);

        {
            let mut batch = outbox.claim_batch(now, 10).await.unwrap();
            batch.mark_completed(1, now).await.unwrap();
            // dropped without commit
        }

        assert_eq!(outbox.get(1).unwrap().status, OutboxStatus::Pending);
        let again = outbox.claim_batch(now, 10).await.unwrap();
        assert_eq!(again.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_applies_updates() {
        let outbox = MemoryOutbox::new();
        let now = Utc::now();
        let later = now + chrono::TimeDelta::minutes(1);
        outbox.append(vec![entry("a"), entry("b")], now);

        let mut batch = outbox.claim_batch(now, 10).await.unwrap();
        batch.mark_completed(1, now).await.unwrap();
        batch.reschedule(2, 1, later, now).await.unwrap();
        batch.commit().await.unwrap();

        assert_eq!(outbox.get(1).unwrap().status, OutboxStatus::Completed);
        let rescheduled = outbox.get(2).unwrap();
        assert_eq!(rescheduled.retry_count, 1);
        assert_eq!(rescheduled.next_attempt_time, Some(later));

        // not due yet
        let empty = outbox.claim_batch(now, 10).await.unwrap();
        assert!(empty.entries().is_empty());
    }

    #[tokio::test]
    async fn test_delete_completed_respects_limit() {
        let outbox = MemoryOutbox::new();
        let now = Utc::now();
        outbox.append((0..3).map(|i| entry(&i.to_string())).collect(), now);

        let mut batch = outbox.claim_batch(now, 10).await.unwrap();
        for id in 1..=3 {
            batch.mark_completed(id, now).await.unwrap();
        }
        batch.commit().await.unwrap();

        let threshold = now + chrono::TimeDelta::seconds(1);
        assert_eq!(outbox.delete_completed_before(threshold, 2).await.unwrap(), 2);
        assert_eq!(outbox.delete_completed_before(threshold, 2).await.unwrap(), 1);
        assert_eq!(outbox.delete_completed_before(threshold, 2).await.unwrap(), 0);
    }
}
