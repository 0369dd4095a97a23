//! Transfer storage seam
//!
//! A [`TransferTx`] groups a saga state change with the outbox row that
//! announces it. Dropping it without `commit` discards both.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::error::TransferError;
use super::state::TransferState;
use super::types::{NewTransfer, Transfer};
use crate::outbox::{MemoryOutbox, NewOutboxEntry};

#[async_trait]
pub trait TransferStore: Send + Sync {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Transfer>, TransferError>;

    async fn find_by_transaction_id(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Transfer>, TransferError>;

    /// Transfers in `state` last touched before `updated_before`, oldest first.
    async fn find_stale(
        &self,
        state: TransferState,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transfer>, TransferError>;

    async fn begin(&self) -> Result<Box<dyn TransferTx>, TransferError>;
}

#[async_trait]
pub trait TransferTx: Send {
    /// Insert unless the idempotency key exists. `None` means another request
    /// already owns the key.
    async fn insert_transfer(
        &mut self,
        transfer: NewTransfer,
        now: DateTime<Utc>,
    ) -> Result<Option<Transfer>, TransferError>;

    /// Read the row, locking it until the transaction ends.
    async fn load_transfer(&mut self, transaction_id: Uuid)
    -> Result<Option<Transfer>, TransferError>;

    /// Guarded transition: applies only if the row is still in `from` at
    /// `expected_version`. A `None` reason keeps the stored one.
    async fn update_state(
        &mut self,
        transaction_id: Uuid,
        from: TransferState,
        expected_version: i64,
        to: TransferState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, TransferError>;

    async fn insert_outbox(&mut self, entry: NewOutboxEntry) -> Result<(), TransferError>;

    async fn commit(self: Box<Self>) -> Result<(), TransferError>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone, Default)]
struct TransferTables {
    next_id: i64,
    transfers: BTreeMap<Uuid, Transfer>,
    by_key: HashMap<String, Uuid>,
}

/// Memory-backed transfer table. Transactions are serialized like
/// `MemoryLedgerStore`'s.
#[derive(Clone)]
pub struct MemoryTransferStore {
    tables: Arc<Mutex<TransferTables>>,
    outbox: MemoryOutbox,
}

impl MemoryTransferStore {
    pub fn new(outbox: MemoryOutbox) -> Self {
        Self {
            tables: Arc::new(Mutex::new(TransferTables::default())),
            outbox,
        }
    }

    pub fn outbox(&self) -> &MemoryOutbox {
        &self.outbox
    }

    pub async fn count(&self) -> usize {
        self.tables.lock().await.transfers.len()
    }

    /// Rewrite timestamps, as if the saga had been sitting idle.
    pub async fn backdate(
        &self,
        transaction_id: Uuid,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> bool {
        let mut tables = self.tables.lock().await;
        match tables.transfers.get_mut(&transaction_id) {
            Some(t) => {
                t.created_at = created_at;
                t.updated_at = updated_at;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl TransferStore for MemoryTransferStore {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Transfer>, TransferError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .by_key
            .get(key)
            .and_then(|id| tables.transfers.get(id))
            .cloned())
    }

    async fn find_by_transaction_id(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Transfer>, TransferError> {
        Ok(self.tables.lock().await.transfers.get(&transaction_id).cloned())
    }

    async fn find_stale(
        &self,
        state: TransferState,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transfer>, TransferError> {
        let tables = self.tables.lock().await;
        let mut stale: Vec<Transfer> = tables
            .transfers
            .values()
            .filter(|t| t.state == state && t.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|t| (t.updated_at, t.id));
        stale.truncate(limit);
        Ok(stale)
    }

    async fn begin(&self) -> Result<Box<dyn TransferTx>, TransferError> {
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTransferTx {
            guard,
            staged,
            pending_outbox: Vec::new(),
            outbox: self.outbox.clone(),
        }))
    }
}

struct MemoryTransferTx {
    guard: OwnedMutexGuard<TransferTables>,
    staged: TransferTables,
    pending_outbox: Vec<NewOutboxEntry>,
    outbox: MemoryOutbox,
}

#[async_trait]
impl TransferTx for MemoryTransferTx {
    async fn insert_transfer(
        &mut self,
        transfer: NewTransfer,
        now: DateTime<Utc>,
    ) -> Result<Option<Transfer>, TransferError> {
        if self.staged.by_key.contains_key(&transfer.idempotency_key)
            || self.staged.transfers.contains_key(&transfer.transaction_id)
        {
            return Ok(None);
        }

        self.staged.next_id += 1;
        let record = Transfer {
            id: self.staged.next_id,
            idempotency_key: transfer.idempotency_key,
            transaction_id: transfer.transaction_id,
            sender_account_id: transfer.sender_account_id,
            receiver_account_id: transfer.receiver_account_id,
            amount: transfer.amount,
            currency: transfer.currency,
            request_hash: Some(transfer.request_hash),
            state: TransferState::Started,
            failure_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.staged
            .by_key
            .insert(record.idempotency_key.clone(), record.transaction_id);
        self.staged
            .transfers
            .insert(record.transaction_id, record.clone());
        Ok(Some(record))
    }

    async fn load_transfer(
        &mut self,
        transaction_id: Uuid,
    ) -> Result<Option<Transfer>, TransferError> {
        Ok(self.staged.transfers.get(&transaction_id).cloned())
    }

    async fn update_state(
        &mut self,
        transaction_id: Uuid,
        from: TransferState,
        expected_version: i64,
        to: TransferState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, TransferError> {
        match self.staged.transfers.get_mut(&transaction_id) {
            Some(t) if t.state == from && t.version == expected_version => {
                t.state = to;
                if let Some(reason) = reason {
                    t.failure_reason = Some(reason.to_string());
                }
                t.version += 1;
                t.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_outbox(&mut self, entry: NewOutboxEntry) -> Result<(), TransferError> {
        self.pending_outbox.push(entry);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), TransferError> {
        let MemoryTransferTx {
            mut guard,
            staged,
            pending_outbox,
            outbox,
        } = *self;
        *guard = staged;
        outbox.append(pending_outbox, Utc::now());
        drop(guard);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;

    fn new_transfer(key: &str) -> NewTransfer {
        NewTransfer {
            idempotency_key: key.to_string(),
            transaction_id: Uuid::new_v4(),
            sender_account_id: "1".to_string(),
            receiver_account_id: "2".to_string(),
            amount: Decimal::new(1000, 2),
            currency: "TRY".to_string(),
            request_hash: "h".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_key() {
        let store = MemoryTransferStore::new(MemoryOutbox::new());
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        let first = tx.insert_transfer(new_transfer("k1"), now).await.unwrap();
        assert!(first.is_some());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.insert_transfer(new_transfer("k1"), now).await.unwrap().is_none());
        drop(tx);

        assert_eq!(store.count().await, 1);
        let found = store.find_by_idempotency_key("k1").await.unwrap().unwrap();
        assert_eq!(found.state, TransferState::Started);
        assert_eq!(found.version, 0);
    }

    #[tokio::test]
    async fn test_update_state_is_guarded() {
        let store = MemoryTransferStore::new(MemoryOutbox::new());
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();
        let t = tx
            .insert_transfer(new_transfer("k1"), now)
            .await
            .unwrap()
            .unwrap();
        let id = t.transaction_id;

        // wrong source state
        assert!(
            !tx.update_state(id, TransferState::Debited, 0, TransferState::Completed, None, now)
                .await
                .unwrap()
        );
        // stale version
        assert!(
            !tx.update_state(id, TransferState::Started, 7, TransferState::Debited, None, now)
                .await
                .unwrap()
        );
        assert!(
            tx.update_state(id, TransferState::Started, 0, TransferState::DebitFailed, Some("no funds"), now)
                .await
                .unwrap()
        );
        tx.commit().await.unwrap();

        let stored = store.find_by_transaction_id(id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransferState::DebitFailed);
        assert_eq!(stored.failure_reason.as_deref(), Some("no funds"));
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_find_stale_filters_and_limits() {
        let store = MemoryTransferStore::new(MemoryOutbox::new());
        let now = Utc::now();
        let mut ids = Vec::new();
        let mut tx = store.begin().await.unwrap();
        for i in 0..3 {
            let t = tx
                .insert_transfer(new_transfer(&format!("k{i}")), now)
                .await
                .unwrap()
                .unwrap();
            ids.push(t.transaction_id);
        }
        tx.commit().await.unwrap();

        let old = now - ChronoDuration::minutes(10);
        store.backdate(ids[0], old, old).await;
        store.backdate(ids[2], old, old - ChronoDuration::minutes(1)).await;

        let stale = store
            .find_stale(TransferState::Started, now - ChronoDuration::minutes(1), 10)
            .await
            .unwrap();
        let stale_ids: Vec<Uuid> = stale.iter().map(|t| t.transaction_id).collect();
        assert_eq!(stale_ids, vec![ids[2], ids[0]]);

        let limited = store
            .find_stale(TransferState::Started, now - ChronoDuration::minutes(1), 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        assert!(
            store
                .find_stale(TransferState::Debited, now, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
