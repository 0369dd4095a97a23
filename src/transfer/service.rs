//! Transfer initiation
//!
//! The idempotency guard in front of the saga: a TTL lock on the key
//! collapses concurrent duplicates, the stored request hash separates a
//! replay from a key reused for a different payload.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::TransferError;
use super::hasher::request_hash;
use super::lock::{IdempotencyLock, LockError, lock_key};
use super::store::TransferStore;
use super::types::{NewTransfer, Transfer, TransferRequest, TransferResponse};
use crate::events::TransferInitiated;
use crate::outbox::{AggregateType, NewOutboxEntry};

#[derive(Debug, Clone)]
pub struct TransferServiceConfig {
    pub lock_ttl: Duration,
    /// Attempts against the lock store before giving up with 503
    pub lock_acquire_attempts: usize,
    pub lock_retry_delay: Duration,
}

impl Default for TransferServiceConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(300),
            lock_acquire_attempts: 3,
            lock_retry_delay: Duration::from_millis(50),
        }
    }
}

pub struct TransferService {
    store: Arc<dyn TransferStore>,
    lock: Arc<dyn IdempotencyLock>,
    config: TransferServiceConfig,
}

impl TransferService {
    pub fn new(
        store: Arc<dyn TransferStore>,
        lock: Arc<dyn IdempotencyLock>,
        config: TransferServiceConfig,
    ) -> Self {
        Self {
            store,
            lock,
            config,
        }
    }

    /// Start a transfer, or return the one already started under this key.
    ///
    /// Returns once the transfer row and its TRANSFER_INITIATED outbox row
    /// have committed; the saga itself runs asynchronously.
    pub async fn initiate(
        &self,
        idempotency_key: &str,
        request: &TransferRequest,
    ) -> Result<TransferResponse, TransferError> {
        let key = idempotency_key.trim();
        if key.is_empty() {
            return Err(TransferError::InvalidRequest(
                "Idempotency key is required".to_string(),
            ));
        }
        let request = request.validate()?;
        let hash = request_hash(&request);
        let lock_name = lock_key(key);

        if !self.acquire(&lock_name).await? {
            // the holder may already have committed
            return match self.store.find_by_idempotency_key(key).await? {
                Some(existing) => replay(key, &existing, &hash),
                None => {
                    debug!(idempotency_key = %key, "Transfer is being processed by another request");
                    Err(TransferError::TransferInProgress(key.to_string()))
                }
            };
        }

        if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
            return replay(key, &existing, &hash);
        }

        match self.create(key, &request, hash.clone()).await {
            Ok(transfer) => Ok(TransferResponse::from(&transfer)),
            Err(e) => {
                // free the key so a retry is not blocked until the TTL
                if let Err(release_err) = self.lock.release(&lock_name).await {
                    warn!(
                        idempotency_key = %key,
                        error = %release_err,
                        "Failed to release idempotency lock"
                    );
                }
                Err(e)
            }
        }
    }

    pub async fn get(&self, transaction_id: Uuid) -> Result<Transfer, TransferError> {
        self.store
            .find_by_transaction_id(transaction_id)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(transaction_id.to_string()))
    }

    async fn acquire(&self, lock_name: &str) -> Result<bool, TransferError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.lock_retry_delay)
            .with_max_delay(self.config.lock_retry_delay * 10)
            .with_max_times(self.config.lock_acquire_attempts.saturating_sub(1))
            .with_jitter();
        let ttl = self.config.lock_ttl;

        (|| async { self.lock.try_acquire(lock_name, ttl).await })
            .retry(backoff)
            .notify(|err: &LockError, dur: Duration| {
                warn!(lock = %lock_name, error = %err, delay = ?dur, "Lock store error, retrying");
            })
            .await
            .map_err(|e| TransferError::LockUnavailable(e.to_string()))
    }

    async fn create(
        &self,
        key: &str,
        request: &TransferRequest,
        hash: String,
    ) -> Result<Transfer, TransferError> {
        let transaction_id = Uuid::new_v4();
        let mut tx = self.store.begin().await?;

        let inserted = tx
            .insert_transfer(
                NewTransfer {
                    idempotency_key: key.to_string(),
                    transaction_id,
                    sender_account_id: request.sender_account_id.clone(),
                    receiver_account_id: request.receiver_account_id.clone(),
                    amount: request.amount,
                    currency: request.currency.clone(),
                    request_hash: hash.clone(),
                },
                Utc::now(),
            )
            .await?;

        let Some(transfer) = inserted else {
            // lost the race after a lock expiry; the stored row decides
            drop(tx);
            let existing = self
                .store
                .find_by_idempotency_key(key)
                .await?
                .ok_or_else(|| TransferError::TransferInProgress(key.to_string()))?;
            replay(key, &existing, &hash)?;
            return Ok(existing);
        };

        let event = TransferInitiated {
            transaction_id,
            sender_account_id: transfer.sender_account_id.clone(),
            receiver_account_id: transfer.receiver_account_id.clone(),
            amount: transfer.amount,
            currency: transfer.currency.clone(),
        };
        tx.insert_outbox(NewOutboxEntry::for_event(
            AggregateType::Transfer,
            transaction_id.to_string(),
            &event,
        )?)
        .await?;
        tx.commit().await?;

        info!(
            transaction_id = %transaction_id,
            idempotency_key = %key,
            sender = %transfer.sender_account_id,
            receiver = %transfer.receiver_account_id,
            amount = %transfer.amount,
            currency = %transfer.currency,
            "Transfer initiated"
        );
        Ok(transfer)
    }
}

fn replay(key: &str, existing: &Transfer, hash: &str) -> Result<TransferResponse, TransferError> {
    if existing.request_hash.as_deref() != Some(hash) {
        warn!(
            idempotency_key = %key,
            transaction_id = %existing.transaction_id,
            "Idempotency key reused with a different payload"
        );
        return Err(TransferError::IdempotencyKeyReuse(key.to_string()));
    }
    debug!(
        idempotency_key = %key,
        transaction_id = %existing.transaction_id,
        "Returning existing transfer for replayed key"
    );
    Ok(TransferResponse::from(existing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::outbox::MemoryOutbox;
    use crate::transfer::lock::InProcessLock;
    use crate::transfer::state::TransferState;
    use crate::transfer::store::{MemoryTransferStore, TransferTx};
    use async_trait::async_trait;
    use chrono::DateTime;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(amount: &str) -> TransferRequest {
        TransferRequest {
            sender_account_id: "1".to_string(),
            receiver_account_id: "2".to_string(),
            amount: Decimal::from_str(amount).unwrap(),
            currency: "TRY".to_string(),
        }
    }

    fn fast_config() -> TransferServiceConfig {
        TransferServiceConfig {
            lock_retry_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn service() -> (Arc<TransferService>, MemoryTransferStore, Arc<InProcessLock>) {
        let store = MemoryTransferStore::new(MemoryOutbox::new());
        let lock = Arc::new(InProcessLock::new());
        let service = Arc::new(TransferService::new(
            Arc::new(store.clone()),
            lock.clone(),
            fast_config(),
        ));
        (service, store, lock)
    }

    #[tokio::test]
    async fn test_initiate_records_transfer_and_event() {
        let (service, store, _) = service();
        let response = service.initiate("key-1", &request("100.00")).await.unwrap();
        assert_eq!(response.state, TransferState::Started);

        let stored = store
            .find_by_transaction_id(response.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.idempotency_key, "key-1");
        assert!(stored.request_hash.is_some());

        let rows = store.outbox().records_of_type(EventType::TransferInitiated);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].aggregate_type, "TRANSFER");
        assert_eq!(rows[0].aggregate_id, response.transaction_id.to_string());
    }

    #[tokio::test]
    async fn test_replay_returns_original_without_side_effects() {
        let (service, store, lock) = service();
        let first = service.initiate("key-1", &request("100")).await.unwrap();

        // same payload, different formatting; lock still held from the first call
        let second = service.initiate("key-1", &request("100.00")).await.unwrap();
        assert_eq!(first, second);

        lock.release(&lock_key("key-1")).await.unwrap();
        let third = service.initiate("key-1", &request("100.00")).await.unwrap();
        assert_eq!(first, third);

        assert_eq!(store.count().await, 1);
        assert_eq!(store.outbox().records().len(), 1);
    }

    #[tokio::test]
    async fn test_key_reuse_with_other_payload_is_rejected() {
        let (service, store, lock) = service();
        let first = service.initiate("key-1", &request("100.00")).await.unwrap();

        let err = service.initiate("key-1", &request("200.00")).await.unwrap_err();
        assert!(matches!(err, TransferError::IdempotencyKeyReuse(_)));

        lock.release(&lock_key("key-1")).await.unwrap();
        let err = service.initiate("key-1", &request("200.00")).await.unwrap_err();
        assert!(matches!(err, TransferError::IdempotencyKeyReuse(_)));

        let stored = service.get(first.transaction_id).await.unwrap();
        assert_eq!(stored.amount, Decimal::from_str("100.00").unwrap());
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_reports_in_progress() {
        let (service, store, lock) = service();
        assert!(
            lock.try_acquire(&lock_key("key-1"), Duration::from_secs(60))
                .await
                .unwrap()
        );

        let err = service.initiate("key-1", &request("1.00")).await.unwrap_err();
        assert!(matches!(err, TransferError::TransferInProgress(_)));
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_initiate_creates_one_transfer() {
        let (service, store, _) = service();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.initiate("same-key", &request("50.00")).await })
            })
            .collect();

        let mut ids = Vec::new();
        for h in handles {
            match h.await.unwrap() {
                Ok(response) => ids.push(response.transaction_id),
                Err(TransferError::TransferInProgress(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(!ids.is_empty());
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(store.count().await, 1);
        assert_eq!(
            store
                .outbox()
                .records_of_type(EventType::TransferInitiated)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_before_locking() {
        let (service, _, lock) = service();
        let err = service.initiate("  ", &request("1.00")).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidRequest(_)));

        let err = service.initiate("key-1", &request("-1")).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidMoney(_)));
        assert!(
            lock.try_acquire(&lock_key("key-1"), Duration::from_secs(1))
                .await
                .unwrap()
        );
    }

    struct FlakyLock {
        failures: AtomicUsize,
        inner: InProcessLock,
    }

    #[async_trait]
    impl IdempotencyLock for FlakyLock {
        async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(LockError::Unavailable("connection refused".to_string()));
            }
            self.inner.try_acquire(key, ttl).await
        }

        async fn release(&self, key: &str) -> Result<(), LockError> {
            self.inner.release(key).await
        }
    }

    #[tokio::test]
    async fn test_lock_store_errors_are_retried_then_surface() {
        let store = MemoryTransferStore::new(MemoryOutbox::new());
        let lock = Arc::new(FlakyLock {
            failures: AtomicUsize::new(2),
            inner: InProcessLock::new(),
        });
        let service = TransferService::new(Arc::new(store.clone()), lock.clone(), fast_config());

        // two failures fit in three attempts
        assert!(service.initiate("key-1", &request("1.00")).await.is_ok());

        lock.failures.store(3, Ordering::SeqCst);
        let err = service.initiate("key-2", &request("1.00")).await.unwrap_err();
        assert!(matches!(err, TransferError::LockUnavailable(_)));
        assert_eq!(err.http_status(), 503);
    }

    struct BrokenStore;

    #[async_trait]
    impl TransferStore for BrokenStore {
        async fn find_by_idempotency_key(&self, _: &str) -> Result<Option<Transfer>, TransferError> {
            Ok(None)
        }

        async fn find_by_transaction_id(&self, _: Uuid) -> Result<Option<Transfer>, TransferError> {
            Ok(None)
        }

        async fn find_stale(
            &self,
            _: TransferState,
            _: DateTime<Utc>,
            _: usize,
        ) -> Result<Vec<Transfer>, TransferError> {
            Ok(Vec::new())
        }

        async fn begin(&self) -> Result<Box<dyn TransferTx>, TransferError> {
            Err(TransferError::DatabaseError("connection reset".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_write_releases_lock() {
        let lock = Arc::new(InProcessLock::new());
        let service = TransferService::new(Arc::new(BrokenStore), lock.clone(), fast_config());

        let err = service.initiate("key-1", &request("1.00")).await.unwrap_err();
        assert!(matches!(err, TransferError::DatabaseError(_)));
        assert!(
            lock.try_acquire(&lock_key("key-1"), Duration::from_secs(1))
                .await
                .unwrap()
        );
    }
}
