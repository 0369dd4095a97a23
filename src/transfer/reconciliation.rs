//! Reconciliation scanner
//!
//! Background worker that finds sagas stuck waiting for a reply that may
//! have been lost in transit, and pushes them forward:
//!
//! - DEBITED past the timeout: start the refund.
//! - REFUND_INITIATED past the timeout: re-send the refund request, or give
//!   up once the transfer is older than `max_retry_duration`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use super::error::TransferError;
use super::orchestrator::{SagaOrchestrator, Transition};
use super::state::TransferState;
use super::store::TransferStore;

/// Configuration for the reconciliation scanner
#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// How often to scan
    pub interval: Duration,
    /// How long a saga may sit in DEBITED or REFUND_INITIATED untouched
    pub timeout: Duration,
    /// Age after which refund retries stop
    pub max_retry_duration: Duration,
    /// Maximum transfers per state per scan
    pub batch_size: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
            max_retry_duration: Duration::from_secs(24 * 60 * 60),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub timed_out: usize,
    pub refunds_retried: usize,
    pub gave_up: usize,
    pub errors: usize,
}

impl ReconciliationReport {
    pub fn total(&self) -> usize {
        self.timed_out + self.refunds_retried + self.gave_up
    }
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct SagaReconciler {
    store: Arc<dyn TransferStore>,
    orchestrator: Arc<SagaOrchestrator>,
    config: ReconciliationConfig,
}

impl SagaReconciler {
    pub fn new(
        store: Arc<dyn TransferStore>,
        orchestrator: Arc<SagaOrchestrator>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            config,
        }
    }

    /// Run the scan loop forever.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.timeout.as_secs(),
            max_retry_secs = self.config.max_retry_duration.as_secs(),
            "Starting saga reconciliation"
        );

        loop {
            match self.scan_once().await {
                Ok(report) if report.total() > 0 || report.errors > 0 => {
                    info!(
                        timed_out = report.timed_out,
                        refunds_retried = report.refunds_retried,
                        gave_up = report.gave_up,
                        errors = report.errors,
                        "Reconciliation scan finished"
                    );
                }
                Ok(_) => debug!("Reconciliation scan found nothing stuck"),
                Err(e) => error!(error = %e, "Reconciliation scan failed"),
            }

            tokio::time::sleep(self.config.interval).await;
        }
    }

    pub async fn scan_once(&self) -> Result<ReconciliationReport, TransferError> {
        self.scan_once_at(Utc::now()).await
    }

    /// One scan as of `now`. A failure on one transfer is logged and counted;
    /// only a failed lookup aborts the scan.
    pub async fn scan_once_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationReport, TransferError> {
        let stale_before = before(now, self.config.timeout);
        let give_up_before = before(now, self.config.max_retry_duration);
        let mut report = ReconciliationReport::default();

        let debited = self
            .store
            .find_stale(TransferState::Debited, stale_before, self.config.batch_size)
            .await?;
        for transfer in debited {
            warn!(
                transaction_id = %transfer.transaction_id,
                updated_at = %transfer.updated_at,
                "Stuck DEBITED transfer, no reply from receiver side"
            );
            match self.orchestrator.on_timeout(transfer.transaction_id).await {
                Ok(Transition::Applied(_)) => report.timed_out += 1,
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(transaction_id = %transfer.transaction_id, error = %e, "Timeout handling failed");
                }
            }
        }

        let refunding = self
            .store
            .find_stale(
                TransferState::RefundInitiated,
                stale_before,
                self.config.batch_size,
            )
            .await?;
        for transfer in refunding {
            let id = transfer.transaction_id;
            let result = if transfer.created_at < give_up_before {
                self.orchestrator
                    .give_up(id, self.config.max_retry_duration)
                    .await
                    .map(|t| (t, true))
            } else {
                warn!(transaction_id = %id, "Stuck REFUND_INITIATED transfer, retrying refund");
                self.orchestrator.retry_refund(id).await.map(|t| (t, false))
            };

            match result {
                Ok((Transition::Applied(_), true)) => report.gave_up += 1,
                Ok((Transition::Applied(_), false)) => report.refunds_retried += 1,
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(transaction_id = %id, error = %e, "Refund reconciliation failed");
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AccountDebited, EventType};
    use crate::outbox::MemoryOutbox;
    use crate::transfer::store::MemoryTransferStore;
    use crate::transfer::types::NewTransfer;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    struct Fixture {
        store: MemoryTransferStore,
        saga: Arc<SagaOrchestrator>,
        reconciler: SagaReconciler,
    }

    fn fixture() -> Fixture {
        let store = MemoryTransferStore::new(MemoryOutbox::new());
        let saga = Arc::new(SagaOrchestrator::new(Arc::new(store.clone())));
        let reconciler = SagaReconciler::new(
            Arc::new(store.clone()),
            saga.clone(),
            ReconciliationConfig::default(),
        );
        Fixture {
            store,
            saga,
            reconciler,
        }
    }

    async fn debited_transfer(f: &Fixture) -> Uuid {
        let transaction_id = Uuid::new_v4();
        let mut tx = f.store.begin().await.unwrap();
        tx.insert_transfer(
            NewTransfer {
                idempotency_key: transaction_id.to_string(),
                transaction_id,
                sender_account_id: "1".to_string(),
                receiver_account_id: "2".to_string(),
                amount: Decimal::ONE,
                currency: "TRY".to_string(),
                request_hash: "h".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        f.saga
            .on_debit_success(&AccountDebited {
                transaction_id,
                sender_account_id: "1".to_string(),
                amount: Decimal::ONE,
                currency: "TRY".to_string(),
            })
            .await
            .unwrap();
        transaction_id
    }

    fn refund_requests(f: &Fixture) -> usize {
        f.store
            .outbox()
            .records_of_type(EventType::TransferRefundRequested)
            .len()
    }

    async fn state(f: &Fixture, id: Uuid) -> TransferState {
        f.store.find_by_transaction_id(id).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn test_fresh_transfers_are_left_alone() {
        let f = fixture();
        let id = debited_transfer(&f).await;

        let report = f.reconciler.scan_once().await.unwrap();
        assert_eq!(report, ReconciliationReport::default());
        assert_eq!(state(&f, id).await, TransferState::Debited);
    }

    #[tokio::test]
    async fn test_stale_debited_times_out() {
        let f = fixture();
        let id = debited_transfer(&f).await;
        let old = Utc::now() - TimeDelta::minutes(5);
        f.store.backdate(id, old, old).await;

        let report = f.reconciler.scan_once().await.unwrap();
        assert_eq!(report.timed_out, 1);
        assert_eq!(state(&f, id).await, TransferState::RefundInitiated);
        assert_eq!(refund_requests(&f), 1);

        // updated_at was just touched; nothing more to do this cycle
        let report = f.reconciler.scan_once().await.unwrap();
        assert_eq!(report.total(), 0);
    }

    #[tokio::test]
    async fn test_stale_refund_is_retried() {
        let f = fixture();
        let id = debited_transfer(&f).await;
        f.saga.on_timeout(id).await.unwrap();
        let created = Utc::now() - TimeDelta::hours(1);
        f.store
            .backdate(id, created, Utc::now() - TimeDelta::minutes(2))
            .await;

        let report = f.reconciler.scan_once().await.unwrap();
        assert_eq!(report.refunds_retried, 1);
        assert_eq!(state(&f, id).await, TransferState::RefundInitiated);
        assert_eq!(refund_requests(&f), 2);
    }

    #[tokio::test]
    async fn test_gives_up_on_old_refund() {
        let f = fixture();
        let id = debited_transfer(&f).await;
        f.saga.on_timeout(id).await.unwrap();
        let created = Utc::now() - TimeDelta::days(2);
        f.store
            .backdate(id, created, Utc::now() - TimeDelta::minutes(2))
            .await;

        let report = f.reconciler.scan_once().await.unwrap();
        assert_eq!(report.gave_up, 1);
        assert_eq!(state(&f, id).await, TransferState::RefundFailed);
        assert_eq!(refund_requests(&f), 1);

        // far in the future: still nothing more for this transfer
        let later = Utc::now() + TimeDelta::days(3);
        let report = f.reconciler.scan_once_at(later).await.unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(refund_requests(&f), 1);
    }

    #[test]
    fn test_before_saturates() {
        let now = Utc::now();
        assert_eq!(before(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(before(now, Duration::from_secs(60)), now - TimeDelta::seconds(60));
    }
}
