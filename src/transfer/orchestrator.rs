//! Saga orchestrator
//!
//! # State Machine
//!
//! ```text
//! STARTED ──debit ok──▶ DEBITED ──credit ok──▶ COMPLETED
//!    │                     │
//!    │ debit failed        │ credit failed / timeout
//!    ▼                     ▼
//! DEBIT_FAILED      REFUND_INITIATED ──refund ok──▶ REFUNDED
//!                          │
//!                          │ refund failed / gave up
//!                          ▼
//!                    REFUND_FAILED
//! ```
//!
//! Every transition is guarded by the persisted state and version. A guard
//! mismatch is a silent no-op, which absorbs duplicate and out-of-order
//! deliveries. A transition that must notify the account side writes its
//! outbox row in the same transaction as the state change.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::TransferError;
use super::state::TransferState;
use super::store::TransferStore;
use super::types::Transfer;
use crate::events::{
    AccountCreditFailed, AccountCredited, AccountDebitFailed, AccountDebited, AccountRefundFailed,
    AccountRefunded, TransferDepositRequested, TransferRefundRequested,
};
use crate::outbox::{AggregateType, NewOutboxEntry};

pub const TIMEOUT_FAILURE_REASON: &str = "Saga Timeout: Receiver did not respond within threshold.";
pub const TIMEOUT_REFUND_REASON: &str = "Rollback due to Saga Timeout";
pub const RETRY_REFUND_REASON: &str = "Refund retry by Saga Reconciliation";

/// Result of one guarded transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied(TransferState),
    /// Guard did not match; carries the state found
    Skipped(TransferState),
    NotFound,
}

type Emit<'a> = Box<dyn FnOnce(&Transfer) -> Result<Option<NewOutboxEntry>, serde_json::Error> + Send + 'a>;

fn no_event(_: &Transfer) -> Result<Option<NewOutboxEntry>, serde_json::Error> {
    Ok(None)
}

fn refund_request(transfer: &Transfer, reason: String) -> Result<Option<NewOutboxEntry>, serde_json::Error> {
    let event = TransferRefundRequested {
        transaction_id: transfer.transaction_id,
        sender_account_id: transfer.sender_account_id.clone(),
        amount: transfer.amount,
        currency: transfer.currency.clone(),
        reason,
    };
    NewOutboxEntry::for_event(
        AggregateType::Transfer,
        transfer.transaction_id.to_string(),
        &event,
    )
    .map(Some)
}

pub struct SagaOrchestrator {
    store: Arc<dyn TransferStore>,
}

impl SagaOrchestrator {
    pub fn new(store: Arc<dyn TransferStore>) -> Self {
        Self { store }
    }

    /// STARTED → DEBITED, request the deposit on the receiver's account.
    pub async fn on_debit_success(&self, event: &AccountDebited) -> Result<Transition, TransferError> {
        let result = self
            .transition(
                event.transaction_id,
                TransferState::Started,
                TransferState::Debited,
                None,
                Box::new(|t: &Transfer| {
                    let deposit = TransferDepositRequested {
                        transaction_id: t.transaction_id,
                        receiver_account_id: t.receiver_account_id.clone(),
                        amount: t.amount,
                        currency: t.currency.clone(),
                    };
                    NewOutboxEntry::for_event(
                        AggregateType::Transfer,
                        t.transaction_id.to_string(),
                        &deposit,
                    )
                    .map(Some)
                }),
            )
            .await?;
        if result == Transition::Applied(TransferState::Debited) {
            info!(transaction_id = %event.transaction_id, "Debit confirmed, deposit requested");
        }
        Ok(result)
    }

    /// STARTED → DEBIT_FAILED. Nothing moved, so nothing to compensate.
    pub async fn on_debit_failure(
        &self,
        event: &AccountDebitFailed,
    ) -> Result<Transition, TransferError> {
        let result = self
            .transition(
                event.transaction_id,
                TransferState::Started,
                TransferState::DebitFailed,
                Some(event.reason.clone()),
                Box::new(no_event),
            )
            .await?;
        if result == Transition::Applied(TransferState::DebitFailed) {
            error!(
                transaction_id = %event.transaction_id,
                reason = %event.reason,
                "Debit failed, transfer aborted"
            );
        }
        Ok(result)
    }

    /// DEBITED → COMPLETED.
    pub async fn on_credit_success(
        &self,
        event: &AccountCredited,
    ) -> Result<Transition, TransferError> {
        let result = self
            .transition(
                event.transaction_id,
                TransferState::Debited,
                TransferState::Completed,
                None,
                Box::new(no_event),
            )
            .await?;
        match result {
            Transition::Applied(_) => {
                info!(transaction_id = %event.transaction_id, "Credit confirmed, saga completed");
            }
            Transition::Skipped(state) if state != TransferState::Completed => {
                // e.g. the reconciliation timeout already started a refund
                warn!(
                    transaction_id = %event.transaction_id,
                    state = %state,
                    "Credit confirmation arrived in unexpected state"
                );
            }
            _ => {}
        }
        Ok(result)
    }

    /// DEBITED → REFUND_INITIATED, request the compensating refund.
    pub async fn on_credit_failure(
        &self,
        event: &AccountCreditFailed,
    ) -> Result<Transition, TransferError> {
        let refund_reason = format!("Rollback due to Credit Failure: {}", event.reason);
        let result = self
            .transition(
                event.transaction_id,
                TransferState::Debited,
                TransferState::RefundInitiated,
                Some(event.reason.clone()),
                Box::new(move |t: &Transfer| refund_request(t, refund_reason)),
            )
            .await?;
        if result == Transition::Applied(TransferState::RefundInitiated) {
            error!(
                transaction_id = %event.transaction_id,
                reason = %event.reason,
                "Credit failed, refund initiated"
            );
        }
        Ok(result)
    }

    /// DEBITED → REFUND_INITIATED after the receiver side went quiet.
    pub async fn on_timeout(&self, transaction_id: Uuid) -> Result<Transition, TransferError> {
        let result = self
            .transition(
                transaction_id,
                TransferState::Debited,
                TransferState::RefundInitiated,
                Some(TIMEOUT_FAILURE_REASON.to_string()),
                Box::new(|t: &Transfer| refund_request(t, TIMEOUT_REFUND_REASON.to_string())),
            )
            .await?;
        if result == Transition::Applied(TransferState::RefundInitiated) {
            warn!(transaction_id = %transaction_id, "Saga timed out, refund initiated");
        }
        Ok(result)
    }

    /// Re-send the refund request for a stuck REFUND_INITIATED transfer and
    /// touch its timestamp.
    pub async fn retry_refund(&self, transaction_id: Uuid) -> Result<Transition, TransferError> {
        let result = self
            .transition(
                transaction_id,
                TransferState::RefundInitiated,
                TransferState::RefundInitiated,
                None,
                Box::new(|t: &Transfer| refund_request(t, RETRY_REFUND_REASON.to_string())),
            )
            .await?;
        if matches!(result, Transition::Applied(_)) {
            warn!(transaction_id = %transaction_id, "Refund request re-sent");
        }
        Ok(result)
    }

    /// REFUND_INITIATED → REFUNDED.
    pub async fn on_refund_success(
        &self,
        event: &AccountRefunded,
    ) -> Result<Transition, TransferError> {
        let result = self
            .transition(
                event.transaction_id,
                TransferState::RefundInitiated,
                TransferState::Refunded,
                None,
                Box::new(no_event),
            )
            .await?;
        if result == Transition::Applied(TransferState::Refunded) {
            info!(transaction_id = %event.transaction_id, "Refund confirmed, transfer rolled back");
        }
        Ok(result)
    }

    /// REFUND_INITIATED → REFUND_FAILED. Terminal, needs manual intervention.
    pub async fn on_refund_failure(
        &self,
        event: &AccountRefundFailed,
    ) -> Result<Transition, TransferError> {
        self.fail_refund(event.transaction_id, event.reason.clone()).await
    }

    /// REFUND_INITIATED → REFUND_FAILED once retrying has gone on too long.
    pub async fn give_up(
        &self,
        transaction_id: Uuid,
        max_retry_duration: Duration,
    ) -> Result<Transition, TransferError> {
        self.fail_refund(
            transaction_id,
            format!("Saga Reconciliation gave up after {:?}", max_retry_duration),
        )
        .await
    }

    async fn fail_refund(
        &self,
        transaction_id: Uuid,
        reason: String,
    ) -> Result<Transition, TransferError> {
        let result = self
            .transition(
                transaction_id,
                TransferState::RefundInitiated,
                TransferState::RefundFailed,
                Some(reason.clone()),
                Box::new(no_event),
            )
            .await?;
        if result == Transition::Applied(TransferState::RefundFailed) {
            error!(
                transaction_id = %transaction_id,
                reason = %reason,
                alert = "CRITICAL",
                "Refund failed, money is stuck and needs manual intervention"
            );
        }
        Ok(result)
    }

    async fn transition(
        &self,
        transaction_id: Uuid,
        from: TransferState,
        to: TransferState,
        reason: Option<String>,
        emit: Emit<'_>,
    ) -> Result<Transition, TransferError> {
        let mut tx = self.store.begin().await?;

        let Some(transfer) = tx.load_transfer(transaction_id).await? else {
            warn!(transaction_id = %transaction_id, "Event for unknown transfer");
            return Ok(Transition::NotFound);
        };

        if transfer.state != from {
            debug!(
                transaction_id = %transaction_id,
                state = %transfer.state,
                expected = %from,
                "Transition guard not met, skipping"
            );
            return Ok(Transition::Skipped(transfer.state));
        }

        let updated = tx
            .update_state(
                transaction_id,
                from,
                transfer.version,
                to,
                reason.as_deref(),
                Utc::now(),
            )
            .await?;
        if !updated {
            debug!(transaction_id = %transaction_id, "Concurrent transition won, skipping");
            return Ok(Transition::Skipped(transfer.state));
        }

        if let Some(entry) = emit(&transfer)? {
            tx.insert_outbox(entry).await?;
        }
        tx.commit().await?;

        debug!(transaction_id = %transaction_id, from = %from, to = %to, "Saga state updated");
        Ok(Transition::Applied(to))
    }
}
