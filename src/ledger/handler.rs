//! Account-side saga command handler
//!
//! Each command runs as one transaction: processed marker, balance change,
//! then the reply event in the account outbox. A duplicate marker skips the
//! step. A business-rule violation still commits (marker + failure event);
//! any other error rolls everything back so redelivery can try again.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::LedgerError;
use super::models::OperationKind;
use super::service::{Direction, Ledger};
use crate::broker::{EventHandler, HandlerError, Handling, decode_payload};
use crate::events::{
    AccountCreditFailed, AccountCredited, AccountDebitFailed, AccountDebited,
    AccountRefundFailed, AccountRefunded, EventType, TransferDepositRequested, TransferInitiated,
    TransferRefundRequested,
};
use crate::outbox::{AggregateType, NewOutboxEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied,
    /// Business rule rejected the step; a failure event was emitted
    Rejected(String),
    /// Marker already present; nothing done
    Duplicate,
}

struct LedgerStep<'a> {
    transaction_id: Uuid,
    kind: OperationKind,
    account_ref: &'a str,
    direction: Direction,
    amount: Decimal,
    currency: &'a str,
}

pub struct TransferCommandHandler {
    ledger: Arc<Ledger>,
}

impl TransferCommandHandler {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// TRANSFER_INITIATED: take the money from the sender.
    pub async fn debit_sender(&self, event: &TransferInitiated) -> Result<CommandOutcome, LedgerError> {
        let step = LedgerStep {
            transaction_id: event.transaction_id,
            kind: OperationKind::Debit,
            account_ref: &event.sender_account_id,
            direction: Direction::Debit,
            amount: event.amount,
            currency: &event.currency,
        };
        self.execute(
            step,
            || {
                NewOutboxEntry::for_event(
                    AggregateType::Account,
                    event.sender_account_id.clone(),
                    &AccountDebited {
                        transaction_id: event.transaction_id,
                        sender_account_id: event.sender_account_id.clone(),
                        amount: event.amount,
                        currency: event.currency.clone(),
                    },
                )
            },
            |reason| {
                NewOutboxEntry::for_event(
                    AggregateType::Account,
                    event.sender_account_id.clone(),
                    &AccountDebitFailed {
                        transaction_id: event.transaction_id,
                        sender_account_id: event.sender_account_id.clone(),
                        amount: event.amount,
                        currency: event.currency.clone(),
                        reason,
                    },
                )
            },
        )
        .await
    }

    /// TRANSFER_DEPOSIT_REQUESTED: pay the receiver.
    pub async fn credit_receiver(
        &self,
        event: &TransferDepositRequested,
    ) -> Result<CommandOutcome, LedgerError> {
        let step = LedgerStep {
            transaction_id: event.transaction_id,
            kind: OperationKind::Credit,
            account_ref: &event.receiver_account_id,
            direction: Direction::Credit,
            amount: event.amount,
            currency: &event.currency,
        };
        self.execute(
            step,
            || {
                NewOutboxEntry::for_event(
                    AggregateType::Account,
                    event.receiver_account_id.clone(),
                    &AccountCredited {
                        transaction_id: event.transaction_id,
                        receiver_account_id: event.receiver_account_id.clone(),
                        amount: event.amount,
                        currency: event.currency.clone(),
                    },
                )
            },
            |reason| {
                NewOutboxEntry::for_event(
                    AggregateType::Account,
                    event.receiver_account_id.clone(),
                    &AccountCreditFailed {
                        transaction_id: event.transaction_id,
                        receiver_account_id: event.receiver_account_id.clone(),
                        amount: event.amount,
                        currency: event.currency.clone(),
                        reason,
                    },
                )
            },
        )
        .await
    }

    /// TRANSFER_REFUND_REQUESTED: give the sender their money back.
    pub async fn refund_sender(
        &self,
        event: &TransferRefundRequested,
    ) -> Result<CommandOutcome, LedgerError> {
        info!(
            transaction_id = %event.transaction_id,
            reason = %event.reason,
            "Processing refund request"
        );
        let step = LedgerStep {
            transaction_id: event.transaction_id,
            kind: OperationKind::Refund,
            account_ref: &event.sender_account_id,
            direction: Direction::Credit,
            amount: event.amount,
            currency: &event.currency,
        };
        self.execute(
            step,
            || {
                NewOutboxEntry::for_event(
                    AggregateType::Account,
                    event.sender_account_id.clone(),
                    &AccountRefunded {
                        transaction_id: event.transaction_id,
                        sender_account_id: event.sender_account_id.clone(),
                        amount: event.amount,
                        currency: event.currency.clone(),
                    },
                )
            },
            |reason| {
                NewOutboxEntry::for_event(
                    AggregateType::Account,
                    event.sender_account_id.clone(),
                    &AccountRefundFailed {
                        transaction_id: event.transaction_id,
                        sender_account_id: event.sender_account_id.clone(),
                        amount: event.amount,
                        currency: event.currency.clone(),
                        reason,
                    },
                )
            },
        )
        .await
    }

    async fn execute<S, F>(
        &self,
        step: LedgerStep<'_>,
        on_success: S,
        on_failure: F,
    ) -> Result<CommandOutcome, LedgerError>
    where
        S: FnOnce() -> Result<NewOutboxEntry, serde_json::Error> + Send,
        F: FnOnce(String) -> Result<NewOutboxEntry, serde_json::Error> + Send,
    {
        let mut tx = self.ledger.store().begin().await?;

        if !tx.try_mark_processed(step.transaction_id, step.kind).await? {
            info!(
                transaction_id = %step.transaction_id,
                kind = %step.kind,
                "Step already processed, skipping duplicate event"
            );
            return Ok(CommandOutcome::Duplicate);
        }

        let applied = self
            .ledger
            .apply_in(
                tx.as_mut(),
                step.account_ref,
                step.direction,
                step.amount,
                step.currency,
            )
            .await;

        let outcome = match applied {
            Ok(account) => {
                tx.insert_outbox(on_success()?).await?;
                info!(
                    transaction_id = %step.transaction_id,
                    kind = %step.kind,
                    account_id = account.id,
                    balance = %account.balance,
                    "Saga step applied"
                );
                CommandOutcome::Applied
            }
            Err(e) if e.is_business() => {
                let reason = e.to_string();
                warn!(
                    transaction_id = %step.transaction_id,
                    kind = %step.kind,
                    code = e.code(),
                    %reason,
                    "Saga step rejected"
                );
                tx.insert_outbox(on_failure(reason.clone())?).await?;
                CommandOutcome::Rejected(reason)
            }
            Err(e) => return Err(e),
        };

        tx.commit().await?;
        Ok(outcome)
    }
}

fn into_handler_error(err: LedgerError) -> HandlerError {
    match err {
        LedgerError::Serialization(msg) => HandlerError::Poison(msg),
        other => HandlerError::Transient(other.to_string()),
    }
}

#[async_trait]
impl EventHandler for TransferCommandHandler {
    async fn handle(&self, event_type: EventType, payload: &str) -> Result<Handling, HandlerError> {
        let result = match event_type {
            EventType::TransferInitiated => self.debit_sender(&decode_payload(payload)?).await,
            EventType::TransferDepositRequested => {
                self.credit_receiver(&decode_payload(payload)?).await
            }
            EventType::TransferRefundRequested => {
                self.refund_sender(&decode_payload(payload)?).await
            }
            _ => return Ok(Handling::Ignored),
        };
        result.map(|_| Handling::Handled).map_err(into_handler_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::ledger::models::{AccountStatus, NewAccount};
    use crate::ledger::service::LedgerConfig;
    use crate::ledger::store::{LedgerStore, MemoryLedgerStore};
    use crate::outbox::{MemoryOutbox, OutboxStatus};
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    struct Fixture {
        store: MemoryLedgerStore,
        ledger: Arc<Ledger>,
        handler: TransferCommandHandler,
    }

    fn fixture() -> Fixture {
        let store = MemoryLedgerStore::new(MemoryOutbox::new());
        let ledger = Arc::new(Ledger::new(
            Arc::new(store.clone()),
            LedgerConfig {
                retry_delay: std::time::Duration::from_millis(1),
                ..Default::default()
            },
        ));
        Fixture {
            store,
            handler: TransferCommandHandler::new(ledger.clone()),
            ledger,
        }
    }

    fn initiated(sender: i64, amount: &str) -> TransferInitiated {
        TransferInitiated {
            transaction_id: Uuid::new_v4(),
            sender_account_id: sender.to_string(),
            receiver_account_id: "999".to_string(),
            amount: d(amount),
            currency: "TRY".to_string(),
        }
    }

    #[tokio::test]
    async fn test_debit_writes_balance_and_event_together() {
        let f = fixture();
        let account = f.ledger.create_account("c1", d("1000.00"), "TRY").await.unwrap();
        let event = initiated(account.id, "100.00");

        let outcome = f.handler.debit_sender(&event).await.unwrap();
        assert_eq!(outcome, CommandOutcome::Applied);

        let stored = f.store.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, d("900.00"));

        let rows = f.store.outbox().records();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "ACCOUNT_DEBITED");
        assert_eq!(rows[0].status, OutboxStatus::Pending);
        assert_eq!(rows[0].aggregate_type, "ACCOUNT");
        assert_eq!(rows[0].aggregate_id, account.id.to_string());

        let debited: AccountDebited = events::decode(&rows[0].payload).unwrap();
        assert_eq!(debited.transaction_id, event.transaction_id);
        assert_eq!(debited.amount, d("100.00"));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_skipped() {
        let f = fixture();
        let account = f.ledger.create_account("c1", d("1000.00"), "TRY").await.unwrap();
        let event = initiated(account.id, "100.00");

        f.handler.debit_sender(&event).await.unwrap();
        let again = f.handler.debit_sender(&event).await.unwrap();
        assert_eq!(again, CommandOutcome::Duplicate);

        let stored = f.store.find_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, d("900.00"));
        assert_eq!(f.store.outbox().records().len(), 1);
    }

    #[tokio::test]
    async fn test_business_failure_emits_failure_event() {
        let f = fixture();
        let account = f.ledger.create_account("c1", d("50.00"), "TRY").await.unwrap();
        let event = initiated(account.id, "100.00");

        let outcome = f.handler.debit_sender(&event).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Rejected(ref r) if r.contains("Insufficient")));

        let rows = f.store.outbox().records_of_type(EventType::AccountDebitFailed);
        assert_eq!(rows.len(), 1);
        let failed: AccountDebitFailed = events::decode(&rows[0].payload).unwrap();
        assert!(failed.reason.contains("Insufficient balance"));

        // marker committed: redelivery does not emit a second failure
        assert_eq!(
            f.handler.debit_sender(&event).await.unwrap(),
            CommandOutcome::Duplicate
        );
        assert!(f.store.is_processed(event.transaction_id, OperationKind::Debit).await);
    }

    #[tokio::test]
    async fn test_credit_overflow_emits_failure_event() {
        let f = fixture();
        let receiver = f
            .store
            .create_account(NewAccount {
                customer_id: "c2".to_string(),
                balance: Decimal::MAX,
                currency: "TRY".to_string(),
                daily_limit: None,
            })
            .await
            .unwrap();
        let event = TransferDepositRequested {
            transaction_id: Uuid::new_v4(),
            receiver_account_id: receiver.id.to_string(),
            amount: d("1.00"),
            currency: "TRY".to_string(),
        };

        // runs the way the consumer task does, so a panic would surface as a JoinError
        let handler = Arc::new(f.handler);
        let outcome = {
            let handler = handler.clone();
            let event = event.clone();
            tokio::spawn(async move { handler.credit_receiver(&event).await })
                .await
                .unwrap()
                .unwrap()
        };
        assert!(matches!(outcome, CommandOutcome::Rejected(ref r) if r.contains("storable range")));

        let rows = f.store.outbox().records_of_type(EventType::AccountCreditFailed);
        assert_eq!(rows.len(), 1);
        let failed: AccountCreditFailed = events::decode(&rows[0].payload).unwrap();
        assert_eq!(failed.transaction_id, event.transaction_id);

        let stored = f.store.find_account(receiver.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, Decimal::MAX);
        assert!(f.store.is_processed(event.transaction_id, OperationKind::Credit).await);
    }

    #[tokio::test]
    async fn test_infrastructure_failure_rolls_back_marker() {
        let f = fixture();
        let account = f.ledger.create_account("c1", d("1000.00"), "TRY").await.unwrap();
        let event = initiated(account.id, "100.00");

        // more conflicts than the ledger will retry
        f.store.inject_conflicts(1000);
        let err = f.handler.debit_sender(&event).await.unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrentModification { .. }));
        assert!(!f.store.is_processed(event.transaction_id, OperationKind::Debit).await);
        assert!(f.store.outbox().records().is_empty());

        f.store.inject_conflicts(0);
        assert_eq!(
            f.handler.debit_sender(&event).await.unwrap(),
            CommandOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_credit_and_refund_use_separate_markers() {
        let f = fixture();
        let sender = f.ledger.create_account("c1", d("0.00"), "TRY").await.unwrap();
        let receiver = f.ledger.create_account("c2", d("0.00"), "TRY").await.unwrap();
        f.store.set_status(receiver.id, AccountStatus::Closed).await;
        let transaction_id = Uuid::new_v4();

        let credit = TransferDepositRequested {
            transaction_id,
            receiver_account_id: receiver.id.to_string(),
            amount: d("25.00"),
            currency: "TRY".to_string(),
        };
        let outcome = f.handler.credit_receiver(&credit).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Rejected(_)));
        assert_eq!(
            f.store
                .outbox()
                .records_of_type(EventType::AccountCreditFailed)
                .len(),
            1
        );

        let refund = TransferRefundRequested {
            transaction_id,
            sender_account_id: sender.id.to_string(),
            amount: d("25.00"),
            currency: "TRY".to_string(),
            reason: "Rollback due to Credit Failure: closed".to_string(),
        };
        assert_eq!(
            f.handler.refund_sender(&refund).await.unwrap(),
            CommandOutcome::Applied
        );
        let stored = f.store.find_account(sender.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, d("25.00"));
        assert_eq!(
            f.store
                .outbox()
                .records_of_type(EventType::AccountRefunded)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_handler_routing() {
        let f = fixture();
        assert_eq!(
            f.handler
                .handle(EventType::AccountCredited, "{}")
                .await
                .unwrap(),
            Handling::Ignored
        );

        let err = f
            .handler
            .handle(EventType::TransferInitiated, r#"{"transactionId":42}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Poison(_)));

        let account = f.ledger.create_account("c1", d("10.00"), "TRY").await.unwrap();
        let payload = events::encode(&initiated(account.id, "1.00")).unwrap();
        assert_eq!(
            f.handler
                .handle(EventType::TransferInitiated, &payload)
                .await
                .unwrap(),
            Handling::Handled
        );
    }
}
