//! Account-side replies into saga transitions

use std::sync::Arc;

use async_trait::async_trait;

use super::error::TransferError;
use super::orchestrator::{SagaOrchestrator, Transition};
use crate::broker::{EventHandler, HandlerError, Handling, decode_payload};
use crate::events::EventType;

pub struct TransferEventListener {
    orchestrator: Arc<SagaOrchestrator>,
}

impl TransferEventListener {
    pub fn new(orchestrator: Arc<SagaOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

fn into_handler_error(err: TransferError) -> HandlerError {
    match err {
        TransferError::Serialization(msg) => HandlerError::Poison(msg),
        other => HandlerError::Transient(other.to_string()),
    }
}

#[async_trait]
impl EventHandler for TransferEventListener {
    async fn handle(&self, event_type: EventType, payload: &str) -> Result<Handling, HandlerError> {
        let saga = &self.orchestrator;
        let result: Result<Transition, TransferError> = match event_type {
            EventType::AccountDebited => saga.on_debit_success(&decode_payload(payload)?).await,
            EventType::AccountDebitFailed => saga.on_debit_failure(&decode_payload(payload)?).await,
            EventType::AccountCredited => saga.on_credit_success(&decode_payload(payload)?).await,
            EventType::AccountCreditFailed => {
                saga.on_credit_failure(&decode_payload(payload)?).await
            }
            EventType::AccountRefunded => saga.on_refund_success(&decode_payload(payload)?).await,
            EventType::AccountRefundFailed => {
                saga.on_refund_failure(&decode_payload(payload)?).await
            }
            _ => return Ok(Handling::Ignored),
        };
        result.map(|_| Handling::Handled).map_err(into_handler_error)
    }
}
