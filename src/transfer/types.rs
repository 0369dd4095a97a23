//! Transfer records and request/response shapes

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::TransferError;
use super::state::TransferState;
use crate::money;

/// Persisted saga record
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub id: i64,
    pub idempotency_key: String,
    /// Stable for the saga's lifetime, carried by every event
    pub transaction_id: Uuid,
    pub sender_account_id: String,
    pub receiver_account_id: String,
    pub amount: Decimal,
    pub currency: String,
    /// Canonical request hash; `None` only for rows written before hashing existed
    pub request_hash: Option<String>,
    pub state: TransferState,
    pub failure_reason: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row to insert for a fresh transfer
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub idempotency_key: String,
    pub transaction_id: Uuid,
    pub sender_account_id: String,
    pub receiver_account_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub request_hash: String,
}

/// Client request body for `POST /api/v1/transfers`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub sender_account_id: String,
    pub receiver_account_id: String,
    pub amount: Decimal,
    pub currency: String,
}

impl TransferRequest {
    /// Check fields and return the normalized request: trimmed ids,
    /// uppercased currency.
    pub fn validate(&self) -> Result<TransferRequest, TransferError> {
        let sender = self.sender_account_id.trim();
        let receiver = self.receiver_account_id.trim();
        if sender.is_empty() {
            return Err(TransferError::InvalidRequest(
                "Sender account ID is required".to_string(),
            ));
        }
        if receiver.is_empty() {
            return Err(TransferError::InvalidRequest(
                "Receiver account ID is required".to_string(),
            ));
        }
        if sender == receiver {
            return Err(TransferError::InvalidRequest(
                "Sender and receiver account cannot be the same".to_string(),
            ));
        }
        let amount = money::validate_amount(self.amount)?;
        let currency = money::normalize_currency(&self.currency)?;

        Ok(TransferRequest {
            sender_account_id: sender.to_string(),
            receiver_account_id: receiver.to_string(),
            amount,
            currency,
        })
    }
}

/// Initiation result; also returned for a replayed idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub transaction_id: Uuid,
    pub state: TransferState,
    pub created_at: DateTime<Utc>,
}

impl From<&Transfer> for TransferResponse {
    fn from(t: &Transfer) -> Self {
        Self {
            transaction_id: t.transaction_id,
            state: t.state,
            created_at: t.created_at,
        }
    }
}

/// Full view for `GET /api/v1/transfers/{transactionId}`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDetails {
    pub transaction_id: Uuid,
    pub sender_account_id: String,
    pub receiver_account_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub state: TransferState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Transfer> for TransferDetails {
    fn from(t: Transfer) -> Self {
        Self {
            transaction_id: t.transaction_id,
            sender_account_id: t.sender_account_id,
            receiver_account_id: t.receiver_account_id,
            amount: t.amount,
            currency: t.currency,
            state: t.state,
            failure_reason: t.failure_reason,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}
