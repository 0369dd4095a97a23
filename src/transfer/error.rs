//! Transfer error types

use thiserror::Error;

use crate::money::MoneyError;

/// Transfer error types
///
/// Error codes are stable and surface in API responses.
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    InvalidMoney(#[from] MoneyError),

    // === Idempotency Errors ===
    #[error("Idempotency key {0} was already used with a different request")]
    IdempotencyKeyReuse(String),

    #[error("Transfer with idempotency key {0} is in progress")]
    TransferInProgress(String),

    // === Lookup ===
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    // === System Errors ===
    #[error("Idempotency lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidRequest(_) | TransferError::InvalidMoney(_) => {
                "VALIDATION_ERROR"
            }
            TransferError::IdempotencyKeyReuse(_) => "IDEMPOTENCY_KEY_REUSE",
            TransferError::TransferInProgress(_) => "TRANSFER_IN_PROGRESS",
            TransferError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::LockUnavailable(_) => "LOCK_UNAVAILABLE",
            TransferError::Serialization(_) => "SERIALIZATION_ERROR",
            TransferError::DatabaseError(_) => "DATABASE_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::InvalidRequest(_) | TransferError::InvalidMoney(_) => 400,
            TransferError::TransferNotFound(_) => 404,
            TransferError::IdempotencyKeyReuse(_) | TransferError::TransferInProgress(_) => 409,
            TransferError::Serialization(_) | TransferError::DatabaseError(_) => 500,
            TransferError::LockUnavailable(_) => 503,
        }
    }
}

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        TransferError::DatabaseError(e.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::Serialization(e.to_string())
    }
}
