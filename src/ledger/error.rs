//! Ledger errors
//!
//! Business-rule violations are terminal for the operation. On the saga path
//! they become typed failure events; everything else rolls the transaction
//! back so the message is redelivered.

use rust_decimal::Decimal;
use thiserror::Error;

use super::models::AccountStatus;
use crate::money::MoneyError;

#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account {account_id} is not active (status: {status})")]
    AccountNotActive {
        account_id: i64,
        status: AccountStatus,
    },

    #[error("Currency mismatch: account holds {account_currency}, request uses {requested}")]
    CurrencyMismatch {
        account_currency: String,
        requested: String,
    },

    #[error("Insufficient balance on account {account_id}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        account_id: i64,
        balance: Decimal,
        requested: Decimal,
    },

    #[error("Daily limit exceeded on account {account_id}: limit {limit}, requested {requested}")]
    DailyLimitExceeded {
        account_id: i64,
        limit: Decimal,
        requested: Decimal,
    },

    #[error("Balance of account {account_id} would leave the storable range: balance {balance}, amount {amount}")]
    BalanceOutOfRange {
        account_id: i64,
        balance: Decimal,
        amount: Decimal,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(#[from] MoneyError),

    #[error("Account {account_id} kept changing underneath us after {attempts} attempts")]
    ConcurrentModification { account_id: i64, attempts: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl LedgerError {
    /// Terminal business-rule violation (as opposed to infrastructure failure)
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            LedgerError::AccountNotFound(_)
                | LedgerError::AccountNotActive { .. }
                | LedgerError::CurrencyMismatch { .. }
                | LedgerError::InsufficientBalance { .. }
                | LedgerError::DailyLimitExceeded { .. }
                | LedgerError::BalanceOutOfRange { .. }
                | LedgerError::InvalidAmount(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::AccountNotActive { .. } => "ACCOUNT_NOT_ACTIVE",
            LedgerError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            LedgerError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            LedgerError::DailyLimitExceeded { .. } => "DAILY_LIMIT_EXCEEDED",
            LedgerError::BalanceOutOfRange { .. } => "BALANCE_OUT_OF_RANGE",
            LedgerError::InvalidAmount(_) => "VALIDATION_ERROR",
            LedgerError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            LedgerError::Serialization(_) => "SERIALIZATION_ERROR",
            LedgerError::Database(_) => "DATABASE_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::InvalidAmount(_) => 400,
            LedgerError::AccountNotFound(_) => 404,
            LedgerError::CurrencyMismatch { .. } | LedgerError::ConcurrentModification { .. } => {
                409
            }
            LedgerError::AccountNotActive { .. }
            | LedgerError::InsufficientBalance { .. }
            | LedgerError::DailyLimitExceeded { .. }
            | LedgerError::BalanceOutOfRange { .. } => 422,
            LedgerError::Serialization(_) | LedgerError::Database(_) => 500,
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}
