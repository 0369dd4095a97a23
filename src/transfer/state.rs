//! Saga state definitions
//!
//! State IDs are stored in PostgreSQL as SMALLINT. Negative IDs belong to the
//! failure and compensation branch.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Saga states
///
/// Terminal states: COMPLETED (40), DEBIT_FAILED (-10), REFUNDED (-30),
/// REFUND_FAILED (-40)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TransferState {
    /// Transfer recorded, TRANSFER_INITIATED queued
    Started = 0,

    /// Sender debited, deposit requested from the receiver side
    Debited = 10,

    /// Terminal: receiver credited
    Completed = 40,

    /// Terminal: sender debit rejected, nothing moved
    DebitFailed = -10,

    /// Credit failed or timed out, refund requested
    RefundInitiated = -20,

    /// Terminal: sender refunded
    Refunded = -30,

    /// Terminal: refund rejected or given up on. Needs manual intervention.
    RefundFailed = -40,
}

impl TransferState {
    pub const ALL: [TransferState; 7] = [
        TransferState::Started,
        TransferState::Debited,
        TransferState::Completed,
        TransferState::DebitFailed,
        TransferState::RefundInitiated,
        TransferState::Refunded,
        TransferState::RefundFailed,
    ];

    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed
                | TransferState::DebitFailed
                | TransferState::Refunded
                | TransferState::RefundFailed
        )
    }

    /// Check if the sender's money is out but the saga has not settled
    #[inline]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TransferState::Debited | TransferState::RefundInitiated)
    }

    /// Get the numeric state ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransferState::Started),
            10 => Some(TransferState::Debited),
            40 => Some(TransferState::Completed),
            -10 => Some(TransferState::DebitFailed),
            -20 => Some(TransferState::RefundInitiated),
            -30 => Some(TransferState::Refunded),
            -40 => Some(TransferState::RefundFailed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Started => "STARTED",
            TransferState::Debited => "DEBITED",
            TransferState::Completed => "COMPLETED",
            TransferState::DebitFailed => "DEBIT_FAILED",
            TransferState::RefundInitiated => "REFUND_INITIATED",
            TransferState::Refunded => "REFUNDED",
            TransferState::RefundFailed => "REFUND_FAILED",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for TransferState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransferState::from_id(value).ok_or(())
    }
}
