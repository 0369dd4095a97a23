//! Inter-service event contracts
//!
//! Every event crosses the broker as a camelCase JSON payload; its type
//! travels separately in the `eventType` header so consumers can route
//! before deserializing.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire names of all saga events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    TransferInitiated,
    AccountDebited,
    AccountDebitFailed,
    TransferDepositRequested,
    AccountCredited,
    AccountCreditFailed,
    TransferRefundRequested,
    AccountRefunded,
    AccountRefundFailed,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::TransferInitiated,
        EventType::AccountDebited,
        EventType::AccountDebitFailed,
        EventType::TransferDepositRequested,
        EventType::AccountCredited,
        EventType::AccountCreditFailed,
        EventType::TransferRefundRequested,
        EventType::AccountRefunded,
        EventType::AccountRefundFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TransferInitiated => "TRANSFER_INITIATED",
            EventType::AccountDebited => "ACCOUNT_DEBITED",
            EventType::AccountDebitFailed => "ACCOUNT_DEBIT_FAILED",
            EventType::TransferDepositRequested => "TRANSFER_DEPOSIT_REQUESTED",
            EventType::AccountCredited => "ACCOUNT_CREDITED",
            EventType::AccountCreditFailed => "ACCOUNT_CREDIT_FAILED",
            EventType::TransferRefundRequested => "TRANSFER_REFUND_REQUESTED",
            EventType::AccountRefunded => "ACCOUNT_REFUNDED",
            EventType::AccountRefundFailed => "ACCOUNT_REFUND_FAILED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown event type: {}", s))
    }
}

/// A payload that knows its own wire type.
pub trait SagaEvent: Serialize + DeserializeOwned + Send {
    const TYPE: EventType;

    fn transaction_id(&self) -> Uuid;
}

pub fn encode<E: SagaEvent>(event: &E) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

pub fn decode<E: SagaEvent>(payload: &str) -> Result<E, serde_json::Error> {
    serde_json::from_str(payload)
}

macro_rules! saga_event {
    ($name:ident, $kind:expr, { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            pub transaction_id: Uuid,
            $(pub $field: $ty,)*
        }

        impl SagaEvent for $name {
            const TYPE: EventType = $kind;

            fn transaction_id(&self) -> Uuid {
                self.transaction_id
            }
        }
    };
}

// Transfer service -> account service
saga_event!(TransferInitiated, EventType::TransferInitiated, {
    sender_account_id: String,
    receiver_account_id: String,
    amount: Decimal,
    currency: String,
});
saga_event!(TransferDepositRequested, EventType::TransferDepositRequested, {
    receiver_account_id: String,
    amount: Decimal,
    currency: String,
});
saga_event!(TransferRefundRequested, EventType::TransferRefundRequested, {
    sender_account_id: String,
    amount: Decimal,
    currency: String,
    reason: String,
});

// Account service -> transfer service
saga_event!(AccountDebited, EventType::AccountDebited, {
    sender_account_id: String,
    amount: Decimal,
    currency: String,
});
saga_event!(AccountDebitFailed, EventType::AccountDebitFailed, {
    sender_account_id: String,
    amount: Decimal,
    currency: String,
    reason: String,
});
saga_event!(AccountCredited, EventType::AccountCredited, {
    receiver_account_id: String,
    amount: Decimal,
    currency: String,
});
saga_event!(AccountCreditFailed, EventType::AccountCreditFailed, {
    receiver_account_id: String,
    amount: Decimal,
    currency: String,
    reason: String,
});
saga_event!(AccountRefunded, EventType::AccountRefunded, {
    sender_account_id: String,
    amount: Decimal,
    currency: String,
});
saga_event!(AccountRefundFailed, EventType::AccountRefundFailed, {
    sender_account_id: String,
    amount: Decimal,
    currency: String,
    reason: String,
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_wire_names() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
        assert_eq!(
            EventType::TransferDepositRequested.to_string(),
            "TRANSFER_DEPOSIT_REQUESTED"
        );
        assert!("ACCOUNT_CREATED".parse::<EventType>().is_err());
    }

    #[test]
    fn test_payload_uses_camel_case() {
        let event = AccountCreditFailed {
            transaction_id: Uuid::nil(),
            receiver_account_id: "42".to_string(),
            amount: Decimal::new(15050, 2),
            currency: "TRY".to_string(),
            reason: "Account is not active".to_string(),
        };
        let json: serde_json::Value = serde_json::from_str(&encode(&event).unwrap()).unwrap();
        assert_eq!(json["transactionId"], Uuid::nil().to_string());
        assert_eq!(json["receiverAccountId"], "42");
        assert_eq!(json["reason"], "Account is not active");
        assert_eq!(AccountCreditFailed::TYPE, EventType::AccountCreditFailed);
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let err = decode::<TransferInitiated>(r#"{"transactionId":"not-a-uuid"}"#);
        assert!(err.is_err());
    }
}
