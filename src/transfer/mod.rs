//! Transfer saga
//!
//! Moves money between two accounts owned by a separate account service,
//! without a distributed transaction. The transfer service keeps a persistent
//! saga per transfer and talks to the account side only through events.
//!
//! # State Machine
//!
//! ```text
//! STARTED → DEBITED → COMPLETED
//!    ↓         ↓
//! DEBIT_FAILED REFUND_INITIATED → REFUNDED
//!                   ↓
//!              REFUND_FAILED
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Decide and announce atomically**: every state change that must
//!    notify the account side writes its outbox row in the same transaction
//! 2. **Guarded transitions**: a transition applies only from its expected
//!    state and version; anything else is a no-op
//! 3. **Idempotent initiation**: one transfer per idempotency key, replays
//!    must carry the same canonical request
//! 4. **Stuck sagas are reconciled, never handled inline**

pub mod error;
pub mod hasher;
pub mod listener;
pub mod lock;
pub mod orchestrator;
pub mod pg;
pub mod reconciliation;
pub mod service;
pub mod state;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use error::TransferError;
pub use listener::TransferEventListener;
pub use lock::{IdempotencyLock, InProcessLock, LockError};
pub use orchestrator::{SagaOrchestrator, Transition};
pub use pg::PgTransferStore;
pub use reconciliation::{ReconciliationConfig, ReconciliationReport, SagaReconciler};
pub use service::{TransferService, TransferServiceConfig};
pub use state::TransferState;
pub use store::{MemoryTransferStore, TransferStore, TransferTx};
pub use types::{Transfer, TransferDetails, TransferRequest, TransferResponse};

#[cfg(feature = "redis")]
pub use lock::RedisLock;
