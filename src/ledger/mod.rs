//! Account ledger
//!
//! Balance mutations guarded by an explicit `version` column, plus the
//! account-side handler that turns transfer commands into debit, credit and
//! refund steps.

pub mod error;
pub mod handler;
pub mod models;
pub mod pg;
pub mod service;
pub mod store;

pub use error::LedgerError;
pub use handler::{CommandOutcome, TransferCommandHandler};
pub use models::{Account, AccountStatus, NewAccount, OperationKind};
pub use pg::PgLedgerStore;
pub use service::{Direction, Ledger, LedgerConfig};
pub use store::{LedgerStore, LedgerTx, MemoryLedgerStore};
