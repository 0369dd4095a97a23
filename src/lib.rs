//! saga_transfer - money transfers as an orchestrated saga
//!
//! Two services share nothing but events: the account side owns balances,
//! the transfer side owns one saga per transfer. Each writes its outgoing
//! events to an outbox table in the same transaction as its state change.
//!
//! # Modules
//!
//! - [`money`] - Amount and currency rules
//! - [`events`] - Event contracts exchanged between the services
//! - [`outbox`] - Transactional outbox, polling publisher, cleanup
//! - [`broker`] - Message broker seam, channel broker, consumers, DLQ monitor
//! - [`ledger`] - Accounts, balance updates, saga command handler
//! - [`transfer`] - Idempotent initiation, saga orchestrator, reconciliation
//! - [`db`] - PostgreSQL pool and schema
//! - [`api`] - HTTP surface
//! - [`runtime`] - Process wiring

pub mod api;
pub mod broker;
pub mod config;
pub mod db;
pub mod events;
pub mod ledger;
pub mod logging;
pub mod money;
pub mod outbox;
pub mod runtime;
pub mod transfer;

pub use ledger::{Ledger, LedgerError};
pub use transfer::{TransferError, TransferService, TransferState};
