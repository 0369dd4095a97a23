use std::sync::Arc;

use crate::db::Database;
use crate::ledger::Ledger;
use crate::transfer::TransferService;

/// Shared HTTP state for both services
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub transfers: Arc<TransferService>,
    /// PostgreSQL database (absent on the in-memory backend)
    pub pg_db: Option<Database>,
    /// Currency for accounts opened without one
    pub default_currency: String,
}

impl AppState {
    pub fn new(
        ledger: Arc<Ledger>,
        transfers: Arc<TransferService>,
        pg_db: Option<Database>,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            transfers,
            pg_db,
            default_currency: default_currency.into(),
        }
    }
}
