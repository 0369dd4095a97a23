//! Account storage seam
//!
//! A [`LedgerTx`] groups the processed marker, the balance write and the
//! outbox row of one saga step. Dropping it without `commit` discards all
//! three.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::error::LedgerError;
use super::models::{Account, AccountStatus, NewAccount, OperationKind};
use crate::outbox::{MemoryOutbox, NewOutboxEntry};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create_account(&self, account: NewAccount) -> Result<Account, LedgerError>;

    async fn find_account(&self, id: i64) -> Result<Option<Account>, LedgerError>;

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError>;
}

#[async_trait]
pub trait LedgerTx: Send {
    async fn load_account(&mut self, id: i64) -> Result<Option<Account>, LedgerError>;

    /// Compare-and-swap on `version`. `false` means another writer got there first.
    async fn update_balance(
        &mut self,
        id: i64,
        expected_version: i64,
        new_balance: Decimal,
    ) -> Result<bool, LedgerError>;

    /// Insert-if-absent. `false` means this step already ran for the transaction.
    async fn try_mark_processed(
        &mut self,
        transaction_id: Uuid,
        kind: OperationKind,
    ) -> Result<bool, LedgerError>;

    async fn insert_outbox(&mut self, entry: NewOutboxEntry) -> Result<(), LedgerError>;

    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone, Default)]
struct LedgerTables {
    next_id: i64,
    accounts: BTreeMap<i64, Account>,
    processed: HashSet<(Uuid, OperationKind)>,
}

/// Memory-backed ledger. Transactions are serialized: `begin` holds the
/// table lock until commit or drop, and writes go to a staged copy.
#[derive(Clone)]
pub struct MemoryLedgerStore {
    tables: Arc<Mutex<LedgerTables>>,
    outbox: MemoryOutbox,
    forced_conflicts: Arc<AtomicUsize>,
}

impl MemoryLedgerStore {
    pub fn new(outbox: MemoryOutbox) -> Self {
        Self {
            tables: Arc::new(Mutex::new(LedgerTables::default())),
            outbox,
            forced_conflicts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn outbox(&self) -> &MemoryOutbox {
        &self.outbox
    }

    /// Make the next `n` balance writes lose their compare-and-swap, as if a
    /// concurrent writer had committed first.
    pub fn inject_conflicts(&self, n: usize) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    pub async fn set_status(&self, id: i64, status: AccountStatus) -> bool {
        let mut tables = self.tables.lock().await;
        match tables.accounts.get_mut(&id) {
            Some(account) => {
                account.status = status;
                account.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn is_processed(&self, transaction_id: Uuid, kind: OperationKind) -> bool {
        self.tables
            .lock()
            .await
            .processed
            .contains(&(transaction_id, kind))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn create_account(&self, account: NewAccount) -> Result<Account, LedgerError> {
        let mut tables = self.tables.lock().await;
        tables.next_id += 1;
        let now = Utc::now();
        let account = Account {
            id: tables.next_id,
            customer_id: account.customer_id,
            balance: account.balance,
            currency: account.currency,
            status: AccountStatus::Active,
            daily_limit: account.daily_limit,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        tables.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn find_account(&self, id: i64) -> Result<Option<Account>, LedgerError> {
        Ok(self.tables.lock().await.accounts.get(&id).cloned())
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryLedgerTx {
            guard,
            staged,
            pending_outbox: Vec::new(),
            outbox: self.outbox.clone(),
            forced_conflicts: self.forced_conflicts.clone(),
        }))
    }
}

struct MemoryLedgerTx {
    guard: OwnedMutexGuard<LedgerTables>,
    staged: LedgerTables,
    pending_outbox: Vec<NewOutboxEntry>,
    outbox: MemoryOutbox,
    forced_conflicts: Arc<AtomicUsize>,
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn load_account(&mut self, id: i64) -> Result<Option<Account>, LedgerError> {
        Ok(self.staged.accounts.get(&id).cloned())
    }

    async fn update_balance(
        &mut self,
        id: i64,
        expected_version: i64,
        new_balance: Decimal,
    ) -> Result<bool, LedgerError> {
        let forced = self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Ok(false);
        }

        match self.staged.accounts.get_mut(&id) {
            Some(account) if account.version == expected_version => {
                account.balance = new_balance;
                account.version += 1;
                account.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_mark_processed(
        &mut self,
        transaction_id: Uuid,
        kind: OperationKind,
    ) -> Result<bool, LedgerError> {
        Ok(self.staged.processed.insert((transaction_id, kind)))
    }

    async fn insert_outbox(&mut self, entry: NewOutboxEntry) -> Result<(), LedgerError> {
        self.pending_outbox.push(entry);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let MemoryLedgerTx {
            mut guard,
            staged,
            pending_outbox,
            outbox,
            ..
        } = *self;
        *guard = staged;
        // rows become visible before the table lock is released
        outbox.append(pending_outbox, Utc::now());
        drop(guard);
        Ok(())
    }
}
