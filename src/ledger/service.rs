//! Balance mutations with business checks and optimistic retry
//!
//! Check order for a debit: active, currency, balance, daily limit. A lost
//! compare-and-swap re-reads the account and repeats the whole
//! check-and-apply cycle.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::error::LedgerError;
use super::models::{Account, AccountStatus, NewAccount};
use super::store::{LedgerStore, LedgerTx};
use crate::money;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Extra attempts after a lost compare-and-swap
    pub max_update_retries: usize,
    pub retry_delay: Duration,
    /// Limit given to newly created accounts
    pub default_daily_limit: Option<Decimal>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_update_retries: 10,
            retry_delay: Duration::from_millis(50),
            default_daily_limit: Some(Decimal::new(500000, 2)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Debit,
    Credit,
}

/// Parse an account reference as carried in events and URLs.
pub fn parse_account_id(account_ref: &str) -> Result<i64, LedgerError> {
    account_ref
        .trim()
        .parse::<i64>()
        .map_err(|_| LedgerError::AccountNotFound(account_ref.to_string()))
}

fn check_usable(account: &Account, currency: &str) -> Result<(), LedgerError> {
    if account.status != AccountStatus::Active {
        return Err(LedgerError::AccountNotActive {
            account_id: account.id,
            status: account.status,
        });
    }
    if !money::same_currency(&account.currency, currency) {
        return Err(LedgerError::CurrencyMismatch {
            account_currency: account.currency.clone(),
            requested: currency.to_string(),
        });
    }
    Ok(())
}

/// New balance after taking `amount` out, or the rule it breaks.
pub fn check_debit(account: &Account, amount: Decimal, currency: &str) -> Result<Decimal, LedgerError> {
    check_usable(account, currency)?;
    if account.balance < amount {
        return Err(LedgerError::InsufficientBalance {
            account_id: account.id,
            balance: account.balance,
            requested: amount,
        });
    }
    if let Some(limit) = account.daily_limit
        && amount > limit
    {
        return Err(LedgerError::DailyLimitExceeded {
            account_id: account.id,
            limit,
            requested: amount,
        });
    }
    account
        .balance
        .checked_sub(amount)
        .ok_or_else(|| out_of_range(account, amount))
}

/// New balance after adding `amount`, or the rule it breaks.
pub fn check_credit(account: &Account, amount: Decimal, currency: &str) -> Result<Decimal, LedgerError> {
    check_usable(account, currency)?;
    money::checked_credit(account.balance, amount).ok_or_else(|| out_of_range(account, amount))
}

fn out_of_range(account: &Account, amount: Decimal) -> LedgerError {
    LedgerError::BalanceOutOfRange {
        account_id: account.id,
        balance: account.balance,
        amount,
    }
}

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    fn retry_backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.retry_delay)
            .with_max_delay(self.config.retry_delay * 20)
            .with_max_times(self.config.max_update_retries)
            .with_jitter()
    }

    pub async fn create_account(
        &self,
        customer_id: &str,
        initial_amount: Decimal,
        currency: &str,
    ) -> Result<Account, LedgerError> {
        let balance = money::validate_non_negative(initial_amount)?;
        let currency = money::normalize_currency(currency)?;

        let account = self
            .store
            .create_account(NewAccount {
                customer_id: customer_id.trim().to_string(),
                balance,
                currency,
                daily_limit: self.config.default_daily_limit,
            })
            .await?;

        info!(
            account_id = account.id,
            customer_id = %account.customer_id,
            currency = %account.currency,
            "Account created"
        );
        Ok(account)
    }

    pub async fn find_account(&self, account_ref: &str) -> Result<Account, LedgerError> {
        let id = parse_account_id(account_ref)?;
        self.store
            .find_account(id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_ref.to_string()))
    }

    /// Withdraw through the API path. No event is emitted.
    pub async fn debit(
        &self,
        account_ref: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<Account, LedgerError> {
        self.apply(account_ref, Direction::Debit, amount, currency).await
    }

    /// Deposit through the API path. No event is emitted.
    pub async fn credit(
        &self,
        account_ref: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<Account, LedgerError> {
        self.apply(account_ref, Direction::Credit, amount, currency).await
    }

    async fn apply(
        &self,
        account_ref: &str,
        direction: Direction,
        amount: Decimal,
        currency: &str,
    ) -> Result<Account, LedgerError> {
        let mut tx = self.store.begin().await?;
        let account = self
            .apply_in(tx.as_mut(), account_ref, direction, amount, currency)
            .await?;
        tx.commit().await?;
        Ok(account)
    }

    /// Check-and-apply on an open transaction, retrying lost CAS writes.
    /// Returns the account as written.
    pub async fn apply_in(
        &self,
        tx: &mut dyn LedgerTx,
        account_ref: &str,
        direction: Direction,
        amount: Decimal,
        currency: &str,
    ) -> Result<Account, LedgerError> {
        let id = parse_account_id(account_ref)?;
        let amount = money::validate_amount(amount)?;
        let mut delays = self.retry_backoff().build();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let account = tx
                .load_account(id)
                .await?
                .ok_or_else(|| LedgerError::AccountNotFound(account_ref.to_string()))?;

            let new_balance = match direction {
                Direction::Debit => check_debit(&account, amount, currency)?,
                Direction::Credit => check_credit(&account, amount, currency)?,
            };

            if tx.update_balance(id, account.version, new_balance).await? {
                debug!(
                    account_id = id,
                    direction = ?direction,
                    %amount,
                    balance = %new_balance,
                    "Balance updated"
                );
                return Ok(Account {
                    balance: new_balance,
                    version: account.version + 1,
                    ..account
                });
            }

            match delays.next() {
                Some(delay) => {
                    debug!(account_id = id, attempts, delay = ?delay, "Version conflict, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(account_id = id, attempts, "Giving up on balance update after repeated conflicts");
                    return Err(LedgerError::ConcurrentModification {
                        account_id: id,
                        attempts,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::store::MemoryLedgerStore;
    use crate::outbox::MemoryOutbox;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn ledger_with(config: LedgerConfig) -> (Ledger, MemoryLedgerStore) {
        let store = MemoryLedgerStore::new(MemoryOutbox::new());
        (Ledger::new(Arc::new(store.clone()), config), store)
    }

    fn fast_config() -> LedgerConfig {
        LedgerConfig {
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_debit_reduces_balance() {
        let (ledger, _) = ledger_with(fast_config());
        let account = ledger.create_account("c1", d("1000.00"), "try").await.unwrap();
        assert_eq!(account.currency, "TRY");
        assert_eq!(account.daily_limit, Some(d("5000.00")));

        let after = ledger
            .debit(&account.id.to_string(), d("100.00"), "TRY")
            .await
            .unwrap();
        assert_eq!(after.balance, d("900.00"));
        assert_eq!(after.version, 1);

        let stored = ledger.find_account(&account.id.to_string()).await.unwrap();
        assert_eq!(stored.balance, d("900.00"));
    }

    #[tokio::test]
    async fn test_check_order() {
        let (ledger, store) = ledger_with(LedgerConfig {
            default_daily_limit: Some(d("50.00")),
            ..fast_config()
        });
        let account = ledger.create_account("c1", d("10.00"), "TRY").await.unwrap();
        let id = account.id.to_string();

        // insufficient balance wins over the daily limit
        let err = ledger.debit(&id, d("100.00"), "TRY").await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));

        // currency is checked before balance, case-insensitively
        let err = ledger.debit(&id, d("100.00"), "USD").await.unwrap_err();
        assert!(matches!(err, LedgerError::CurrencyMismatch { .. }));
        assert!(ledger.credit(&id, d("100.00"), "try").await.is_ok());

        let err = ledger.debit(&id, d("60.00"), "TRY").await.unwrap_err();
        assert!(matches!(err, LedgerError::DailyLimitExceeded { .. }));

        store.set_status(account.id, AccountStatus::Frozen).await;
        let err = ledger.credit(&id, d("1.00"), "USD").await.unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotActive { .. }));
    }

    #[tokio::test]
    async fn test_unknown_account_and_bad_amount() {
        let (ledger, _) = ledger_with(fast_config());
        let err = ledger.debit("404", d("1.00"), "TRY").await.unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(ref id) if id == "404"));

        let err = ledger.debit("not-a-number", d("1.00"), "TRY").await.unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(_)));

        let account = ledger.create_account("c1", d("10.00"), "TRY").await.unwrap();
        let err = ledger
            .credit(&account.id.to_string(), d("0"), "TRY")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_credit_past_storable_range_is_rejected() {
        let (ledger, _) = ledger_with(fast_config());
        let account = ledger
            .create_account("c1", money::MAX_AMOUNT, "TRY")
            .await
            .unwrap();
        let id = account.id.to_string();

        let err = ledger.credit(&id, d("0.01"), "TRY").await.unwrap_err();
        assert!(matches!(err, LedgerError::BalanceOutOfRange { .. }));
        assert!(err.is_business());

        let err = ledger
            .create_account("c2", Decimal::MAX, "TRY")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));

        let stored = ledger.find_account(&id).await.unwrap();
        assert_eq!(stored.balance, money::MAX_AMOUNT);
        assert_eq!(stored.version, 0);
    }

    #[tokio::test]
    async fn test_lost_cas_is_retried() {
        let (ledger, store) = ledger_with(fast_config());
        let account = ledger.create_account("c1", d("100.00"), "TRY").await.unwrap();

        store.inject_conflicts(3);
        let after = ledger
            .debit(&account.id.to_string(), d("40.00"), "TRY")
            .await
            .unwrap();
        assert_eq!(after.balance, d("60.00"));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (ledger, store) = ledger_with(LedgerConfig {
            max_update_retries: 2,
            ..fast_config()
        });
        let account = ledger.create_account("c1", d("100.00"), "TRY").await.unwrap();

        store.inject_conflicts(100);
        let err = ledger
            .debit(&account.id.to_string(), d("40.00"), "TRY")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::ConcurrentModification { attempts: 3, .. }
        ));

        store.inject_conflicts(0);
        let stored = ledger.find_account(&account.id.to_string()).await.unwrap();
        assert_eq!(stored.balance, d("100.00"));
    }

    #[tokio::test]
    async fn test_concurrent_debits_never_overdraw() {
        let (ledger, _) = ledger_with(LedgerConfig {
            default_daily_limit: None,
            ..fast_config()
        });
        let ledger = Arc::new(ledger);
        let account = ledger.create_account("c1", d("1000.00"), "TRY").await.unwrap();
        let id = account.id.to_string();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                let id = id.clone();
                tokio::spawn(async move { ledger.debit(&id, d("200.00"), "TRY").await })
            })
            .collect();

        let mut ok = 0;
        let mut insufficient = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(LedgerError::InsufficientBalance { .. }) => insufficient += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 5);
        assert_eq!(insufficient, 3);

        let stored = ledger.find_account(&id).await.unwrap();
        assert_eq!(stored.balance, Decimal::ZERO);
    }
}
