//! PostgreSQL ledger store

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::error::LedgerError;
use super::models::{Account, AccountStatus, NewAccount, OperationKind};
use super::store::{LedgerStore, LedgerTx};
use crate::outbox::NewOutboxEntry;
use crate::outbox::pg::insert_entry;

pub const ACCOUNT_OUTBOX_TABLE: &str = "account_outbox";

const ACCOUNT_COLUMNS: &str =
    "id, customer_id, balance, currency, status, daily_limit, version, created_at, updated_at";

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_account(row: &PgRow) -> Result<Account, LedgerError> {
    let id: i64 = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status = AccountStatus::parse(&status)
        .ok_or_else(|| LedgerError::Database(format!("account {} has unknown status {}", id, status)))?;

    Ok(Account {
        id,
        customer_id: row.try_get("customer_id")?,
        balance: row.try_get("balance")?,
        currency: row.try_get("currency")?,
        status,
        daily_limit: row.try_get("daily_limit")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_account(&self, account: NewAccount) -> Result<Account, LedgerError> {
        let sql = format!(
            r#"
            INSERT INTO accounts (customer_id, balance, currency, status, daily_limit,
                                  version, created_at, updated_at)
            VALUES ($1, $2, $3, 'ACTIVE', $4, 0, NOW(), NOW())
            RETURNING {ACCOUNT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&account.customer_id)
            .bind(account.balance)
            .bind(&account.currency)
            .bind(account.daily_limit)
            .fetch_one(&self.pool)
            .await?;
        row_to_account(&row)
    }

    async fn find_account(&self, id: i64) -> Result<Option<Account>, LedgerError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }
}

struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn load_account(&mut self, id: i64) -> Result<Option<Account>, LedgerError> {
        // Plain read: the version check on update detects concurrent writers
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn update_balance(
        &mut self,
        id: i64,
        expected_version: i64,
        new_balance: Decimal,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = $3, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(new_balance)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_mark_processed(
        &mut self,
        transaction_id: Uuid,
        kind: OperationKind,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_transactions (transaction_id, operation_type, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (transaction_id, operation_type) DO NOTHING
            "#,
        )
        .bind(transaction_id)
        .bind(kind.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_outbox(&mut self, entry: NewOutboxEntry) -> Result<(), LedgerError> {
        insert_entry(&mut self.tx, ACCOUNT_OUTBOX_TABLE, &entry, Utc::now()).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.commit().await?;
        Ok(())
    }
}
