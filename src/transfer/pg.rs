//! PostgreSQL transfer store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::error::TransferError;
use super::state::TransferState;
use super::store::{TransferStore, TransferTx};
use super::types::{NewTransfer, Transfer};
use crate::outbox::NewOutboxEntry;
use crate::outbox::pg::insert_entry;

pub const TRANSFER_OUTBOX_TABLE: &str = "transfer_outbox";

const TRANSFER_COLUMNS: &str = "id, idempotency_key, transaction_id, sender_account_id, \
     receiver_account_id, amount, currency, request_hash, state, failure_reason, version, \
     created_at, updated_at";

pub struct PgTransferStore {
    pool: PgPool,
}

impl PgTransferStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_transfer(row: &PgRow) -> Result<Transfer, TransferError> {
    let id: i64 = row.try_get("id")?;
    let state_id: i16 = row.try_get("state")?;
    let state = TransferState::from_id(state_id).ok_or_else(|| {
        TransferError::DatabaseError(format!("transfer {} has unknown state {}", id, state_id))
    })?;

    Ok(Transfer {
        id,
        idempotency_key: row.try_get("idempotency_key")?,
        transaction_id: row.try_get("transaction_id")?,
        sender_account_id: row.try_get("sender_account_id")?,
        receiver_account_id: row.try_get("receiver_account_id")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        request_hash: row.try_get("request_hash")?,
        state,
        failure_reason: row.try_get("failure_reason")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TransferStore for PgTransferStore {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Transfer>, TransferError> {
        let sql = format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE idempotency_key = $1");
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn find_by_transaction_id(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Transfer>, TransferError> {
        let sql = format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE transaction_id = $1");
        let row = sqlx::query(&sql)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn find_stale(
        &self,
        state: TransferState,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transfer>, TransferError> {
        let sql = format!(
            r#"
            SELECT {TRANSFER_COLUMNS} FROM transfers
            WHERE state = $1 AND updated_at < $2
            ORDER BY updated_at ASC, id ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(state.id())
            .bind(updated_before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_transfer).collect()
    }

    async fn begin(&self) -> Result<Box<dyn TransferTx>, TransferError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransferTx { tx }))
    }
}

struct PgTransferTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl TransferTx for PgTransferTx {
    async fn insert_transfer(
        &mut self,
        transfer: NewTransfer,
        now: DateTime<Utc>,
    ) -> Result<Option<Transfer>, TransferError> {
        // A concurrent insert of the same key waits for the other transaction,
        // then resolves to DO NOTHING
        let sql = format!(
            r#"
            INSERT INTO transfers (idempotency_key, transaction_id, sender_account_id,
                                   receiver_account_id, amount, currency, request_hash,
                                   state, failure_reason, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, 0, $9, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {TRANSFER_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&transfer.idempotency_key)
            .bind(transfer.transaction_id)
            .bind(&transfer.sender_account_id)
            .bind(&transfer.receiver_account_id)
            .bind(transfer.amount)
            .bind(&transfer.currency)
            .bind(&transfer.request_hash)
            .bind(TransferState::Started.id())
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn load_transfer(
        &mut self,
        transaction_id: Uuid,
    ) -> Result<Option<Transfer>, TransferError> {
        let sql = format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE transaction_id = $1 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(transaction_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn update_state(
        &mut self,
        transaction_id: Uuid,
        from: TransferState,
        expected_version: i64,
        to: TransferState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, TransferError> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET state = $4,
                failure_reason = COALESCE($5, failure_reason),
                version = version + 1,
                updated_at = $6
            WHERE transaction_id = $1 AND state = $2 AND version = $3
            "#,
        )
        .bind(transaction_id)
        .bind(from.id())
        .bind(expected_version)
        .bind(to.id())
        .bind(reason)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_outbox(&mut self, entry: NewOutboxEntry) -> Result<(), TransferError> {
        insert_entry(&mut self.tx, TRANSFER_OUTBOX_TABLE, &entry, Utc::now()).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), TransferError> {
        self.tx.commit().await?;
        Ok(())
    }
}
