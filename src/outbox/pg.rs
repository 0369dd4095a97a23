//! PostgreSQL outbox store
//!
//! The claim is a `SELECT ... FOR UPDATE SKIP LOCKED` inside a transaction
//! that stays open for the whole batch, so concurrent publishers never see
//! the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};

use super::store::{OutboxBatch, OutboxError, OutboxStore};
use super::types::{NewOutboxEntry, OutboxRecord, OutboxStatus};

/// Outbox table of one service (`transfer_outbox` or `account_outbox`)
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    table: &'static str,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool, table: &'static str) -> Self {
        Self { pool, table }
    }
}

/// Insert one PENDING row on an open transaction.
pub async fn insert_entry(
    tx: &mut Transaction<'static, Postgres>,
    table: &str,
    entry: &NewOutboxEntry,
    now: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    let sql = format!(
        r#"
        INSERT INTO {table} (aggregate_type, aggregate_id, event_type, payload,
                             status, retry_count, next_attempt_time, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 'PENDING', 0, NULL, $5, $5)
        RETURNING id
        "#
    );
    let row = sqlx::query(&sql)
        .bind(entry.aggregate_type.as_str())
        .bind(&entry.aggregate_id)
        .bind(entry.event_type.as_str())
        .bind(&entry.payload)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;
    row.try_get("id")
}

fn row_to_record(row: &PgRow) -> Result<OutboxRecord, OutboxError> {
    let id: i64 = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status = OutboxStatus::parse(&status).ok_or_else(|| OutboxError::Corrupt {
        id,
        reason: format!("unknown status {}", status),
    })?;

    Ok(OutboxRecord {
        id,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        status,
        retry_count: row.try_get("retry_count")?,
        next_attempt_time: row.try_get("next_attempt_time")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Box<dyn OutboxBatch>, OutboxError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, payload, status,
                   retry_count, next_attempt_time, created_at, updated_at
            FROM {}
            WHERE status = 'PENDING'
              AND (next_attempt_time IS NULL OR next_attempt_time <= $1)
            ORDER BY id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await?;

        let entries = rows
            .iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Box::new(PgOutboxBatch {
            tx,
            table: self.table,
            entries,
        }))
    }

    async fn delete_completed_before(
        &self,
        threshold: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, OutboxError> {
        let sql = format!(
            r#"
            DELETE FROM {table}
            WHERE id IN (
                SELECT id FROM {table}
                WHERE status = 'COMPLETED' AND created_at < $1
                LIMIT $2
            )
            "#,
            table = self.table
        );
        let result = sqlx::query(&sql)
            .bind(threshold)
            .bind(limit as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

struct PgOutboxBatch {
    tx: Transaction<'static, Postgres>,
    table: &'static str,
    entries: Vec<OutboxRecord>,
}

#[async_trait]
impl OutboxBatch for PgOutboxBatch {
    fn entries(&self) -> &[OutboxRecord] {
        &self.entries
    }

    async fn mark_completed(&mut self, id: i64, now: DateTime<Utc>) -> Result<(), OutboxError> {
        let sql = format!(
            "UPDATE {} SET status = 'COMPLETED', next_attempt_time = NULL, updated_at = $2 WHERE id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn reschedule(
        &mut self,
        id: i64,
        retry_count: i32,
        next_attempt: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        let sql = format!(
            "UPDATE {} SET retry_count = $2, next_attempt_time = $3, updated_at = $4 WHERE id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(retry_count)
            .bind(next_attempt)
            .bind(now)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn mark_failed(
        &mut self,
        id: i64,
        retry_count: i32,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        let sql = format!(
            "UPDATE {} SET status = 'FAILED', retry_count = $2, next_attempt_time = NULL, updated_at = $3 WHERE id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(retry_count)
            .bind(now)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), OutboxError> {
        self.tx.commit().await?;
        Ok(())
    }
}
