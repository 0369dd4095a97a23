use anyhow::Result;
use sqlx::PgPool;

/// Create every table the two services use. Safe to run on each start.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    tracing::info!("Initializing PostgreSQL schema...");

    let statements = [
        ("accounts", CREATE_ACCOUNTS_TABLE),
        ("processed_transactions", CREATE_PROCESSED_TRANSACTIONS_TABLE),
        ("transfers", CREATE_TRANSFERS_TABLE),
        ("transfers stale index", CREATE_TRANSFERS_STALE_INDEX),
        ("account_outbox", CREATE_ACCOUNT_OUTBOX_TABLE),
        ("account_outbox pending index", CREATE_ACCOUNT_OUTBOX_INDEX),
        ("transfer_outbox", CREATE_TRANSFER_OUTBOX_TABLE),
        ("transfer_outbox pending index", CREATE_TRANSFER_OUTBOX_INDEX),
    ];

    for (name, sql) in statements {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", name, e))?;
    }

    tracing::info!("PostgreSQL schema initialized successfully");
    Ok(())
}

// =============================================================================
// Account service
// =============================================================================

pub const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id           BIGSERIAL PRIMARY KEY,
    customer_id  VARCHAR(64)    NOT NULL,
    balance      NUMERIC(19, 2) NOT NULL CHECK (balance >= 0),
    currency     CHAR(3)        NOT NULL,
    status       VARCHAR(16)    NOT NULL DEFAULT 'ACTIVE',
    daily_limit  NUMERIC(19, 2),
    version      BIGINT         NOT NULL DEFAULT 0,
    created_at   TIMESTAMPTZ    NOT NULL DEFAULT NOW(),
    updated_at   TIMESTAMPTZ    NOT NULL DEFAULT NOW()
)
"#;

/// One row per (transaction, operation) already applied by the account side
pub const CREATE_PROCESSED_TRANSACTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS processed_transactions (
    transaction_id  UUID        NOT NULL,
    operation_type  VARCHAR(16) NOT NULL,
    processed_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (transaction_id, operation_type)
)
"#;

// =============================================================================
// Transfer service
// =============================================================================

/// `state` holds `TransferState::id()`
pub const CREATE_TRANSFERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transfers (
    id                   BIGSERIAL PRIMARY KEY,
    idempotency_key      VARCHAR(255)   NOT NULL UNIQUE,
    transaction_id       UUID           NOT NULL UNIQUE,
    sender_account_id    VARCHAR(64)    NOT NULL,
    receiver_account_id  VARCHAR(64)    NOT NULL,
    amount               NUMERIC(19, 2) NOT NULL CHECK (amount > 0),
    currency             CHAR(3)        NOT NULL,
    request_hash         CHAR(64),
    state                SMALLINT       NOT NULL,
    failure_reason       TEXT,
    version              BIGINT         NOT NULL DEFAULT 0,
    created_at           TIMESTAMPTZ    NOT NULL DEFAULT NOW(),
    updated_at           TIMESTAMPTZ    NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_TRANSFERS_STALE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_transfers_state_updated ON transfers (state, updated_at)";

// =============================================================================
// Outbox (same layout in both services)
// =============================================================================

macro_rules! outbox_table {
    ($table:literal) => {
        concat!(
            "CREATE TABLE IF NOT EXISTS ",
            $table,
            r#" (
    id                 BIGSERIAL PRIMARY KEY,
    aggregate_type     VARCHAR(32)  NOT NULL,
    aggregate_id       VARCHAR(64)  NOT NULL,
    event_type         VARCHAR(64)  NOT NULL,
    payload            TEXT         NOT NULL,
    status             VARCHAR(16)  NOT NULL DEFAULT 'PENDING',
    retry_count        INTEGER      NOT NULL DEFAULT 0,
    next_attempt_time  TIMESTAMPTZ,
    created_at         TIMESTAMPTZ  NOT NULL DEFAULT NOW(),
    updated_at         TIMESTAMPTZ  NOT NULL DEFAULT NOW()
)"#
        )
    };
}

pub const CREATE_ACCOUNT_OUTBOX_TABLE: &str = outbox_table!("account_outbox");
pub const CREATE_TRANSFER_OUTBOX_TABLE: &str = outbox_table!("transfer_outbox");

pub const CREATE_ACCOUNT_OUTBOX_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_account_outbox_pending \
     ON account_outbox (status, next_attempt_time, id)";
pub const CREATE_TRANSFER_OUTBOX_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_transfer_outbox_pending \
     ON transfer_outbox (status, next_attempt_time, id)";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_tables_share_layout() {
        assert!(CREATE_ACCOUNT_OUTBOX_TABLE.starts_with("CREATE TABLE IF NOT EXISTS account_outbox ("));
        assert!(CREATE_TRANSFER_OUTBOX_TABLE.starts_with("CREATE TABLE IF NOT EXISTS transfer_outbox ("));
        assert_eq!(
            CREATE_ACCOUNT_OUTBOX_TABLE.replace("account_outbox", "x"),
            CREATE_TRANSFER_OUTBOX_TABLE.replace("transfer_outbox", "x")
        );
    }

    #[test]
    fn test_marker_key_is_transaction_and_kind() {
        assert!(CREATE_PROCESSED_TRANSACTIONS_TABLE.contains("PRIMARY KEY (transaction_id, operation_type)"));
    }
}
