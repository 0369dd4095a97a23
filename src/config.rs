use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use crate::broker::ConsumerConfig;
use crate::ledger::LedgerConfig;
use crate::outbox::{BackoffPolicy, CleanupConfig, PublisherConfig};
use crate::transfer::{ReconciliationConfig, TransferServiceConfig};

pub const TRANSFER_TOPIC: &str = "transfer-out-0";
pub const TRANSFER_DLQ_TOPIC: &str = "transfer-dlq-0";
pub const ACCOUNT_TOPIC: &str = "account-out-0";
pub const ACCOUNT_DLQ_TOPIC: &str = "account-dlq-0";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Per-target levels layered over `log_level`
    #[serde(default)]
    pub log_targets: BTreeMap<String, String>,
    #[serde(default)]
    pub server: ServerConfig,
    /// PostgreSQL connection URL; in-memory stores when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// Redis URL for idempotency locks (needs the `redis` feature)
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub consumer: ConsumerSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Polling publisher settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OutboxSettings {
    pub batch_size: usize,
    pub polling_interval_ms: u64,
    pub max_retries: i32,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            polling_interval_ms: 500,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    pub multiplier: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay_secs: 60,
            max_delay_secs: 3600,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CleanupSettings {
    pub interval_secs: u64,
    pub retention_secs: u64,
    pub batch_size: usize,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            retention_secs: 3 * 24 * 3600,
            batch_size: 500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReconciliationSettings {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub max_retry_duration_secs: u64,
    pub batch_size: usize,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            timeout_secs: 60,
            max_retry_duration_secs: 24 * 3600,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransferConfig {
    pub lock_ttl_ms: u64,
    pub lock_acquire_attempts: usize,
    pub topic: String,
    pub dlq_topic: String,
    pub outbox: OutboxSettings,
    pub backoff: BackoffSettings,
    pub cleanup: CleanupSettings,
    pub reconciliation: ReconciliationSettings,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 5 * 60 * 1000,
            lock_acquire_attempts: 3,
            topic: TRANSFER_TOPIC.to_string(),
            dlq_topic: TRANSFER_DLQ_TOPIC.to_string(),
            outbox: OutboxSettings::default(),
            backoff: BackoffSettings::default(),
            cleanup: CleanupSettings::default(),
            reconciliation: ReconciliationSettings::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AccountConfig {
    pub default_daily_limit: Option<Decimal>,
    /// Used when an account is opened without a currency
    pub default_currency: String,
    pub max_update_retries: usize,
    pub retry_delay_ms: u64,
    pub topic: String,
    pub dlq_topic: String,
    pub outbox: OutboxSettings,
    pub backoff: BackoffSettings,
    pub cleanup: CleanupSettings,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            default_daily_limit: Some(Decimal::new(500000, 2)),
            default_currency: "TRY".to_string(),
            max_update_retries: 10,
            retry_delay_ms: 50,
            topic: ACCOUNT_TOPIC.to_string(),
            dlq_topic: ACCOUNT_DLQ_TOPIC.to_string(),
            outbox: OutboxSettings::default(),
            backoff: BackoffSettings::default(),
            cleanup: CleanupSettings::default(),
        }
    }
}

/// Inbound event handling retries
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConsumerSettings {
    pub max_attempts: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

impl BackoffSettings {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
            multiplier: self.multiplier,
        }
    }
}

impl CleanupSettings {
    pub fn cleanup_config(&self) -> CleanupConfig {
        CleanupConfig {
            interval: Duration::from_secs(self.interval_secs),
            retention: Duration::from_secs(self.retention_secs),
            batch_size: self.batch_size,
        }
    }
}

fn publisher_config(
    outbox: &OutboxSettings,
    backoff: &BackoffSettings,
    topic: &str,
    dlq_topic: &str,
) -> PublisherConfig {
    PublisherConfig {
        batch_size: outbox.batch_size,
        polling_interval: Duration::from_millis(outbox.polling_interval_ms),
        max_retries: outbox.max_retries,
        topic: topic.to_string(),
        dlq_topic: dlq_topic.to_string(),
        backoff: backoff.policy(),
    }
}

impl TransferConfig {
    pub fn service_config(&self) -> TransferServiceConfig {
        TransferServiceConfig {
            lock_ttl: Duration::from_millis(self.lock_ttl_ms),
            lock_acquire_attempts: self.lock_acquire_attempts,
            ..Default::default()
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        publisher_config(&self.outbox, &self.backoff, &self.topic, &self.dlq_topic)
    }

    pub fn reconciliation_config(&self) -> ReconciliationConfig {
        let r = &self.reconciliation;
        ReconciliationConfig {
            interval: Duration::from_secs(r.interval_secs),
            timeout: Duration::from_secs(r.timeout_secs),
            max_retry_duration: Duration::from_secs(r.max_retry_duration_secs),
            batch_size: r.batch_size,
        }
    }
}

impl AccountConfig {
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            max_update_retries: self.max_update_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            default_daily_limit: self.default_daily_limit,
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        publisher_config(&self.outbox, &self.backoff, &self.topic, &self.dlq_topic)
    }
}

impl ConsumerSettings {
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            max_attempts: self.max_attempts,
            min_delay: Duration::from_millis(self.min_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}
