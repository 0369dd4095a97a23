//! Retention sweep for published outbox rows

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{error, info};

use super::store::{OutboxError, OutboxStore};

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    /// COMPLETED rows older than this are deleted
    pub retention: Duration,
    /// Rows deleted per statement
    pub batch_size: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            retention: Duration::from_secs(3 * 24 * 3600),
            batch_size: 500,
        }
    }
}

pub struct OutboxCleanup {
    name: &'static str,
    store: Arc<dyn OutboxStore>,
    config: CleanupConfig,
}

impl OutboxCleanup {
    pub fn new(name: &'static str, store: Arc<dyn OutboxStore>, config: CleanupConfig) -> Self {
        Self {
            name,
            store,
            config,
        }
    }

    pub async fn run(&self) {
        info!(
            cleaner = self.name,
            retention_secs = self.config.retention.as_secs(),
            "Starting outbox cleanup job"
        );
        loop {
            tokio::time::sleep(self.config.interval).await;
            if let Err(e) = self.run_once().await {
                error!(cleaner = self.name, error = %e, "Outbox cleanup failed");
            }
        }
    }

    pub async fn run_once(&self) -> Result<u64, OutboxError> {
        self.run_once_at(Utc::now()).await
    }

    /// Delete in capped batches until one comes back empty. Returns the total.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<u64, OutboxError> {
        let retention = TimeDelta::from_std(self.config.retention).unwrap_or(TimeDelta::MAX);
        let threshold = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut total = 0;
        loop {
            let deleted = self
                .store
                .delete_completed_before(threshold, self.config.batch_size)
                .await?;
            if deleted == 0 {
                break;
            }
            total += deleted;
        }

        if total > 0 {
            info!(cleaner = self.name, deleted = total, threshold = %threshold, "Old outbox rows deleted");
        }
        Ok(total)
    }
}
