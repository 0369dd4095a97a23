//! Idempotency lock
//!
//! Short-lived mutual exclusion keyed by the client's idempotency key. The
//! TTL bounds how long a crashed holder can block the key.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error)]
pub enum LockError {
    #[error("Lock store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IdempotencyLock: Send + Sync {
    /// Take the lock if nobody holds it. `false` means it is held elsewhere.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    async fn release(&self, key: &str) -> Result<(), LockError>;
}

pub fn lock_key(idempotency_key: &str) -> String {
    format!("transfer_lock:{}", idempotency_key)
}

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Lock held in process memory. Only excludes callers sharing this process.
///
/// Successful initiations never release their key, so expired entries are
/// swept from `try_acquire` at most once per sweep interval.
pub struct InProcessLock {
    held: DashMap<String, Instant>,
    sweep_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl Default for InProcessLock {
    fn default() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }
}

impl InProcessLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            held: DashMap::new(),
            sweep_interval,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Keys currently tracked, expired or not
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    fn sweep_expired(&self, now: Instant) {
        // another caller is already sweeping
        let Ok(mut last) = self.last_sweep.try_lock() else {
            return;
        };
        if now.duration_since(*last) < self.sweep_interval {
            return;
        }
        *last = now;
        drop(last);

        let before = self.held.len();
        self.held.retain(|_, expires| *expires > now);
        let evicted = before.saturating_sub(self.held.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.held.len(), "Evicted expired idempotency locks");
        }
    }
}

#[async_trait]
impl IdempotencyLock for InProcessLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        self.sweep_expired(now);

        let acquired = match self.held.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if *held.get() > now {
                    false
                } else {
                    // previous holder's TTL ran out
                    held.insert(now + ttl);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now + ttl);
                true
            }
        };
        Ok(acquired)
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        self.held.remove(key);
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_lock::RedisLock;

#[cfg(feature = "redis")]
mod redis_lock {
    use super::*;
    use redis::{AsyncCommands, Client, aio::ConnectionManager};
    use tracing::info;

    impl From<redis::RedisError> for LockError {
        fn from(e: redis::RedisError) -> Self {
            LockError::Unavailable(e.to_string())
        }
    }

    /// Lock shared by every replica through Redis `SET NX PX`.
    pub struct RedisLock {
        conn: ConnectionManager,
    }

    impl RedisLock {
        pub async fn connect(url: &str) -> Result<Self, LockError> {
            let client = Client::open(url)?;
            let conn = ConnectionManager::new(client).await?;
            info!(url = %url, "Connected to Redis for idempotency locks");
            Ok(Self { conn })
        }
    }

    #[async_trait]
    impl IdempotencyLock for RedisLock {
        async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
            let mut conn = self.conn.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg("locked")
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            Ok(reply.is_some())
        }

        async fn release(&self, key: &str) -> Result<(), LockError> {
            let mut conn = self.conn.clone();
            let _: () = conn.del(key).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_format() {
        assert_eq!(lock_key("abc-123"), "transfer_lock:abc-123");
    }

    #[tokio::test]
    async fn test_second_acquire_fails_until_release() {
        let lock = InProcessLock::new();
        let ttl = Duration::from_secs(60);

        assert!(lock.try_acquire("k", ttl).await.unwrap());
        assert!(!lock.try_acquire("k", ttl).await.unwrap());
        assert!(lock.try_acquire("other", ttl).await.unwrap());

        lock.release("k").await.unwrap();
        assert!(lock.try_acquire("k", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_keys_are_evicted() {
        let lock = InProcessLock::with_sweep_interval(Duration::from_millis(10));
        for i in 0..10_000 {
            assert!(
                lock.try_acquire(&format!("key-{i}"), Duration::from_millis(1))
                    .await
                    .unwrap()
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(lock.try_acquire("fresh", Duration::from_secs(60)).await.unwrap());
        assert_eq!(lock.len(), 1);
        assert!(!lock.try_acquire("fresh", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_keys() {
        let lock = InProcessLock::with_sweep_interval(Duration::ZERO);
        assert!(lock.try_acquire("held", Duration::from_secs(60)).await.unwrap());
        assert!(lock.try_acquire("brief", Duration::from_millis(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(lock.try_acquire("other", Duration::from_secs(60)).await.unwrap());
        assert_eq!(lock.len(), 2);
        assert!(!lock.try_acquire("held", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let lock = InProcessLock::new();
        assert!(lock.try_acquire("k", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(lock.try_acquire("k", Duration::from_secs(60)).await.unwrap());
        assert!(!lock.try_acquire("k", Duration::from_secs(60)).await.unwrap());
    }
}
