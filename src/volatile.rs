//! Shared volatile key/value operations: quota counters and embedding
//! vectors. Redis backs production; `MemoryStore` backs tests and
//! single-process runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum VolatileStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("volatile store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait VolatileStore: Send + Sync {
    /// Atomically increments the counter at `key`, arming the expiry on the
    /// first increment only. Returns the post-increment count.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, VolatileStoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, VolatileStoreError>;

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), VolatileStoreError>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, VolatileStoreError>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: u64,
}

pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn live_entry(
        entries: &mut HashMap<String, MemoryEntry>,
        key: &str,
        now: u64,
    ) -> Option<MemoryEntry> {
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl VolatileStore for MemoryStore {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, VolatileStoreError> {
        let now = self.clock.now_epoch_seconds();
        let mut entries = self.lock();
        match Self::live_entry(&mut entries, key, now) {
            Some(entry) => {
                let count = entry.value.parse::<i64>().unwrap_or(0) + 1;
                entries.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: count.to_string(),
                        expires_at: entry.expires_at,
                    },
                );
                Ok(count)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: "1".to_string(),
                        expires_at: now + ttl.as_secs(),
                    },
                );
                Ok(1)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, VolatileStoreError> {
        let now = self.clock.now_epoch_seconds();
        let mut entries = self.lock();
        Ok(Self::live_entry(&mut entries, key, now).map(|entry| entry.value))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), VolatileStoreError> {
        let now = self.clock.now_epoch_seconds();
        self.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: now + ttl.as_secs(),
            },
        );
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, VolatileStoreError> {
        let now = self.clock.now_epoch_seconds();
        let mut entries = self.lock();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
