use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::volatile::{VolatileStore, VolatileStoreError};

/// Redis-backed volatile store shared by every gateway instance. Quota
/// counters and embedding vectors live here; nothing is durable.
#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, VolatileStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), VolatileStoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get("__semgate_ping__").await?;
        Ok(())
    }
}

#[async_trait]
impl VolatileStore for RedisStore {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, VolatileStoreError> {
        let mut conn = self.connection().await?;
        let count: i64 = conn.incr(key, 1).await?;
        if count == 1 {
            let _: () = conn.expire(key, ttl.as_secs() as i64).await?;
        }
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, VolatileStoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.get(key).await?)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), VolatileStoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, VolatileStoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.keys(format!("{prefix}*")).await?)
    }
}
