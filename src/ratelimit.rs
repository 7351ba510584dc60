//! Per-tenant hourly quotas backed by the shared volatile store.

use std::sync::Arc;
use std::time::Duration;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::clock::Clock;
use crate::volatile::{VolatileStore, VolatileStoreError};

const BUCKET_TTL: Duration = Duration::from_secs(60 * 60);

pub struct QuotaEnforcer {
    store: Arc<dyn VolatileStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn VolatileStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Charges one unit against the tenant's current hour bucket. A store
    /// failure propagates so the pipeline can fail closed.
    pub async fn allow(&self, tenant_id: i64, limit: i64) -> Result<bool, VolatileStoreError> {
        let key = self.bucket_key(tenant_id);
        let count = self.store.incr_with_ttl(&key, BUCKET_TTL).await?;
        Ok(count <= limit)
    }

    fn bucket_key(&self, tenant_id: i64) -> String {
        format!(
            "ratelimit:tenant:{tenant_id}:{}",
            hour_bucket(self.clock.now_epoch_seconds())
        )
    }
}

/// UTC hour bucket, `YYYY-MM-DD-HH`. Every process derives the same key for
/// the same wall-clock hour, so concurrent increments land on one counter.
pub fn hour_bucket(epoch_seconds: u64) -> String {
    const FORMAT: &[FormatItem<'_>] = format_description!("[year]-[month]-[day]-[hour]");
    let datetime = OffsetDateTime::from_unix_timestamp(epoch_seconds as i64)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    datetime.format(FORMAT).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::volatile::MemoryStore;

    #[test]
    fn hour_bucket_is_utc_and_hour_aligned() {
        assert_eq!(hour_bucket(0), "1970-01-01-00");
        assert_eq!(hour_bucket(3_599), "1970-01-01-00");
        assert_eq!(hour_bucket(3_600), "1970-01-01-01");
        // 2024-01-02 03:04:05 UTC
        assert_eq!(hour_bucket(1_704_164_645), "2024-01-02-03");
    }

    #[tokio::test]
    async fn quota_boundary_denies_the_excess_request() {
        let clock = Arc::new(ManualClock::new(1_704_164_645));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let enforcer = QuotaEnforcer::new(store, clock);

        for _ in 0..3 {
            assert!(enforcer.allow(1, 3).await.unwrap());
        }
        assert!(!enforcer.allow(1, 3).await.unwrap());
    }

    #[tokio::test]
    async fn a_new_hour_resets_the_counter() {
        let clock = Arc::new(ManualClock::new(1_704_164_645));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let enforcer = QuotaEnforcer::new(store, clock.clone());

        assert!(enforcer.allow(1, 1).await.unwrap());
        assert!(!enforcer.allow(1, 1).await.unwrap());

        clock.advance(3_600);
        assert!(enforcer.allow(1, 1).await.unwrap());
    }

    #[tokio::test]
    async fn tenants_have_independent_buckets() {
        let clock = Arc::new(ManualClock::new(1_704_164_645));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let enforcer = QuotaEnforcer::new(store, clock);

        assert!(enforcer.allow(1, 1).await.unwrap());
        assert!(!enforcer.allow(1, 1).await.unwrap());
        assert!(enforcer.allow(2, 1).await.unwrap());
    }
}
