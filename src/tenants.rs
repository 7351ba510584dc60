//! Tenant directory with a short-TTL per-process memoization of credential
//! lookups. Rotations become visible within `MEMO_TTL_SECONDS`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::sqlite_store::{SqliteStore, SqliteStoreError, Tenant};

const MEMO_TTL_SECONDS: u64 = 30;

pub struct TenantDirectory {
    store: SqliteStore,
    clock: Arc<dyn Clock>,
    by_credential: Mutex<HashMap<String, (Tenant, u64)>>,
}

impl TenantDirectory {
    pub fn new(store: SqliteStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            by_credential: Mutex::new(HashMap::new()),
        }
    }

    pub async fn by_credential(
        &self,
        api_key: &str,
    ) -> Result<Option<Tenant>, SqliteStoreError> {
        let now = self.clock.now_epoch_seconds();
        {
            let memo = self.by_credential.lock().await;
            if let Some((tenant, expires_at)) = memo.get(api_key) {
                if *expires_at > now {
                    return Ok(Some(tenant.clone()));
                }
            }
        }

        let tenant = self.store.tenant_by_api_key(api_key).await?;
        let mut memo = self.by_credential.lock().await;
        memo.retain(|_, (_, expires_at)| *expires_at > now);
        match &tenant {
            Some(tenant) => {
                memo.insert(
                    api_key.to_string(),
                    (tenant.clone(), now + MEMO_TTL_SECONDS),
                );
            }
            None => {
                memo.remove(api_key);
            }
        }
        Ok(tenant)
    }

    pub async fn by_id(&self, id: i64) -> Result<Option<Tenant>, SqliteStoreError> {
        self.store.tenant_by_id(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sqlite_store::NewTenant;

    async fn directory() -> (tempfile::TempDir, Arc<ManualClock>, SqliteStore, TenantDirectory) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
        store.init().await.expect("init");
        let clock = Arc::new(ManualClock::new(1_000));
        let directory = TenantDirectory::new(store.clone(), clock.clone());
        (dir, clock, store, directory)
    }

    #[tokio::test]
    async fn memoized_lookups_serve_from_cache_until_the_ttl_lapses() {
        let (_dir, clock, store, directory) = directory().await;
        let tenant = store
            .create_tenant(NewTenant {
                name: "acme".to_string(),
                api_key: "key-1".to_string(),
                rate_limit_per_hour: 1000,
                backend_url: "http://localhost:9000".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            directory.by_credential("key-1").await.unwrap().unwrap().id,
            tenant.id
        );

        // Rotation is masked by the memo until it expires.
        store.rotate_api_key(tenant.id, "key-2").await.unwrap();
        assert!(directory.by_credential("key-1").await.unwrap().is_some());

        clock.advance(MEMO_TTL_SECONDS + 1);
        assert!(directory.by_credential("key-1").await.unwrap().is_none());
        assert!(directory.by_credential("key-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn misses_are_not_memoized() {
        let (_dir, _clock, store, directory) = directory().await;
        assert!(directory.by_credential("key-1").await.unwrap().is_none());

        store
            .create_tenant(NewTenant {
                name: "acme".to_string(),
                api_key: "key-1".to_string(),
                rate_limit_per_hour: 1000,
                backend_url: "http://localhost:9000".to_string(),
            })
            .await
            .unwrap();
        assert!(directory.by_credential("key-1").await.unwrap().is_some());
    }
}
