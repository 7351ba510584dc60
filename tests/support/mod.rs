#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;
use tower::util::ServiceExt;

use semgate::{
    AppState, Clock, Embedder, EmbeddingError, ManualClock, MemoryStore, NewTenant, ProxyConfig,
    SqliteStore, Tenant, TokenService, UpstreamProxy, VolatileStore, VolatileStoreError,
};

pub const JWT_SECRET: &str = "test-secret";

/// Embedder with per-prompt scripted vectors. Unscripted prompts map to a
/// deterministic basis vector on dimensions 2..8, orthogonal to the
/// dimensions scripted vectors are expected to use.
#[derive(Default)]
pub struct StubEmbedder {
    vectors: Mutex<HashMap<String, Vec<f32>>>,
}

impl StubEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, text: &str, vector: Vec<f32>) {
        self.vectors
            .lock()
            .unwrap()
            .insert(text.to_string(), vector);
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Some(vector) = self.vectors.lock().unwrap().get(text) {
            return Ok(vector.clone());
        }
        let mut vector = vec![0.0f32; 8];
        let index = 2 + text.bytes().map(usize::from).sum::<usize>() % 6;
        vector[index] = 1.0;
        Ok(vector)
    }
}

pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::InvalidResponse(
            "embedding service down".to_string(),
        ))
    }
}

/// Volatile store whose every operation fails, for fail-closed paths.
pub struct FailingVolatileStore;

#[async_trait]
impl VolatileStore for FailingVolatileStore {
    async fn incr_with_ttl(&self, _key: &str, _ttl: Duration) -> Result<i64, VolatileStoreError> {
        Err(VolatileStoreError::Unavailable("down".to_string()))
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, VolatileStoreError> {
        Err(VolatileStoreError::Unavailable("down".to_string()))
    }

    async fn set_with_ttl(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> Result<(), VolatileStoreError> {
        Err(VolatileStoreError::Unavailable("down".to_string()))
    }

    async fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>, VolatileStoreError> {
        Err(VolatileStoreError::Unavailable("down".to_string()))
    }
}

pub struct TestApp {
    _dir: TempDir,
    pub store: SqliteStore,
    pub clock: Arc<ManualClock>,
    pub volatile: Arc<MemoryStore>,
    pub router: Router,
}

impl TestApp {
    pub async fn request(
        &self,
        request: axum::http::Request<axum::body::Body>,
    ) -> axum::response::Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub fn token_for(&self, tenant: &Tenant) -> String {
        TokenService::new(JWT_SECRET, self.clock.clone())
            .issue(tenant.id, &tenant.api_key)
            .unwrap()
    }

    pub async fn create_tenant(&self, api_key: &str, backend_url: &str, quota: i64) -> Tenant {
        self.store
            .create_tenant(NewTenant {
                name: format!("tenant-{api_key}"),
                api_key: api_key.to_string(),
                rate_limit_per_hour: quota,
                backend_url: backend_url.to_string(),
            })
            .await
            .unwrap()
    }
}

pub fn fast_proxy_config() -> ProxyConfig {
    ProxyConfig {
        llm_timeout: Duration::from_secs(5),
        default_timeout: Duration::from_secs(5),
        max_attempts: 3,
        backoff_unit: Duration::from_millis(20),
    }
}

pub async fn test_app(embedder: Arc<dyn Embedder>) -> TestApp {
    test_app_with(embedder, fast_proxy_config(), None, None).await
}

pub async fn test_app_with(
    embedder: Arc<dyn Embedder>,
    proxy_config: ProxyConfig,
    volatile_override: Option<Arc<dyn VolatileStore>>,
    admin_token: Option<&str>,
) -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
    store.init().await.expect("init schema");

    let clock = Arc::new(ManualClock::new(1_704_164_645));
    let memory = Arc::new(MemoryStore::new(clock.clone() as Arc<dyn Clock>));
    let volatile: Arc<dyn VolatileStore> = match volatile_override {
        Some(volatile) => volatile,
        None => memory.clone(),
    };

    let proxy = UpstreamProxy::new(proxy_config).expect("proxy client");
    let tokens = TokenService::new(JWT_SECRET, clock.clone());
    let mut state = AppState::new(
        store.clone(),
        volatile,
        embedder,
        proxy,
        tokens,
        clock.clone(),
    );
    if let Some(token) = admin_token {
        state = state.with_admin_token(token);
    }

    TestApp {
        _dir: dir,
        store,
        clock,
        volatile: memory,
        router: semgate::http::router(state),
    }
}

/// Binds a throwaway local server for use as a tenant backend.
pub async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

/// Reserves a port with nothing listening on it.
pub fn refused_backend_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("http://{addr}")
}

pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..150 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}
