//! Multi-tenant gateway for LLM backends.
//!
//! Requests are authenticated with short-lived bearer tokens, attributed to a
//! tenant, charged against an hourly quota, and answered from a two-stage
//! response cache (exact SHA-256 match, then cosine similarity over stored
//! embeddings) before falling through to the tenant's upstream backend.

pub mod access_log;
pub mod auth;
pub mod clock;
pub mod config;
pub mod embedding;
pub mod error;
pub mod http;
pub mod proxy;
pub mod ratelimit;
pub mod redis_store;
pub mod semantic_cache;
pub mod sqlite_store;
pub mod tenants;
pub mod volatile;

pub use access_log::AccessLogSink;
pub use auth::{AuthError, Claims, TokenService};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError};
pub use embedding::{Embedder, EmbeddingError, HttpEmbedder};
pub use error::GatewayError;
pub use http::AppState;
pub use proxy::{ProxiedResponse, ProxyConfig, ProxyError, UpstreamProxy};
pub use ratelimit::QuotaEnforcer;
pub use redis_store::RedisStore;
pub use semantic_cache::{SemanticCache, SIMILARITY_THRESHOLD};
pub use sqlite_store::{
    AccessLogRecord, CacheEntry, CacheStats, NewTenant, SqliteStore, SqliteStoreError, Tenant,
    TenantAnalytics, TenantUpdate,
};
pub use tenants::TenantDirectory;
pub use volatile::{MemoryStore, VolatileStore, VolatileStoreError};
