//! Durable store for tenants, access logs, and cached responses.
//!
//! One connection is opened per operation inside `spawn_blocking`; the schema
//! is initialised idempotently. Cache rows are unique per
//! `(tenant_id, prompt_hash)` so identical prompts never collide across
//! tenants.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub api_key: String,
    pub rate_limit_per_hour: i64,
    pub backend_url: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct NewTenant {
    pub name: String,
    pub api_key: String,
    pub rate_limit_per_hour: i64,
    pub backend_url: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TenantUpdate {
    pub name: Option<String>,
    pub backend_url: Option<String>,
    pub rate_limit_per_hour: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CacheEntry {
    pub id: i64,
    pub tenant_id: i64,
    pub prompt_hash: String,
    pub prompt: String,
    pub response: String,
    pub embedding_stored: bool,
    pub hit_count: i64,
    pub created_at_ms: i64,
    pub last_accessed_ms: i64,
}

#[derive(Clone, Debug)]
pub struct AccessLogRecord {
    pub tenant_id: i64,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub response_time_ms: i64,
    pub request_size: i64,
    pub response_size: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct AccessLogRow {
    pub id: i64,
    pub tenant_id: i64,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub response_time_ms: i64,
    pub request_size: i64,
    pub response_size: i64,
    pub ts_ms: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct EndpointCount {
    pub endpoint: String,
    pub count: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TenantAnalytics {
    pub total_requests: i64,
    pub avg_response_time_ms: f64,
    pub total_request_bytes: i64,
    pub total_response_bytes: i64,
    pub success_count: i64,
    pub error_count: i64,
    /// Percentage of 2xx responses; 0.0 when the window has no requests.
    pub success_rate: f64,
    pub top_endpoints: Vec<EndpointCount>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CacheTopEntry {
    pub prompt: String,
    pub hit_count: i64,
    pub last_accessed_ms: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CacheStats {
    pub total_entries: i64,
    pub total_hits: i64,
    /// Mean `hit_count` across entries; 0.0 when the cache is empty.
    pub avg_hits_per_entry: f64,
    pub embeddings_stored: i64,
    pub top_entries: Vec<CacheTopEntry>,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        self.call(|conn| {
            init_schema(conn)?;
            Ok(())
        })
        .await
    }

    async fn call<T, F>(&self, op: F) -> Result<T, SqliteStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, SqliteStoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            op(&mut conn)
        })
        .await?
    }

    pub async fn create_tenant(&self, tenant: NewTenant) -> Result<Tenant, SqliteStoreError> {
        let ts_ms = now_millis();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO tenants (name, api_key, rate_limit_per_hour, backend_url, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                rusqlite::params![
                    tenant.name,
                    tenant.api_key,
                    tenant.rate_limit_per_hour,
                    tenant.backend_url,
                    ts_ms
                ],
            )?;
            let id = conn.last_insert_rowid();
            Ok(Tenant {
                id,
                name: tenant.name,
                api_key: tenant.api_key,
                rate_limit_per_hour: tenant.rate_limit_per_hour,
                backend_url: tenant.backend_url,
                created_at_ms: ts_ms,
                updated_at_ms: ts_ms,
            })
        })
        .await
    }

    pub async fn tenant_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<Tenant>, SqliteStoreError> {
        let api_key = api_key.to_string();
        self.call(move |conn| {
            let tenant = conn
                .query_row(
                    "SELECT id, name, api_key, rate_limit_per_hour, backend_url, created_at_ms, updated_at_ms
                     FROM tenants WHERE api_key = ?1",
                    rusqlite::params![api_key],
                    tenant_from_row,
                )
                .optional()?;
            Ok(tenant)
        })
        .await
    }

    pub async fn tenant_by_id(&self, id: i64) -> Result<Option<Tenant>, SqliteStoreError> {
        self.call(move |conn| {
            let tenant = conn
                .query_row(
                    "SELECT id, name, api_key, rate_limit_per_hour, backend_url, created_at_ms, updated_at_ms
                     FROM tenants WHERE id = ?1",
                    rusqlite::params![id],
                    tenant_from_row,
                )
                .optional()?;
            Ok(tenant)
        })
        .await
    }

    pub async fn list_tenants(&self) -> Result<Vec<Tenant>, SqliteStoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, api_key, rate_limit_per_hour, backend_url, created_at_ms, updated_at_ms
                 FROM tenants ORDER BY created_at_ms DESC, id DESC",
            )?;
            let rows = stmt.query_map([], tenant_from_row)?;
            let mut tenants = Vec::new();
            for row in rows {
                tenants.push(row?);
            }
            Ok(tenants)
        })
        .await
    }

    /// Applies the non-`None` fields; returns false when the tenant is gone.
    pub async fn update_tenant(
        &self,
        id: i64,
        update: TenantUpdate,
    ) -> Result<bool, SqliteStoreError> {
        let ts_ms = now_millis();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE tenants
                 SET name = COALESCE(?2, name),
                     backend_url = COALESCE(?3, backend_url),
                     rate_limit_per_hour = COALESCE(?4, rate_limit_per_hour),
                     updated_at_ms = ?5
                 WHERE id = ?1",
                rusqlite::params![
                    id,
                    update.name,
                    update.backend_url,
                    update.rate_limit_per_hour,
                    ts_ms
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Cascades to the tenant's access logs and cache entries.
    pub async fn delete_tenant(&self, id: i64) -> Result<bool, SqliteStoreError> {
        self.call(move |conn| {
            let changed = conn.execute("DELETE FROM tenants WHERE id = ?1", rusqlite::params![id])?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn rotate_api_key(
        &self,
        id: i64,
        new_api_key: &str,
    ) -> Result<bool, SqliteStoreError> {
        let new_api_key = new_api_key.to_string();
        let ts_ms = now_millis();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE tenants SET api_key = ?2, updated_at_ms = ?3 WHERE id = ?1",
                rusqlite::params![id, new_api_key, ts_ms],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Single-statement read-modify-write: a hit bumps `hit_count` and
    /// refreshes `last_accessed_ms` atomically, so concurrent identical
    /// prompts never lose an increment.
    pub async fn fetch_cache_entry(
        &self,
        tenant_id: i64,
        prompt_hash: &str,
    ) -> Result<Option<CacheEntry>, SqliteStoreError> {
        let prompt_hash = prompt_hash.to_string();
        let ts_ms = now_millis();
        self.call(move |conn| {
            let entry = conn
                .query_row(
                    "UPDATE cache_entries
                     SET hit_count = hit_count + 1, last_accessed_ms = ?3
                     WHERE tenant_id = ?1 AND prompt_hash = ?2
                     RETURNING id, tenant_id, prompt_hash, prompt, response, embedding_stored,
                               hit_count, created_at_ms, last_accessed_ms",
                    rusqlite::params![tenant_id, prompt_hash, ts_ms],
                    cache_entry_from_row,
                )
                .optional()?;
            Ok(entry)
        })
        .await
    }

    /// Plain read without touching the hit counter.
    pub async fn cache_entry(
        &self,
        tenant_id: i64,
        prompt_hash: &str,
    ) -> Result<Option<CacheEntry>, SqliteStoreError> {
        let prompt_hash = prompt_hash.to_string();
        self.call(move |conn| {
            let entry = conn
                .query_row(
                    "SELECT id, tenant_id, prompt_hash, prompt, response, embedding_stored,
                            hit_count, created_at_ms, last_accessed_ms
                     FROM cache_entries WHERE tenant_id = ?1 AND prompt_hash = ?2",
                    rusqlite::params![tenant_id, prompt_hash],
                    cache_entry_from_row,
                )
                .optional()?;
            Ok(entry)
        })
        .await
    }

    /// Upsert keyed on `(tenant_id, prompt_hash)`. A conflict overwrites the
    /// response and refreshes `last_accessed_ms` but preserves `hit_count`.
    pub async fn upsert_cache_entry(
        &self,
        tenant_id: i64,
        prompt_hash: &str,
        prompt: &str,
        response: &str,
    ) -> Result<(), SqliteStoreError> {
        let prompt_hash = prompt_hash.to_string();
        let prompt = prompt.to_string();
        let response = response.to_string();
        let ts_ms = now_millis();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO cache_entries
                     (tenant_id, prompt_hash, prompt, response, embedding_stored, hit_count,
                      created_at_ms, last_accessed_ms)
                 VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?5)
                 ON CONFLICT(tenant_id, prompt_hash) DO UPDATE
                 SET response = excluded.response, last_accessed_ms = excluded.last_accessed_ms",
                rusqlite::params![tenant_id, prompt_hash, prompt, response, ts_ms],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_embedding_stored(
        &self,
        tenant_id: i64,
        prompt_hash: &str,
    ) -> Result<(), SqliteStoreError> {
        let prompt_hash = prompt_hash.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE cache_entries SET embedding_stored = 1
                 WHERE tenant_id = ?1 AND prompt_hash = ?2",
                rusqlite::params![tenant_id, prompt_hash],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn append_access_log(
        &self,
        record: AccessLogRecord,
    ) -> Result<(), SqliteStoreError> {
        let ts_ms = now_millis();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO access_logs
                     (tenant_id, endpoint, method, status_code, response_time_ms,
                      request_size, response_size, ts_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    record.tenant_id,
                    record.endpoint,
                    record.method,
                    record.status_code,
                    record.response_time_ms,
                    record.request_size,
                    record.response_size,
                    ts_ms
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_access_logs(
        &self,
        tenant_id: i64,
    ) -> Result<Vec<AccessLogRow>, SqliteStoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tenant_id, endpoint, method, status_code, response_time_ms,
                        request_size, response_size, ts_ms
                 FROM access_logs WHERE tenant_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(rusqlite::params![tenant_id], |row| {
                Ok(AccessLogRow {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    endpoint: row.get(2)?,
                    method: row.get(3)?,
                    status_code: row.get(4)?,
                    response_time_ms: row.get(5)?,
                    request_size: row.get(6)?,
                    response_size: row.get(7)?,
                    ts_ms: row.get(8)?,
                })
            })?;
            let mut logs = Vec::new();
            for row in rows {
                logs.push(row?);
            }
            Ok(logs)
        })
        .await
    }

    pub async fn tenant_analytics(
        &self,
        tenant_id: i64,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<TenantAnalytics, SqliteStoreError> {
        self.call(move |conn| {
            let (total_requests, avg_response_time_ms, total_request_bytes, total_response_bytes, success_count, error_count) =
                conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(AVG(response_time_ms), 0.0),
                            COALESCE(SUM(request_size), 0),
                            COALESCE(SUM(response_size), 0),
                            COALESCE(SUM(CASE WHEN status_code >= 200 AND status_code < 300 THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN status_code >= 400 THEN 1 ELSE 0 END), 0)
                     FROM access_logs
                     WHERE tenant_id = ?1 AND ts_ms >= ?2 AND ts_ms <= ?3",
                    rusqlite::params![tenant_id, from_ms, to_ms],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, f64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )?;

            let mut stmt = conn.prepare(
                "SELECT endpoint, COUNT(*) AS count
                 FROM access_logs
                 WHERE tenant_id = ?1 AND ts_ms >= ?2 AND ts_ms <= ?3
                 GROUP BY endpoint ORDER BY count DESC LIMIT 10",
            )?;
            let rows = stmt.query_map(rusqlite::params![tenant_id, from_ms, to_ms], |row| {
                Ok(EndpointCount {
                    endpoint: row.get(0)?,
                    count: row.get(1)?,
                })
            })?;
            let mut top_endpoints = Vec::new();
            for row in rows {
                top_endpoints.push(row?);
            }

            let success_rate = if total_requests > 0 {
                success_count as f64 / total_requests as f64 * 100.0
            } else {
                0.0
            };

            Ok(TenantAnalytics {
                total_requests,
                avg_response_time_ms,
                total_request_bytes,
                total_response_bytes,
                success_count,
                error_count,
                success_rate,
                top_endpoints,
            })
        })
        .await
    }

    pub async fn cache_stats(&self) -> Result<CacheStats, SqliteStoreError> {
        self.call(|conn| {
            let (total_entries, total_hits, avg_hits_per_entry, embeddings_stored) = conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(hit_count), 0),
                            COALESCE(AVG(hit_count), 0.0),
                            COALESCE(SUM(CASE WHEN embedding_stored = 1 THEN 1 ELSE 0 END), 0)
                     FROM cache_entries",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )?;

            let mut stmt = conn.prepare(
                "SELECT prompt, hit_count, last_accessed_ms
                 FROM cache_entries ORDER BY hit_count DESC LIMIT 10",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(CacheTopEntry {
                    prompt: row.get(0)?,
                    hit_count: row.get(1)?,
                    last_accessed_ms: row.get(2)?,
                })
            })?;
            let mut top_entries = Vec::new();
            for row in rows {
                top_entries.push(row?);
            }

            Ok(CacheStats {
                total_entries,
                total_hits,
                avg_hits_per_entry,
                embeddings_stored,
                top_entries,
            })
        })
        .await
    }
}

fn tenant_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        api_key: row.get(2)?,
        rate_limit_per_hour: row.get(3)?,
        backend_url: row.get(4)?,
        created_at_ms: row.get(5)?,
        updated_at_ms: row.get(6)?,
    })
}

fn cache_entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        prompt_hash: row.get(2)?,
        prompt: row.get(3)?,
        response: row.get(4)?,
        embedding_stored: row.get::<_, i64>(5)? != 0,
        hit_count: row.get(6)?,
        created_at_ms: row.get(7)?,
        last_accessed_ms: row.get(8)?,
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tenants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            api_key TEXT NOT NULL UNIQUE,
            rate_limit_per_hour INTEGER NOT NULL DEFAULT 1000,
            backend_url TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS access_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
            endpoint TEXT NOT NULL,
            method TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            response_time_ms INTEGER NOT NULL,
            request_size INTEGER NOT NULL,
            response_size INTEGER NOT NULL,
            ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_access_logs_tenant_ts
            ON access_logs(tenant_id, ts_ms);

        CREATE TABLE IF NOT EXISTS cache_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
            prompt_hash TEXT NOT NULL,
            prompt TEXT NOT NULL,
            response TEXT NOT NULL,
            embedding_stored INTEGER NOT NULL DEFAULT 0,
            hit_count INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL,
            last_accessed_ms INTEGER NOT NULL,
            UNIQUE(tenant_id, prompt_hash)
        );",
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch(
        "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;",
    );
    Ok(conn)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
