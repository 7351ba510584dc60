//! Two-stage response cache: exact SHA-256 match against the durable store,
//! then cosine similarity over the tenant's embeddings in the volatile store.
//!
//! Lookup is best-effort and never fails a request; any internal error in the
//! semantic stage degrades to a miss. Admission writes the durable row first
//! so the exact stage keeps working even when the embedding write fails.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::embedding::Embedder;
use crate::sqlite_store::{SqliteStore, SqliteStoreError};
use crate::volatile::VolatileStore;

pub const SIMILARITY_THRESHOLD: f32 = 0.85;

const EMBEDDING_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub struct SemanticCache {
    store: SqliteStore,
    volatile: Arc<dyn VolatileStore>,
    embedder: Arc<dyn Embedder>,
    threshold: f32,
}

impl SemanticCache {
    pub fn new(
        store: SqliteStore,
        volatile: Arc<dyn VolatileStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            store,
            volatile,
            embedder,
            threshold: SIMILARITY_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Returns the cached response, or `None` on a miss or any cache-side
    /// failure.
    pub async fn lookup(&self, tenant_id: i64, prompt: &str) -> Option<String> {
        let prompt_hash = hash_prompt(prompt);
        match self.store.fetch_cache_entry(tenant_id, &prompt_hash).await {
            Ok(Some(entry)) => return Some(entry.response),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(tenant_id, error = %err, "exact cache stage failed");
                return None;
            }
        }
        self.semantic_lookup(tenant_id, prompt).await
    }

    async fn semantic_lookup(&self, tenant_id: i64, prompt: &str) -> Option<String> {
        let query = match self.embedder.embed(prompt).await {
            Ok(vector) => vector,
            Err(err) => {
                tracing::warn!(tenant_id, error = %err, "embedding failed, treating as miss");
                return None;
            }
        };

        let prefix = embedding_key_prefix(tenant_id);
        let keys = match self.volatile.keys_with_prefix(&prefix).await {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!(tenant_id, error = %err, "embedding scan failed, treating as miss");
                return None;
            }
        };

        let mut best: Option<(f32, String)> = None;
        for key in keys {
            let Ok(Some(raw)) = self.volatile.get(&key).await else {
                continue;
            };
            let Ok(candidate) = serde_json::from_str::<Vec<f32>>(&raw) else {
                continue;
            };
            let similarity = cosine_similarity(&query, &candidate);
            if similarity < self.threshold {
                continue;
            }
            let better = match &best {
                Some((best_similarity, _)) => similarity > *best_similarity,
                None => true,
            };
            if better {
                best = Some((similarity, key[prefix.len()..].to_string()));
            }
        }

        let (similarity, prompt_hash) = best?;
        match self.store.fetch_cache_entry(tenant_id, &prompt_hash).await {
            Ok(Some(entry)) => {
                tracing::debug!(tenant_id, similarity, "semantic cache hit");
                Some(entry.response)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(tenant_id, error = %err, "semantic candidate fetch failed");
                None
            }
        }
    }

    /// Stores a prompt/response pair. The durable upsert is the only part
    /// that can fail the call; the embedding write is best-effort.
    pub async fn admit(
        &self,
        tenant_id: i64,
        prompt: &str,
        response: &str,
    ) -> Result<(), SqliteStoreError> {
        let prompt_hash = hash_prompt(prompt);
        self.store
            .upsert_cache_entry(tenant_id, &prompt_hash, prompt, response)
            .await?;

        let vector = match self.embedder.embed(prompt).await {
            Ok(vector) => vector,
            Err(err) => {
                tracing::warn!(tenant_id, error = %err, "skipping embedding for admitted entry");
                return Ok(());
            }
        };
        let payload = match serde_json::to_string(&vector) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(tenant_id, error = %err, "embedding not serializable");
                return Ok(());
            }
        };
        let key = format!("{}{prompt_hash}", embedding_key_prefix(tenant_id));
        if let Err(err) = self.volatile.set_with_ttl(&key, &payload, EMBEDDING_TTL).await {
            tracing::warn!(tenant_id, error = %err, "embedding write failed");
            return Ok(());
        }
        if let Err(err) = self.store.mark_embedding_stored(tenant_id, &prompt_hash).await {
            tracing::warn!(tenant_id, error = %err, "failed to flag stored embedding");
        }
        Ok(())
    }
}

pub fn hash_prompt(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hex_encode(&hasher.finalize())
}

fn embedding_key_prefix(tenant_id: i64) -> String {
    format!("embedding:tenant:{tenant_id}:prompt:")
}

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_CHARS[(byte >> 4) as usize] as char);
        out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    out
}

/// Cosine similarity over equal-length vectors; 0.0 for mismatched lengths
/// or zero-norm inputs, never NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
