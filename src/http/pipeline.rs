//! The per-request state machine behind `/api/*`: authenticate, resolve the
//! tenant, charge the quota, try the cache, proxy on a miss, then admit and
//! log off the request path.

use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};

use super::{gateway_error_response, AppState};
use crate::auth::Claims;
use crate::error::GatewayError;
use crate::proxy::{passthrough_headers, ProxiedResponse};
use crate::sqlite_store::{AccessLogRecord, Tenant};

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const LLM_PATHS: [&str; 5] = [
    "/v1/chat/completions",
    "/v1/completions",
    "/api/chat",
    "/llm",
    "/generate",
];

pub(super) async fn handle(State(state): State<AppState>, request: Request) -> Response {
    let start = Instant::now();
    let (parts, body) = request.into_parts();
    let method = parts.method;
    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let headers = parts.headers;

    // Authentication failures terminate before any tenant is known, so they
    // are the one terminal state without an access log.
    let claims = match authenticate(&state, &headers) {
        Ok(claims) => claims,
        Err(err) => return gateway_error_response(&err).into_response(),
    };

    let tenant = match state.tenants.by_credential(&claims.api_key).await {
        Ok(Some(tenant)) => tenant,
        Ok(None) => {
            tracing::warn!(tenant_id = claims.tenant_id, "tenant not found");
            return gateway_error_response(&GatewayError::TenantUnknown).into_response();
        }
        Err(err) => {
            tracing::error!(error = %err, "tenant lookup failed");
            return gateway_error_response(&GatewayError::DirectoryUnavailable(err.to_string()))
                .into_response();
        }
    };

    match state.quota.allow(tenant.id, tenant.rate_limit_per_hour).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(tenant_id = tenant.id, "rate limit exceeded");
            let err = GatewayError::QuotaExceeded;
            log_access(&state, &tenant, &path, &method, err.status(), start, 0, 0);
            return gateway_error_response(&err).into_response();
        }
        Err(err) => {
            tracing::error!(tenant_id = tenant.id, error = %err, "rate limit check failed");
            let err = GatewayError::QuotaUnavailable(err.to_string());
            log_access(&state, &tenant, &path, &method, err.status(), start, 0, 0);
            return gateway_error_response(&err).into_response();
        }
    }

    let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            let err = GatewayError::UnreadableBody;
            log_access(&state, &tenant, &path, &method, err.status(), start, 0, 0);
            return gateway_error_response(&err).into_response();
        }
    };

    let llm_path = is_llm_path(&path);
    let prompt = if llm_path && !body_bytes.is_empty() {
        extract_prompt(&body_bytes)
    } else {
        None
    };

    if let Some(prompt) = prompt.as_deref() {
        if let Some(cached) = state.cache.lookup(tenant.id, prompt).await {
            tracing::info!(tenant_id = tenant.id, "cache hit");
            log_access(
                &state,
                &tenant,
                &path,
                &method,
                StatusCode::OK,
                start,
                body_bytes.len(),
                cached.len(),
            );
            return cache_hit_response(cached);
        }
        tracing::debug!(tenant_id = tenant.id, "cache miss");
    }

    let forwarded = state
        .proxy
        .forward(
            &tenant,
            method.clone(),
            &path_and_query,
            headers,
            body_bytes.clone(),
            llm_path,
        )
        .await;

    match forwarded {
        Ok(upstream) => {
            if llm_path && upstream.status == StatusCode::OK && !upstream.body.is_empty() {
                if let Some(prompt) = prompt {
                    admit_detached(&state, tenant.id, prompt, &upstream);
                }
            }
            log_access(
                &state,
                &tenant,
                &path,
                &method,
                upstream.status,
                start,
                body_bytes.len(),
                upstream.body.len(),
            );
            upstream_response(upstream)
        }
        Err(err) => {
            tracing::warn!(tenant_id = tenant.id, error = %err, "upstream forward failed");
            let err = GatewayError::from(err);
            log_access(
                &state,
                &tenant,
                &path,
                &method,
                err.status(),
                start,
                body_bytes.len(),
                0,
            );
            gateway_error_response(&err).into_response()
        }
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Claims, GatewayError> {
    let header = headers
        .get(header::AUTHORIZATION)
        .ok_or(GatewayError::MissingAuthHeader)?;
    let value = header
        .to_str()
        .map_err(|_| GatewayError::MalformedAuthHeader)?;
    let mut parts = value.split_whitespace();
    let token = match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(token), None) => token,
        _ => return Err(GatewayError::MalformedAuthHeader),
    };
    state
        .tokens
        .verify(token)
        .map_err(|_| GatewayError::InvalidToken)
}

pub(crate) fn is_llm_path(path: &str) -> bool {
    LLM_PATHS.iter().any(|candidate| path.contains(candidate))
}

/// First match wins: last `messages[].content`, then `prompt`, then
/// `question`. Unparseable JSON or an empty result skips the cache path.
pub(crate) fn extract_prompt(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;

    let prompt = if let Some(content) = value
        .get("messages")
        .and_then(|messages| messages.as_array())
        .and_then(|messages| messages.last())
        .and_then(|last| last.get("content"))
        .and_then(|content| content.as_str())
    {
        content
    } else if let Some(prompt) = value.get("prompt").and_then(|prompt| prompt.as_str()) {
        prompt
    } else if let Some(question) = value.get("question").and_then(|question| question.as_str()) {
        question
    } else {
        return None;
    };

    (!prompt.is_empty()).then(|| prompt.to_string())
}

fn cache_hit_response(body: String) -> Response {
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-cache-status", "HIT")
        .body(Body::from(body))
    {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn upstream_response(upstream: ProxiedResponse) -> Response {
    let mut builder = Response::builder().status(upstream.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = passthrough_headers(&upstream.headers);
    }
    match builder.body(Body::from(upstream.body)) {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Cache admission runs detached so a disconnecting client cannot truncate
/// the write; the client sees its response before admission completes.
fn admit_detached(state: &AppState, tenant_id: i64, prompt: String, upstream: &ProxiedResponse) {
    let cache = state.cache.clone();
    let response = String::from_utf8_lossy(&upstream.body).into_owned();
    tokio::spawn(async move {
        if let Err(err) = cache.admit(tenant_id, &prompt, &response).await {
            tracing::warn!(tenant_id, error = %err, "cache admission failed");
        } else {
            tracing::debug!(tenant_id, "response admitted to cache");
        }
    });
}

#[allow(clippy::too_many_arguments)]
fn log_access(
    state: &AppState,
    tenant: &Tenant,
    endpoint: &str,
    method: &Method,
    status: StatusCode,
    start: Instant,
    request_size: usize,
    response_size: usize,
) {
    state.access_log.record(AccessLogRecord {
        tenant_id: tenant.id,
        endpoint: endpoint.to_string(),
        method: method.as_str().to_string(),
        status_code: status.as_u16(),
        response_time_ms: start.elapsed().as_millis() as i64,
        request_size: request_size as i64,
        response_size: response_size as i64,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_paths_match_by_substring() {
        assert!(is_llm_path("/api/v1/chat/completions"));
        assert!(is_llm_path("/api/v1/completions"));
        assert!(is_llm_path("/api/chat"));
        assert!(is_llm_path("/api/llm/infer"));
        assert!(is_llm_path("/api/generate"));
        assert!(!is_llm_path("/api/users"));
        assert!(!is_llm_path("/health"));
    }

    #[test]
    fn prompt_extraction_prefers_the_last_message() {
        let body = br#"{"messages":[{"role":"user","content":"first"},{"role":"user","content":"second"}]}"#;
        assert_eq!(extract_prompt(body).as_deref(), Some("second"));
    }

    #[test]
    fn prompt_extraction_falls_back_to_prompt_then_question() {
        assert_eq!(
            extract_prompt(br#"{"prompt":"capital of France"}"#).as_deref(),
            Some("capital of France")
        );
        assert_eq!(
            extract_prompt(br#"{"question":"what time is it?"}"#).as_deref(),
            Some("what time is it?")
        );
        // `messages` wins over `prompt`.
        assert_eq!(
            extract_prompt(br#"{"messages":[{"content":"from messages"}],"prompt":"ignored"}"#)
                .as_deref(),
            Some("from messages")
        );
    }

    #[test]
    fn unusable_bodies_yield_no_prompt() {
        assert_eq!(extract_prompt(b"not json"), None);
        assert_eq!(extract_prompt(br#"{"messages":[]}"#), None);
        assert_eq!(extract_prompt(br#"{"messages":[{"content":42}]}"#), None);
        assert_eq!(extract_prompt(br#"{"prompt":""}"#), None);
        assert_eq!(extract_prompt(br#"{"other":"field"}"#), None);
    }
}
