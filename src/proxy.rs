//! Buffered forwarding to a tenant's upstream backend.
//!
//! The inbound body is buffered once so failed attempts can be replayed.
//! Responses with status >= 500 and connect-level transport failures are
//! retried with a linear back-off; timeouts are terminal.

use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use bytes::Bytes;
use thiserror::Error;

use crate::sqlite_store::Tenant;

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub llm_timeout: Duration,
    pub default_timeout: Duration,
    pub max_attempts: usize,
    pub backoff_unit: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            llm_timeout: Duration::from_secs(60),
            default_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_unit: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Backend request timed out")]
    Timeout,
    #[error("Backend connection refused")]
    ConnectionRefused,
    #[error("Backend unreachable: {0}")]
    Unreachable(String),
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::ConnectionRefused
            | ProxyError::Unreachable(_)
            | ProxyError::InvalidUrl(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Debug)]
pub struct ProxiedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct UpstreamProxy {
    client: reqwest::Client,
    config: ProxyConfig,
}

impl UpstreamProxy {
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|err| ProxyError::Unreachable(err.to_string()))?;
        Ok(Self { client, config })
    }

    /// Forwards the buffered request to the tenant's backend and captures the
    /// response body. `path_and_query` is the inbound path; a leading `/api`
    /// is stripped before the backend sees it.
    pub async fn forward(
        &self,
        tenant: &Tenant,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
        llm_path: bool,
    ) -> Result<ProxiedResponse, ProxyError> {
        let url = build_upstream_url(&tenant.backend_url, path_and_query)?;
        let timeout = if llm_path {
            self.config.llm_timeout
        } else {
            self.config.default_timeout
        };
        let deadline = Instant::now() + timeout;
        let headers = forwardable_headers(&headers);

        let mut attempt = 1usize;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProxyError::Timeout);
            }

            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .headers(headers.clone())
                .timeout(remaining);
            if !body.is_empty() {
                request = request.body(body.clone());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() >= 500 && attempt < self.config.max_attempts {
                        tracing::warn!(
                            %status,
                            attempt,
                            backend = %tenant.backend_url,
                            "retryable backend status"
                        );
                        let _ = response.bytes().await;
                        tokio::time::sleep(self.backoff(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    let response_headers = response.headers().clone();
                    let body = response
                        .bytes()
                        .await
                        .map_err(|err| map_transport_error(&err))?;
                    return Ok(ProxiedResponse {
                        status,
                        headers: response_headers,
                        body,
                    });
                }
                Err(err) => {
                    let mapped = map_transport_error(&err);
                    let retryable = err.is_connect() && !matches!(mapped, ProxyError::Timeout);
                    if retryable && attempt < self.config.max_attempts {
                        tracing::warn!(
                            error = %err,
                            attempt,
                            backend = %tenant.backend_url,
                            "retryable backend transport failure"
                        );
                        tokio::time::sleep(self.backoff(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(mapped);
                }
            }
        }
    }

    fn backoff(&self, attempt: usize) -> Duration {
        self.config.backoff_unit * attempt as u32
    }
}

fn map_transport_error(err: &reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        return ProxyError::Timeout;
    }
    if source_is_connection_refused(err) {
        return ProxyError::ConnectionRefused;
    }
    ProxyError::Unreachable(err.to_string())
}

fn source_is_connection_refused(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<std::io::Error>() {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = inner.source();
    }
    false
}

fn build_upstream_url(backend_url: &str, path_and_query: &str) -> Result<String, ProxyError> {
    reqwest::Url::parse(backend_url)
        .map_err(|_| ProxyError::InvalidUrl(backend_url.to_string()))?;
    let base = backend_url.trim_end_matches('/');
    let stripped = path_and_query.strip_prefix("/api").unwrap_or(path_and_query);
    let suffix = if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{stripped}")
    };
    Ok(format!("{base}{suffix}"))
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-authenticate"
            | "proxy-authorization"
    )
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if name == axum::http::header::HOST
            || name == axum::http::header::CONTENT_LENGTH
            || is_hop_by_hop(name)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Headers safe to relay back to the client on a proxied response.
pub fn passthrough_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if name == axum::http::header::CONTENT_LENGTH || is_hop_by_hop(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}
