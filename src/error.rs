use axum::http::StatusCode;
use thiserror::Error;

use crate::proxy::ProxyError;

/// Request-terminating failures, each mapped to the status code the client
/// sees. Cache and access-log failures never surface here.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Missing authorization header")]
    MissingAuthHeader,
    #[error("Invalid authorization header format")]
    MalformedAuthHeader,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Tenant not found")]
    TenantUnknown,
    #[error("Tenant lookup failed: {0}")]
    DirectoryUnavailable(String),
    #[error("Rate limit exceeded")]
    QuotaExceeded,
    #[error("Rate limit check failed: {0}")]
    QuotaUnavailable(String),
    #[error("Failed to read request body")]
    UnreadableBody,
    #[error("Backend request timed out")]
    UpstreamTimeout,
    #[error("{0}")]
    UpstreamUnreachable(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingAuthHeader
            | GatewayError::MalformedAuthHeader
            | GatewayError::InvalidToken => StatusCode::UNAUTHORIZED,
            GatewayError::TenantUnknown => StatusCode::NOT_FOUND,
            GatewayError::DirectoryUnavailable(_) | GatewayError::QuotaUnavailable(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UnreadableBody => StatusCode::BAD_REQUEST,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingAuthHeader
            | GatewayError::MalformedAuthHeader
            | GatewayError::InvalidToken => "unauthorized",
            GatewayError::TenantUnknown => "tenant_unknown",
            GatewayError::DirectoryUnavailable(_) => "directory_unavailable",
            GatewayError::QuotaExceeded => "quota_exceeded",
            GatewayError::QuotaUnavailable(_) => "quota_unavailable",
            GatewayError::UnreadableBody => "unreadable_body",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::UpstreamUnreachable(_) => "upstream_unreachable",
        }
    }
}

impl From<ProxyError> for GatewayError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Timeout => GatewayError::UpstreamTimeout,
            other => GatewayError::UpstreamUnreachable(other.to_string()),
        }
    }
}
