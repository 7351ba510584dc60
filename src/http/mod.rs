//! HTTP surface: health, token exchange, the `/api/*` pipeline, and the
//! admin routes.

mod admin;
mod pipeline;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::access_log::AccessLogSink;
use crate::auth::TokenService;
use crate::clock::Clock;
use crate::embedding::Embedder;
use crate::error::GatewayError;
use crate::proxy::UpstreamProxy;
use crate::ratelimit::QuotaEnforcer;
use crate::semantic_cache::SemanticCache;
use crate::sqlite_store::SqliteStore;
use crate::tenants::TenantDirectory;
use crate::volatile::VolatileStore;

#[derive(Clone)]
pub struct AppState {
    pub(crate) store: SqliteStore,
    pub(crate) tenants: Arc<TenantDirectory>,
    pub(crate) quota: Arc<QuotaEnforcer>,
    pub(crate) cache: Arc<SemanticCache>,
    pub(crate) proxy: Arc<UpstreamProxy>,
    pub(crate) access_log: AccessLogSink,
    pub(crate) tokens: Arc<TokenService>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) admin_token: Option<String>,
}

impl AppState {
    pub fn new(
        store: SqliteStore,
        volatile: Arc<dyn VolatileStore>,
        embedder: Arc<dyn Embedder>,
        proxy: UpstreamProxy,
        tokens: TokenService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tenants: Arc::new(TenantDirectory::new(store.clone(), clock.clone())),
            quota: Arc::new(QuotaEnforcer::new(volatile.clone(), clock.clone())),
            cache: Arc::new(SemanticCache::new(store.clone(), volatile, embedder)),
            access_log: AccessLogSink::new(store.clone()),
            proxy: Arc::new(proxy),
            tokens: Arc::new(tokens),
            clock,
            store,
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/token", post(issue_token))
        .route("/api", any(pipeline::handle))
        .route("/api/*path", any(pipeline::handle))
        .merge(admin::router())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    error: ErrorDetail,
}

pub(crate) fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
}

pub(crate) fn gateway_error_response(err: &GatewayError) -> (StatusCode, Json<ErrorResponse>) {
    error_response(err.status(), err.code(), err.to_string())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy", "version": "1.0.0"}))
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    api_key: String,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
}

async fn issue_token(
    State(state): State<AppState>,
    Json(payload): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, (StatusCode, Json<ErrorResponse>)> {
    let tenant = state
        .store
        .tenant_by_api_key(&payload.api_key)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "tenant lookup failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_unavailable",
                "Failed to look up tenant",
            )
        })?
        .ok_or_else(|| {
            error_response(StatusCode::UNAUTHORIZED, "unauthorized", "Invalid API key")
        })?;

    let token = state
        .tokens
        .issue(tenant.id, &tenant.api_key)
        .map_err(|err| {
            tracing::error!(error = %err, "token issuing failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "token_error",
                "Failed to generate token",
            )
        })?;
    Ok(Json(TokenResponse { token }))
}
