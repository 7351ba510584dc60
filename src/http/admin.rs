//! Admin surface: tenant CRUD, credential rotation, analytics, and cache
//! stats. Protected by a static bearer token when one is configured.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::RngCore;
use serde::Deserialize;
use time::format_description::FormatItem;
use time::macros::format_description;

use super::{error_response, AppState, ErrorResponse};
use crate::sqlite_store::{CacheStats, NewTenant, Tenant, TenantAnalytics, TenantUpdate};

const DEFAULT_RATE_LIMIT_PER_HOUR: i64 = 1000;

type AdminError = (StatusCode, Json<ErrorResponse>);

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/tenants", get(list_tenants).post(create_tenant))
        .route(
            "/admin/tenants/:id",
            get(get_tenant).put(update_tenant).delete(delete_tenant),
        )
        .route("/admin/tenants/:id/rotate-key", post(rotate_key))
        .route("/admin/tenants/:id/analytics", get(tenant_analytics))
        .route("/admin/cache/stats", get(cache_stats))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AdminError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Invalid admin token",
        ))
    }
}

fn store_error(err: impl std::fmt::Display) -> AdminError {
    tracing::error!(error = %err, "admin store operation failed");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "store_unavailable",
        "Store operation failed",
    )
}

fn not_found() -> AdminError {
    error_response(StatusCode::NOT_FOUND, "tenant_unknown", "Tenant not found")
}

#[derive(Debug, Deserialize)]
struct CreateTenantRequest {
    name: String,
    backend_url: String,
    #[serde(default)]
    rate_limit_per_hour: Option<i64>,
}

async fn create_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateTenantRequest>,
) -> Result<(StatusCode, Json<Tenant>), AdminError> {
    require_admin(&state, &headers)?;
    if payload.name.is_empty() || payload.backend_url.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "name and backend_url are required",
        ));
    }
    let rate_limit_per_hour = match payload.rate_limit_per_hour {
        Some(limit) if limit > 0 => limit,
        _ => DEFAULT_RATE_LIMIT_PER_HOUR,
    };

    let tenant = state
        .store
        .create_tenant(NewTenant {
            name: payload.name,
            api_key: generate_api_key(),
            rate_limit_per_hour,
            backend_url: payload.backend_url,
        })
        .await
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

async fn list_tenants(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Tenant>>, AdminError> {
    require_admin(&state, &headers)?;
    let tenants = state.store.list_tenants().await.map_err(store_error)?;
    Ok(Json(tenants))
}

async fn get_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Tenant>, AdminError> {
    require_admin(&state, &headers)?;
    state
        .store
        .tenant_by_id(id)
        .await
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(not_found)
}

async fn update_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(update): Json<TenantUpdate>,
) -> Result<Json<serde_json::Value>, AdminError> {
    require_admin(&state, &headers)?;
    let found = state
        .store
        .update_tenant(id, update)
        .await
        .map_err(store_error)?;
    if !found {
        return Err(not_found());
    }
    Ok(Json(serde_json::json!({"status": "updated"})))
}

async fn delete_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, AdminError> {
    require_admin(&state, &headers)?;
    let found = state.store.delete_tenant(id).await.map_err(store_error)?;
    if !found {
        return Err(not_found());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn rotate_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AdminError> {
    require_admin(&state, &headers)?;
    let new_api_key = generate_api_key();
    let found = state
        .store
        .rotate_api_key(id, &new_api_key)
        .await
        .map_err(store_error)?;
    if !found {
        return Err(not_found());
    }
    Ok(Json(serde_json::json!({
        "api_key": new_api_key,
        "status": "rotated",
    })))
}

#[derive(Debug, Deserialize)]
struct AnalyticsQuery {
    from: Option<String>,
    to: Option<String>,
}

async fn tenant_analytics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<TenantAnalytics>, AdminError> {
    require_admin(&state, &headers)?;
    let now_ms = state.clock.now_epoch_seconds() as i64 * 1000;

    let from_ms = match query.from.as_deref() {
        Some(raw) => parse_date_ms(raw).ok_or_else(|| invalid_date(raw))?,
        None => now_ms - 7 * 24 * 60 * 60 * 1000,
    };
    let to_ms = match query.to.as_deref() {
        // Inclusive end of day.
        Some(raw) => parse_date_ms(raw).ok_or_else(|| invalid_date(raw))? + 86_400_000 - 1,
        None => now_ms,
    };

    let analytics = state
        .store
        .tenant_analytics(id, from_ms, to_ms)
        .await
        .map_err(store_error)?;
    Ok(Json(analytics))
}

async fn cache_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CacheStats>, AdminError> {
    require_admin(&state, &headers)?;
    let stats = state.store.cache_stats().await.map_err(store_error)?;
    Ok(Json(stats))
}

fn invalid_date(raw: &str) -> AdminError {
    error_response(
        StatusCode::BAD_REQUEST,
        "invalid_request",
        format!("invalid date: {raw}"),
    )
}

fn parse_date_ms(raw: &str) -> Option<i64> {
    const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year]-[month]-[day]");
    let date = time::Date::parse(raw, DATE_FORMAT).ok()?;
    Some(date.midnight().assume_utc().unix_timestamp() * 1000)
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    crate::semantic_cache::hex_encode(&bytes)
}
