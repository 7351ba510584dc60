mod support;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;

use support::{body_string, test_app_with, fast_proxy_config, StubEmbedder, TestApp};

const ADMIN_TOKEN: &str = "admin-secret";

async fn admin_app() -> TestApp {
    test_app_with(
        Arc::new(StubEmbedder::new()),
        fast_proxy_config(),
        None,
        Some(ADMIN_TOKEN),
    )
    .await
}

fn admin_request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {ADMIN_TOKEN}"))
        .header("content-type", "application/json");
    match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn admin_routes_require_the_configured_token() {
    let app = admin_app().await;

    let unauthenticated = Request::builder()
        .uri("/admin/tenants")
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        app.request(unauthenticated).await.status(),
        StatusCode::UNAUTHORIZED
    );

    let wrong_token = Request::builder()
        .uri("/admin/tenants")
        .header("authorization", "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        app.request(wrong_token).await.status(),
        StatusCode::UNAUTHORIZED
    );

    let authorized = admin_request("GET", "/admin/tenants", None);
    assert_eq!(app.request(authorized).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn tenant_crud_lifecycle() {
    let app = admin_app().await;

    // Create with a defaulted quota.
    let response = app
        .request(admin_request(
            "POST",
            "/admin/tenants",
            Some(json!({"name": "acme", "backend_url": "http://localhost:9000"})),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: serde_json::Value =
        serde_json::from_str(&body_string(response).await).unwrap();
    let id = created["id"].as_i64().unwrap();
    assert_eq!(created["rate_limit_per_hour"], 1000);
    let api_key = created["api_key"].as_str().unwrap().to_string();
    assert_eq!(api_key.len(), 64);

    // Get and list.
    let response = app
        .request(admin_request("GET", &format!("/admin/tenants/{id}"), None))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.request(admin_request("GET", "/admin/tenants", None)).await;
    let listed: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    // Partial update.
    let response = app
        .request(admin_request(
            "PUT",
            &format!("/admin/tenants/{id}"),
            Some(json!({"rate_limit_per_hour": 5})),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let tenant = app.store.tenant_by_id(id).await.unwrap().unwrap();
    assert_eq!(tenant.rate_limit_per_hour, 5);
    assert_eq!(tenant.name, "acme");

    // Rotate replaces the credential atomically.
    let response = app
        .request(admin_request(
            "POST",
            &format!("/admin/tenants/{id}/rotate-key"),
            None,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let rotated: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    let new_key = rotated["api_key"].as_str().unwrap();
    assert_ne!(new_key, api_key);
    assert!(app.store.tenant_by_api_key(&api_key).await.unwrap().is_none());
    assert!(app.store.tenant_by_api_key(new_key).await.unwrap().is_some());

    // Delete.
    let response = app
        .request(admin_request("DELETE", &format!("/admin/tenants/{id}"), None))
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = app
        .request(admin_request("GET", &format!("/admin/tenants/{id}"), None))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn create_rejects_incomplete_payloads() {
    let app = admin_app().await;
    let response = app
        .request(admin_request(
            "POST",
            "/admin/tenants",
            Some(json!({"name": "", "backend_url": ""})),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn analytics_and_cache_stats_report_activity() {
    let app = admin_app().await;
    let tenant = app.create_tenant("key-1", "http://localhost:9000", 1000).await;

    app.store
        .append_access_log(semgate::AccessLogRecord {
            tenant_id: tenant.id,
            endpoint: "/api/llm".to_string(),
            method: "POST".to_string(),
            status_code: 200,
            response_time_ms: 15,
            request_size: 100,
            response_size: 200,
        })
        .await
        .unwrap();
    app.store
        .upsert_cache_entry(tenant.id, "hash-a", "prompt", "response")
        .await
        .unwrap();
    app.store.fetch_cache_entry(tenant.id, "hash-a").await.unwrap();

    // Rows are stamped with the wall clock, so query an explicit wide window.
    let response = app
        .request(admin_request(
            "GET",
            &format!(
                "/admin/tenants/{}/analytics?from=1970-01-01&to=9999-12-31",
                tenant.id
            ),
            None,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let analytics: serde_json::Value =
        serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(analytics["total_requests"], 1);
    assert_eq!(analytics["success_count"], 1);
    assert_eq!(analytics["success_rate"], 100.0);

    let response = app
        .request(admin_request("GET", "/admin/cache/stats", None))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let stats: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(stats["total_entries"], 1);
    assert_eq!(stats["total_hits"], 1);
    assert_eq!(stats["avg_hits_per_entry"], 1.0);

    let response = app
        .request(admin_request(
            "GET",
            &format!("/admin/tenants/{}/analytics?from=bogus", tenant.id),
            None,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
