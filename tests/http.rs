use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use voxgate::{
    cache::{CACHE_STATUS_HEADER, CacheConfig, CacheService},
    infra::http::{AppState, REQUEST_ID_HEADER, build_router},
    rate_limit::{RateLimitConfig, RateLimiter},
};

fn app() -> Router {
    let cache_config = CacheConfig::default();
    let cache = Arc::new(CacheService::from_config(&cache_config));
    let limiter = RateLimiter::new(RateLimitConfig::default()).expect("valid routes");
    build_router(AppState::new(cache, cache_config, limiter))
}

async fn get(app: &Router, uri: &str) -> Response {
    app.clone()
        .oneshot(
            Request::builder()
                .uri(uri)
                .body(Body::empty())
                .expect("request should build"),
        )
        .await
        .expect("router should respond")
}

async fn json(response: Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn health_is_cached_between_calls() {
    let app = app();

    let first = get(&app, "/api/health").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()[CACHE_STATUS_HEADER], "MISS");
    assert!(first.headers().contains_key(REQUEST_ID_HEADER));
    let first_body = json(first).await;
    assert_eq!(first_body["status"], "ok");
    assert_eq!(first_body["cache"], "memory");

    let second = get(&app, "/api/health").await;
    assert_eq!(second.headers()[CACHE_STATUS_HEADER], "HIT");
    assert_eq!(json(second).await, first_body);
}

#[tokio::test]
async fn every_response_gets_a_fresh_request_id() {
    let app = app();

    let a = get(&app, "/health").await;
    let b = get(&app, "/health").await;
    assert_ne!(a.headers()[REQUEST_ID_HEADER], b.headers()[REQUEST_ID_HEADER]);
}

#[tokio::test]
async fn unknown_routes_use_the_error_envelope() {
    let app = app();

    let response = get(&app, "/api/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let request_id = response.headers()[REQUEST_ID_HEADER]
        .to_str()
        .expect("ascii request id")
        .to_string();

    let body = json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert_eq!(body["meta"]["requestId"], request_id.as_str());
}
