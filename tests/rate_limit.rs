use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{Method, Request, StatusCode, header::RETRY_AFTER},
    response::Response,
    routing::{any, get},
};
use http_body_util::BodyExt;
use serde_json::Value;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tower::ServiceExt;
use voxgate::{
    cache::{CacheConfig, CacheService, CacheServiceOptions},
    infra::http::{AppState, REQUEST_ID_HEADER, apply_edge_layers, health},
    rate_limit::{
        RATELIMIT_LIMIT, RATELIMIT_REMAINING, RATELIMIT_RESET, RateLimitConfig, RateLimitPolicy,
        RateLimiter, RouteRule,
    },
};

fn app(config: RateLimitConfig) -> Router {
    let cache = Arc::new(CacheService::in_memory(CacheServiceOptions::default()));
    let cache_config = CacheConfig {
        enabled: false,
        ..CacheConfig::default()
    };
    let limiter = RateLimiter::new(config).expect("valid routes");
    let state = AppState::new(cache, cache_config, limiter);

    let router = Router::new()
        .route("/health", get(health))
        .route("/api/{*rest}", any(|| async { "ok" }))
        .with_state(state.clone());
    apply_edge_layers(router, &state)
}

fn config(default: RateLimitPolicy, routes: Vec<RouteRule>) -> RateLimitConfig {
    RateLimitConfig {
        default_policy: default,
        routes,
        ..RateLimitConfig::default()
    }
}

fn request_from(method: Method, uri: &str, ip: Option<[u8; 4]>) -> Request<Body> {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    if let Some([a, b, c, d]) = ip {
        request.extensions_mut().insert(ConnectInfo(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            40_000,
        )));
    }
    request
}

async fn get_from(app: &Router, uri: &str, ip: [u8; 4]) -> Response {
    app.clone()
        .oneshot(request_from(Method::GET, uri, Some(ip)))
        .await
        .expect("router should respond")
}

fn header<'a>(response: &'a Response, name: &axum::http::HeaderName) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

const CLIENT: [u8; 4] = [192, 0, 2, 10];

#[tokio::test]
async fn sixth_rapid_request_is_rejected_with_envelope() {
    let app = app(config(
        RateLimitPolicy::new(900_000, 100),
        vec![RouteRule::new("/api/leads", RateLimitPolicy::new(60_000, 5))],
    ));

    for expected_remaining in ["4", "3", "2", "1", "0"] {
        let response = get_from(&app, "/api/leads", CLIENT).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, &RATELIMIT_LIMIT), Some("5"));
        assert_eq!(
            header(&response, &RATELIMIT_REMAINING),
            Some(expected_remaining)
        );
    }

    let rejected = get_from(&app, "/api/leads", CLIENT).await;
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&rejected, &RATELIMIT_REMAINING), Some("0"));
    assert_eq!(header(&rejected, &RETRY_AFTER), Some("60"));

    let reset = header(&rejected, &RATELIMIT_RESET).expect("reset header");
    let reset = OffsetDateTime::parse(reset, &Rfc3339).expect("ISO-8601 reset");
    assert!(reset > OffsetDateTime::now_utc());

    let request_id = header(&rejected, &REQUEST_ID_HEADER)
        .expect("request id header")
        .to_string();
    let bytes = rejected
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    let body: Value = serde_json::from_slice(&bytes).expect("json body");
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
    assert!(body["error"]["message"].as_str().is_some());
    assert_eq!(body["meta"]["requestId"], request_id.as_str());
    assert!(body["meta"]["timestamp"].as_str().is_some());
}

#[tokio::test(start_paused = true)]
async fn quota_refills_at_the_window_boundary() {
    let app = app(config(RateLimitPolicy::new(1_000, 3), Vec::new()));

    for _ in 0..3 {
        assert_eq!(
            get_from(&app, "/api/agents", CLIENT).await.status(),
            StatusCode::OK
        );
    }
    tokio::time::advance(Duration::from_millis(500)).await;
    assert_eq!(
        get_from(&app, "/api/agents", CLIENT).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    tokio::time::advance(Duration::from_millis(500)).await;
    let fresh = get_from(&app, "/api/agents", CLIENT).await;
    assert_eq!(fresh.status(), StatusCode::OK);
    assert_eq!(header(&fresh, &RATELIMIT_REMAINING), Some("2"));
}

#[tokio::test]
async fn exact_route_overrides_wildcard() {
    let app = app(config(
        RateLimitPolicy::new(60_000, 100),
        vec![
            RouteRule::new("/api/*", RateLimitPolicy::new(60_000, 1)),
            RouteRule::new("/api/agents", RateLimitPolicy::new(60_000, 3)),
        ],
    ));

    for _ in 0..3 {
        let response = get_from(&app, "/api/agents", CLIENT).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, &RATELIMIT_LIMIT), Some("3"));
    }

    let first = get_from(&app, "/api/other", CLIENT).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header(&first, &RATELIMIT_LIMIT), Some("1"));
    assert_eq!(
        get_from(&app, "/api/other", CLIENT).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn preflight_and_health_checks_are_not_counted() {
    let app = app(config(RateLimitPolicy::new(60_000, 1), Vec::new()));

    for _ in 0..3 {
        let preflight = app
            .clone()
            .oneshot(request_from(Method::OPTIONS, "/api/leads", Some(CLIENT)))
            .await
            .expect("router should respond");
        assert_ne!(preflight.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&preflight, &RATELIMIT_LIMIT), None);

        let health = get_from(&app, "/health", CLIENT).await;
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(header(&health, &RATELIMIT_LIMIT), None);
    }

    assert_eq!(
        get_from(&app, "/api/leads", CLIENT).await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn clients_have_separate_quotas() {
    let app = app(config(RateLimitPolicy::new(60_000, 1), Vec::new()));

    assert_eq!(
        get_from(&app, "/api/leads", [10, 0, 0, 1]).await.status(),
        StatusCode::OK
    );
    assert_eq!(
        get_from(&app, "/api/leads", [10, 0, 0, 2]).await.status(),
        StatusCode::OK
    );
    assert_eq!(
        get_from(&app, "/api/leads", [10, 0, 0, 1]).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn requests_without_peer_address_share_one_bucket() {
    let app = app(config(RateLimitPolicy::new(60_000, 1), Vec::new()));

    let first = app
        .clone()
        .oneshot(request_from(Method::GET, "/api/leads", None))
        .await
        .expect("router should respond");
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .clone()
        .oneshot(request_from(Method::GET, "/api/leads", None))
        .await
        .expect("router should respond");
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn forwarded_for_is_used_only_when_trusted() {
    let trusted = app(RateLimitConfig {
        trust_forwarded_for: true,
        ..config(RateLimitPolicy::new(60_000, 1), Vec::new())
    });

    for hop in ["203.0.113.1", "203.0.113.2"] {
        let mut request = request_from(Method::GET, "/api/leads", Some(CLIENT));
        request
            .headers_mut()
            .insert("x-forwarded-for", hop.parse().expect("header value"));
        let response = trusted
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn disabled_limiter_passes_everything() {
    let app = app(RateLimitConfig {
        enabled: false,
        ..config(RateLimitPolicy::new(60_000, 1), Vec::new())
    });

    for _ in 0..3 {
        let response = get_from(&app, "/api/leads", CLIENT).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, &RATELIMIT_LIMIT), None);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_requests_never_exceed_the_quota() {
    let limiter = RateLimiter::new(config(
        RateLimitPolicy::new(900_000, 100),
        vec![RouteRule::new("/api/leads", RateLimitPolicy::new(60_000, 5))],
    ))
    .expect("valid routes");

    let tasks: Vec<_> = (0..200)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .check("/api/leads", "203.0.113.7")
                    .decision
                    .allowed
            })
        })
        .collect();

    let mut allowed = 0;
    for task in tasks {
        if task.await.expect("task should not panic") {
            allowed += 1;
        }
    }

    assert_eq!(allowed, 5);
    assert_eq!(limiter.limiter_count(), 1);
}
