//! HTTP response cache middleware.
//!
//! Serves allow-listed GET routes from the cache service. A hit either
//! replays the stored response or, when the client already holds the current
//! ETag, answers 304. A miss runs the handler, buffers a successful body and
//! stores it together with its headers and a content hash.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{
        HeaderMap, HeaderName, HeaderValue, Request, StatusCode,
        header::{CACHE_CONTROL, CONTENT_LENGTH, ETAG, IF_NONE_MATCH, SET_COOKIE},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use super::{CacheConfig, CacheService, keys::response_key};
use crate::infra::telemetry;

pub const CACHE_STATUS_HEADER: &str = "x-cache";

/// Response persisted under a response-cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedHttpResponse {
    #[serde(default = "default_status")]
    pub status: u16,
    pub body: String,
    pub etag: String,
    /// Lower-cased header names as set by the origin handler.
    pub headers: BTreeMap<String, String>,
}

fn default_status() -> u16 {
    StatusCode::OK.as_u16()
}

/// Shared state for the response cache layer.
#[derive(Clone)]
pub struct ResponseCache {
    pub config: Arc<CacheConfig>,
    pub service: Arc<CacheService>,
}

impl ResponseCache {
    pub fn new(config: Arc<CacheConfig>, service: Arc<CacheService>) -> Self {
        Self { config, service }
    }

    /// Invalidate cached responses whose key, minus the response-cache
    /// prefix, matches `pattern` (e.g. `GET:/api/elevenlabs/*`).
    pub async fn purge(&self, pattern: &str) {
        let pattern = format!("{}{pattern}", self.config.key_prefix);
        self.service.invalidate(&pattern).await;
    }
}

/// Strong ETag: quoted hex SHA-256 of the body.
pub fn compute_etag(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("\"{}\"", hex::encode(hasher.finalize().to_vec()))
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<ResponseCache>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if !cache.config.is_cacheable(request.method(), &path) {
        return next.run(request).await;
    }

    let key = response_key(
        &cache.config.key_prefix,
        request.method(),
        &path,
        request.uri().query(),
        request.headers(),
        cache.config.vary_for(&path),
    );
    let ttl = cache.config.ttl_for(&path);

    if let Some(cached) = cache.service.get::<CachedHttpResponse>(&key).await {
        let conditional = request
            .headers()
            .get(IF_NONE_MATCH)
            .and_then(|value| value.to_str().ok());

        if conditional.is_some_and(|value| etag_matches(value, &cached.etag)) {
            counter!(telemetry::CACHE_NOT_MODIFIED).increment(1);
            debug!(cache = "response", outcome = "not_modified", "etag matched");
            return not_modified(&cached.etag, ttl);
        }

        counter!(telemetry::CACHE_HIT).increment(1);
        debug!(cache = "response", outcome = "hit", "serving cached response");
        return replay(cached, ttl);
    }

    counter!(telemetry::CACHE_MISS).increment(1);
    debug!(
        cache = "response",
        outcome = "miss",
        "cache miss, executing handler"
    );

    let response = next.run(request).await;
    if !response.status().is_success() || forbids_storing(response.headers()) {
        return response;
    }

    let within_limit = response
        .body()
        .size_hint()
        .upper()
        .is_some_and(|upper| upper <= cache.config.max_body_bytes as u64);
    if !within_limit {
        debug!(cache = "response", "body too large or unbounded, not caching");
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, cache.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(cache = "response", error = %err, "failed to buffer response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let text = match String::from_utf8(bytes.to_vec()) {
        Ok(text) if !text.is_empty() => text,
        _ => return Response::from_parts(parts, Body::from(bytes)),
    };

    let etag = compute_etag(&bytes);
    let entry = CachedHttpResponse {
        status: parts.status.as_u16(),
        body: text,
        etag: etag.clone(),
        headers: capture_headers(&parts.headers),
    };
    cache.service.set(&key, &entry, Some(ttl)).await;

    annotate(&mut parts.headers, &etag, ttl);
    insert_header(&mut parts.headers, CACHE_STATUS_HEADER, "MISS");
    Response::from_parts(parts, Body::from(bytes))
}

/// `If-None-Match` may carry `*` or a comma-separated list, optionally weak.
fn etag_matches(header: &str, etag: &str) -> bool {
    header.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate == etag || candidate.strip_prefix("W/") == Some(etag)
    })
}

fn forbids_storing(headers: &HeaderMap) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| {
            let value = value.to_ascii_lowercase();
            value.contains("no-store") || value.contains("private")
        })
}

fn capture_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut captured: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        if *name == CONTENT_LENGTH || *name == SET_COOKIE {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        captured
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    captured
}

fn replay(cached: CachedHttpResponse, ttl: Duration) -> Response {
    let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
    let mut response = Response::new(Body::from(cached.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &cached.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    annotate(headers, &cached.etag, ttl);
    insert_header(headers, CACHE_STATUS_HEADER, "HIT");
    response
}

fn not_modified(etag: &str, ttl: Duration) -> Response {
    let mut response = StatusCode::NOT_MODIFIED.into_response();
    annotate(response.headers_mut(), etag, ttl);
    response
}

fn annotate(headers: &mut HeaderMap, etag: &str, ttl: Duration) {
    if let Ok(value) = HeaderValue::from_str(etag) {
        headers.insert(ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={}", ttl.as_secs())) {
        headers.insert(CACHE_CONTROL, value);
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &'static str) {
    headers.insert(
        HeaderName::from_static(name),
        HeaderValue::from_static(value),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bodies_share_an_etag() {
        let a = compute_etag(br#"{"status":"ok"}"#);
        let b = compute_etag(br#"{"status":"ok"}"#);
        let c = compute_etag(br#"{"status":"degraded"}"#);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with('"') && a.ends_with('"'));
        assert_eq!(a.len(), 64 + 2);
    }

    #[test]
    fn conditional_header_matching() {
        let etag = "\"abc\"";
        assert!(etag_matches("\"abc\"", etag));
        assert!(etag_matches("W/\"abc\"", etag));
        assert!(etag_matches("\"x\", \"abc\"", etag));
        assert!(etag_matches("*", etag));
        assert!(!etag_matches("\"abd\"", etag));
        assert!(!etag_matches("abc", etag));
    }

    #[test]
    fn captured_headers_skip_length_and_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("15"));
        headers.insert(SET_COOKIE, HeaderValue::from_static("sid=1"));
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));

        let captured = capture_headers(&headers);
        assert_eq!(captured.len(), 2);
        assert_eq!(captured["content-type"], "application/json");
        assert_eq!(captured["x-tag"], "a, b");
    }

    #[test]
    fn private_responses_are_not_stored() {
        let mut headers = HeaderMap::new();
        assert!(!forbids_storing(&headers));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("private, max-age=0"));
        assert!(forbids_storing(&headers));
    }

    #[test]
    fn replay_restores_status_headers_and_body() {
        let cached = CachedHttpResponse {
            status: 203,
            body: "hello".to_string(),
            etag: compute_etag(b"hello"),
            headers: BTreeMap::from([("content-type".to_string(), "text/plain".to_string())]),
        };

        let response = replay(cached.clone(), Duration::from_secs(60));
        assert_eq!(response.status(), StatusCode::NON_AUTHORITATIVE_INFORMATION);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(response.headers()[ETAG], cached.etag.as_str());
        assert_eq!(response.headers()[CACHE_CONTROL], "public, max-age=60");
        assert_eq!(response.headers()[CACHE_STATUS_HEADER], "HIT");
    }

    #[test]
    fn entries_without_status_default_to_ok() {
        let entry: CachedHttpResponse =
            serde_json::from_str(r#"{"body":"x","etag":"\"e\"","headers":{}}"#).unwrap();
        assert_eq!(entry.status, 200);
    }
}
