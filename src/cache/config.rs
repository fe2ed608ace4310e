//! Cache configuration.
//!
//! Built from the `[cache]` section of `voxgate.toml` by the config layer.

use std::num::NonZeroU64;
use std::time::Duration;

use axum::http::Method;

const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DEGRADED_BACKOFF_MS: u64 = 5_000;
const DEFAULT_SWEEP_INTERVAL: u64 = 1_000;
const DEFAULT_TTL_SECS: u64 = 300;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
pub const DEFAULT_KEY_PREFIX: &str = "http:cache:";

/// TTL and vary headers for one exact path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRoute {
    pub path: String,
    pub ttl: Duration,
    /// Request headers folded into the cache key.
    pub vary: Vec<String>,
}

impl CacheRoute {
    pub fn new(path: impl Into<String>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            vary: Vec::new(),
        }
    }

    pub fn with_vary(mut self, headers: &[&str]) -> Self {
        self.vary = headers.iter().map(|h| h.to_ascii_lowercase()).collect();
        self
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Enable the HTTP response cache middleware.
    pub enabled: bool,
    /// Networked store; `None` keeps the service in memory-only mode.
    pub redis_url: Option<String>,
    /// Upper bound for any single networked-store call.
    pub operation_timeout: Duration,
    /// Upper bound for one background connection attempt.
    pub connect_timeout: Duration,
    /// How long a failing networked store is bypassed before it is tried again.
    pub degraded_backoff: Duration,
    /// Run an expiry sweep of the in-process store every N writes.
    pub sweep_interval: NonZeroU64,
    /// Prefix for every response-cache key.
    pub key_prefix: String,
    /// TTL for cacheable paths without an exact route entry.
    pub default_ttl: Duration,
    /// Responses larger than this are passed through uncached.
    pub max_body_bytes: usize,
    /// Paths eligible for response caching.
    pub cacheable_prefixes: Vec<String>,
    pub routes: Vec<CacheRoute>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            degraded_backoff: Duration::from_millis(DEFAULT_DEGRADED_BACKOFF_MS),
            sweep_interval: NonZeroU64::new(DEFAULT_SWEEP_INTERVAL).unwrap_or(NonZeroU64::MIN),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            cacheable_prefixes: default_cacheable_prefixes(),
            routes: default_routes(),
        }
    }
}

pub fn default_cacheable_prefixes() -> Vec<String> {
    ["/health", "/api/health", "/api/elevenlabs/voices"]
        .into_iter()
        .map(String::from)
        .collect()
}

pub fn default_routes() -> Vec<CacheRoute> {
    vec![
        CacheRoute::new("/api/elevenlabs/voices", Duration::from_secs(3600)),
        CacheRoute::new("/api/health", Duration::from_secs(60)),
        CacheRoute::new("/health", Duration::from_secs(60)),
    ]
}

impl CacheConfig {
    /// Only GET requests under an allow-listed prefix are cached.
    pub fn is_cacheable(&self, method: &Method, path: &str) -> bool {
        *method == Method::GET
            && self
                .cacheable_prefixes
                .iter()
                .any(|prefix| matches_prefix(prefix, path))
    }

    pub fn route(&self, path: &str) -> Option<&CacheRoute> {
        self.routes.iter().find(|route| route.path == path)
    }

    pub fn ttl_for(&self, path: &str) -> Duration {
        self.route(path)
            .map(|route| route.ttl)
            .unwrap_or(self.default_ttl)
    }

    pub fn vary_for(&self, path: &str) -> &[String] {
        self.route(path)
            .map(|route| route.vary.as_slice())
            .unwrap_or(&[])
    }
}

/// Segment-aware prefix test: `/api/health` covers `/api/health/db` but not
/// `/api/healthz`.
fn matches_prefix(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}
