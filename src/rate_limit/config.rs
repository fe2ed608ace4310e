//! Rate limiter configuration, built from the `[rate_limit]` section.

use std::num::NonZeroU64;

use super::policy::{RateLimitPolicy, RouteRule};

pub const DEFAULT_POLICY: RateLimitPolicy = RateLimitPolicy::new(15 * 60 * 1_000, 100);
const DEFAULT_GC_INTERVAL: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Applied when no route rule matches.
    pub default_policy: RateLimitPolicy,
    /// Ordered rules; exact paths and `*` patterns.
    pub routes: Vec<RouteRule>,
    /// Paths never counted (health probes).
    pub exempt_paths: Vec<String>,
    /// Use the first `X-Forwarded-For` entry as client identity.
    pub trust_forwarded_for: bool,
    /// Drop stale windows every N checks per limiter.
    pub gc_interval: NonZeroU64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_policy: DEFAULT_POLICY,
            routes: default_routes(),
            exempt_paths: default_exempt_paths(),
            trust_forwarded_for: false,
            gc_interval: NonZeroU64::new(DEFAULT_GC_INTERVAL).unwrap_or(NonZeroU64::MIN),
        }
    }
}

pub fn default_routes() -> Vec<RouteRule> {
    vec![
        RouteRule::new("/api/leads", RateLimitPolicy::new(60_000, 5)),
        RouteRule::new("/api/knowledge/*", RateLimitPolicy::new(60 * 60 * 1_000, 60)),
    ]
}

pub fn default_exempt_paths() -> Vec<String> {
    ["/health", "/api/health"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl RateLimitConfig {
    pub fn is_exempt_path(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|exempt| exempt == path)
    }
}
