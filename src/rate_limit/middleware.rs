//! Per-route rate limiting for the HTTP edge.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, header::RETRY_AFTER},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use super::config::RateLimitConfig;
use super::limiter::{Decision, FixedWindowLimiter};
use super::policy::{InvalidPattern, RateLimitPolicy, ResolvedRoute, RouteTable};
use crate::infra::http::{ApiError, RequestContext, rfc3339};
use crate::infra::telemetry;

const SOURCE: &str = "voxgate::rate_limit";
pub const UNKNOWN_CLIENT: &str = "unknown";

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

const FORWARDED_FOR: &str = "x-forwarded-for";

struct Inner {
    config: RateLimitConfig,
    routes: RouteTable,
    /// One limiter per distinct policy, created on first use.
    limiters: DashMap<RateLimitPolicy, Arc<FixedWindowLimiter>>,
}

/// Shared rate limiter state; cheap to clone into the middleware.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

/// Result of counting one request, with the route it was counted under.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub route: ResolvedRoute,
    pub decision: Decision,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, InvalidPattern> {
        let routes = RouteTable::compile(&config.routes, config.default_policy)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                routes,
                limiters: DashMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Preflight requests and health probes are never counted.
    pub fn is_exempt(&self, method: &Method, path: &str) -> bool {
        *method == Method::OPTIONS || self.inner.config.is_exempt_path(path)
    }

    pub fn resolve(&self, path: &str) -> ResolvedRoute {
        self.inner.routes.resolve(path)
    }

    fn limiter_for(&self, policy: RateLimitPolicy) -> Arc<FixedWindowLimiter> {
        if let Some(existing) = self.inner.limiters.get(&policy) {
            return Arc::clone(existing.value());
        }
        let gc_interval = self.inner.config.gc_interval.get();
        self.inner
            .limiters
            .entry(policy)
            .or_insert_with(|| Arc::new(FixedWindowLimiter::new(policy, gc_interval)))
            .value()
            .clone()
    }

    /// Count one request from `client` against the policy governing `path`.
    pub fn check(&self, path: &str, client: &str) -> Verdict {
        let route = self.resolve(path);
        let limiter = self.limiter_for(route.policy);
        let decision = limiter.check(&format!("{}:{client}", route.namespace));
        Verdict { route, decision }
    }

    /// Number of limiter instances materialized so far.
    pub fn limiter_count(&self) -> usize {
        self.inner.limiters.len()
    }
}

/// Caller identity: the peer address, or the first forwarded hop when the
/// proxy is trusted. Requests without either share the `unknown` bucket.
pub fn client_identity<B>(request: &Request<B>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for
        && let Some(forwarded) = first_forwarded_hop(request.headers())
    {
        return forwarded;
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn first_forwarded_hop(headers: &HeaderMap) -> Option<String> {
    headers
        .get(FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .map(str::trim)
        .find(|hop| !hop.is_empty())
        .map(str::to_string)
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn rate_limit_layer(
    State(limiter): State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !limiter.is_enabled() || limiter.is_exempt(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    let client = client_identity(&request, limiter.config().trust_forwarded_for);
    let verdict = limiter.check(request.uri().path(), &client);
    let Verdict { route, decision } = &verdict;

    if !decision.allowed {
        counter!(telemetry::RATE_LIMIT_REJECTED).increment(1);
        warn!(
            target: SOURCE,
            client = %client,
            namespace = %route.namespace,
            window_ms = route.policy.window_ms,
            max = route.policy.max,
            "rate limit exceeded"
        );

        let mut response = ApiError::rate_limited()
            .with_request_id(RequestContext::request_id_of(&request))
            .with_detail(format!("client={client} namespace={}", route.namespace))
            .into_response();
        let headers = response.headers_mut();
        apply_headers(headers, route.policy, decision);
        if let Ok(value) = HeaderValue::from_str(&decision.retry_after_secs().to_string()) {
            headers.insert(RETRY_AFTER, value);
        }
        return response;
    }

    counter!(telemetry::RATE_LIMIT_ALLOWED).increment(1);
    debug!(
        target: SOURCE,
        client = %client,
        namespace = %route.namespace,
        remaining = decision.remaining,
        "request admitted"
    );

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), route.policy, decision);
    response
}

fn apply_headers(headers: &mut HeaderMap, policy: RateLimitPolicy, decision: &Decision) {
    headers.insert(RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));

    let reset = OffsetDateTime::now_utc() + policy.window();
    if let Ok(value) = HeaderValue::from_str(&rfc3339(reset)) {
        headers.insert(RATELIMIT_RESET, value);
    }
}
