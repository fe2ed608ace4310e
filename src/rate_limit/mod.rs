//! Fixed-window rate limiting.
//!
//! Requests are matched to a policy by exact path, then by the most specific
//! `*` pattern, then by the default policy. Counters are keyed by route
//! namespace and client identity, inside one limiter per distinct policy.

mod config;
mod limiter;
mod middleware;
mod policy;

pub use self::config::{DEFAULT_POLICY, RateLimitConfig, default_exempt_paths, default_routes};
pub use limiter::{Decision, FixedWindowLimiter};
pub use middleware::{
    RATELIMIT_LIMIT, RATELIMIT_REMAINING, RATELIMIT_RESET, RateLimiter, UNKNOWN_CLIENT, Verdict,
    client_identity, rate_limit_layer,
};
pub use policy::{
    DEFAULT_NAMESPACE, InvalidPattern, RateLimitPolicy, ResolvedRoute, RouteRule, RouteTable,
};
