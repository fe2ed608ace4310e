//! Route → policy resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::Glob;

/// Fixed-window quota: at most `max` requests per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub window_ms: u64,
    pub max: u32,
}

impl RateLimitPolicy {
    pub const fn new(window_ms: u64, max: u32) -> Self {
        Self { window_ms, max }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// One configured route entry. Patterns without `*` match exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub pattern: String,
    pub policy: RateLimitPolicy,
    /// Rules naming the same bucket share counters.
    pub bucket: Option<String>,
}

impl RouteRule {
    pub fn new(pattern: impl Into<String>, policy: RateLimitPolicy) -> Self {
        Self {
            pattern: pattern.into(),
            policy,
            bucket: None,
        }
    }

    pub fn shared(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    fn namespace(&self) -> Arc<str> {
        Arc::from(self.bucket.as_deref().unwrap_or(&self.pattern))
    }
}

#[derive(Debug, Clone)]
struct Target {
    namespace: Arc<str>,
    policy: RateLimitPolicy,
}

/// Policy picked for a path plus the counter namespace it is counted under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub namespace: Arc<str>,
    pub policy: RateLimitPolicy,
}

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Error)]
#[error("invalid route pattern `{pattern}`")]
pub struct InvalidPattern {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// Route rules compiled once at startup.
#[derive(Debug, Clone)]
pub struct RouteTable {
    exact: HashMap<String, Target>,
    /// Ordered by wildcard count; registration order breaks ties.
    wildcards: Vec<(Glob, Target)>,
    fallback: Target,
}

impl RouteTable {
    pub fn compile(rules: &[RouteRule], default: RateLimitPolicy) -> Result<Self, InvalidPattern> {
        let mut exact = HashMap::new();
        let mut wildcards = Vec::new();

        for rule in rules {
            let target = Target {
                namespace: rule.namespace(),
                policy: rule.policy,
            };
            let glob = Glob::new(&rule.pattern).map_err(|source| InvalidPattern {
                pattern: rule.pattern.clone(),
                source,
            })?;
            if glob.has_wildcard() {
                wildcards.push((glob, target));
            } else {
                // First registration of an exact path wins.
                exact.entry(rule.pattern.clone()).or_insert(target);
            }
        }

        wildcards.sort_by_key(|(glob, _)| glob.wildcard_count());

        Ok(Self {
            exact,
            wildcards,
            fallback: Target {
                namespace: Arc::from(DEFAULT_NAMESPACE),
                policy: default,
            },
        })
    }

    pub fn resolve(&self, path: &str) -> ResolvedRoute {
        let target = self
            .exact
            .get(path)
            .or_else(|| {
                self.wildcards
                    .iter()
                    .find(|(glob, _)| glob.is_match(path))
                    .map(|(_, target)| target)
            })
            .unwrap_or(&self.fallback);

        ResolvedRoute {
            namespace: Arc::clone(&target.namespace),
            policy: target.policy,
        }
    }

    pub fn default_policy(&self) -> RateLimitPolicy {
        self.fallback.policy
    }
}
