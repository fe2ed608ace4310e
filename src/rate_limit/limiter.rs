use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::policy::RateLimitPolicy;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Outcome of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the current window closes.
    pub reset_after: Duration,
}

impl Decision {
    /// Whole seconds until the window closes, at least one.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        let rounded = if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        rounded.max(1)
    }
}

/// Fixed-window counters for one policy, keyed by `{namespace}:{client}`.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    policy: RateLimitPolicy,
    windows: DashMap<String, Window>,
    checks: AtomicU64,
    gc_interval: u64,
}

impl FixedWindowLimiter {
    pub fn new(policy: RateLimitPolicy, gc_interval: u64) -> Self {
        Self {
            policy,
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
            gc_interval: gc_interval.max(1),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Count a request against `key`.
    pub fn check(&self, key: &str) -> Decision {
        let now = Instant::now();
        let window = self.policy.window();

        let decision = {
            let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
                started: now,
                count: 0,
            });

            if now.duration_since(entry.started) >= window {
                entry.started = now;
                entry.count = 0;
            }
            entry.count = entry.count.saturating_add(1);

            Decision {
                allowed: entry.count <= self.policy.max,
                limit: self.policy.max,
                remaining: self.policy.max.saturating_sub(entry.count),
                reset_after: window.saturating_sub(now.duration_since(entry.started)),
            }
        };

        let checks = self.checks.fetch_add(1, Ordering::Relaxed) + 1;
        if checks % self.gc_interval == 0 {
            self.collect_garbage(now);
        }

        decision
    }

    /// Drop counters whose window has closed.
    pub fn collect_garbage(&self, now: Instant) -> usize {
        let window = self.policy.window();
        let before = self.windows.len();
        self.windows
            .retain(|_, state| now.duration_since(state.started) < window);
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(
                target: "voxgate::rate_limit",
                removed,
                window_ms = self.policy.window_ms,
                "dropped stale rate limit windows"
            );
        }
        removed
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
