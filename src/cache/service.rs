//! Cache façade used by request handlers and the response-cache middleware.
//!
//! Reads and writes go to the networked store while it is healthy and fall
//! back to the in-process store otherwise. Storage failures are logged and
//! never reach the caller: the worst case is behaving like an empty cache.

use std::future::Future;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use metrics::counter;
use serde::{Serialize, de::DeserializeOwned};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::CacheConfig;
use super::redis_store::RedisStore;
use super::store::{KeyValueStore, MemoryStore, StoreError};
use crate::infra::telemetry;
use crate::util::Glob;

const SOURCE: &str = "cache::service";

/// Which backend currently serves reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Redis,
    Memory,
}

impl BackendMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendMode::Redis => "redis",
            BackendMode::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheServiceOptions {
    pub operation_timeout: Duration,
    pub degraded_backoff: Duration,
    pub sweep_interval: u64,
}

impl Default for CacheServiceOptions {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for CacheServiceOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            operation_timeout: config.operation_timeout,
            degraded_backoff: config.degraded_backoff,
            sweep_interval: config.sweep_interval.get(),
        }
    }
}

/// Tracks whether the networked store should be tried.
///
/// A failure marks the backend degraded for `backoff`; the next call after
/// that probes it again.
struct BackendHealth {
    epoch: Instant,
    degraded_until_ms: AtomicU64,
    backoff: Duration,
}

impl BackendHealth {
    fn new(backoff: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            degraded_until_ms: AtomicU64::new(0),
            backoff,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn is_healthy(&self) -> bool {
        self.elapsed_ms() >= self.degraded_until_ms.load(Ordering::Acquire)
    }

    fn mark_failed(&self) {
        let backoff_ms = u64::try_from(self.backoff.as_millis()).unwrap_or(u64::MAX);
        let until = self.elapsed_ms().saturating_add(backoff_ms);
        self.degraded_until_ms.store(until, Ordering::Release);
    }
}

pub struct CacheService {
    remote: Option<Arc<dyn KeyValueStore>>,
    local: MemoryStore,
    health: BackendHealth,
    options: CacheServiceOptions,
    local_writes: AtomicU64,
}

impl CacheService {
    /// Service without a networked store.
    pub fn in_memory(options: CacheServiceOptions) -> Self {
        Self::build(None, options)
    }

    /// Service that prefers `remote` and falls back to memory.
    pub fn with_remote(remote: Arc<dyn KeyValueStore>, options: CacheServiceOptions) -> Self {
        Self::build(Some(remote), options)
    }

    /// Build from configuration, connecting to Redis in the background when a
    /// URL is configured. Must be called from within a Tokio runtime.
    pub fn from_config(config: &CacheConfig) -> Self {
        let options = CacheServiceOptions::from(config);
        let Some(url) = config.redis_url.as_deref() else {
            info!(target: SOURCE, "redis not configured, using in-memory cache");
            return Self::in_memory(options);
        };

        match RedisStore::connect_in_background(url, config.connect_timeout) {
            Ok(store) => Self::with_remote(store, options),
            Err(err) => {
                warn!(
                    target: SOURCE,
                    error = %err,
                    "redis initialization failed, using in-memory cache"
                );
                Self::in_memory(options)
            }
        }
    }

    fn build(remote: Option<Arc<dyn KeyValueStore>>, options: CacheServiceOptions) -> Self {
        Self {
            remote,
            local: MemoryStore::new(),
            health: BackendHealth::new(options.degraded_backoff),
            options,
            local_writes: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> BackendMode {
        if self.healthy_remote().is_some() {
            BackendMode::Redis
        } else {
            BackendMode::Memory
        }
    }

    /// Remote used for reads and writes: skipped while degraded.
    fn healthy_remote(&self) -> Option<&Arc<dyn KeyValueStore>> {
        self.connected_remote().filter(|_| self.health.is_healthy())
    }

    /// Remote used for removals. These ignore the backoff so a key deleted
    /// during a degraded window cannot resurface from the remote later.
    fn connected_remote(&self) -> Option<&Arc<dyn KeyValueStore>> {
        self.remote.as_ref().filter(|remote| remote.is_connected())
    }

    async fn guarded<T, F>(&self, op: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.options.operation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                op,
                timeout: self.options.operation_timeout,
            }),
        }
    }

    fn degrade(&self, op: &'static str, key: &str, err: &StoreError) {
        self.health.mark_failed();
        counter!(telemetry::CACHE_BACKEND_FALLBACK, "op" => op).increment(1);
        warn!(
            target: SOURCE,
            op,
            key,
            error = %err,
            "cache backend error, falling back to in-memory cache"
        );
    }

    /// Fetch and decode a value. Missing, expired and undecodable entries are
    /// all `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(remote) = self.healthy_remote() {
            match self.guarded("get", remote.get(key)).await {
                Ok(raw) => return raw.and_then(|raw| decode(key, &raw)),
                Err(err) => self.degrade("get", key, &err),
            }
        }

        self.local.get(key).and_then(|raw| decode(key, &raw))
    }

    /// Store a value, optionally expiring after `ttl`.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(target: SOURCE, key, error = %err, "failed to serialize cache value");
                return;
            }
        };

        if let Some(remote) = self.healthy_remote() {
            match self.guarded("set", remote.set(key, &raw, ttl)).await {
                Ok(()) => {
                    // Drop any copy written while degraded so a later
                    // fallback cannot serve it.
                    self.local.delete(key);
                    return;
                }
                Err(err) => self.degrade("set", key, &err),
            }
        }

        self.local.set(key, &raw, ttl);
        self.maybe_sweep();
    }

    pub async fn delete(&self, key: &str) {
        if let Some(remote) = self.connected_remote()
            && let Err(err) = self.guarded("delete", remote.delete(key)).await
        {
            self.degrade("delete", key, &err);
        }

        self.local.delete(key);
    }

    /// Remove every key matching `pattern` (`*` = any characters) from both
    /// backends.
    pub async fn invalidate(&self, pattern: &str) {
        if let Some(remote) = self.connected_remote() {
            match self
                .guarded("invalidate", remote.delete_pattern(pattern))
                .await
            {
                Ok(removed) => debug!(target: SOURCE, pattern, removed, "invalidated remote keys"),
                Err(err) => self.degrade("invalidate", pattern, &err),
            }
        }

        match Glob::new(pattern) {
            Ok(glob) => {
                let removed = self.local.delete_matching(&glob);
                debug!(target: SOURCE, pattern, removed, "invalidated local keys");
            }
            Err(err) => warn!(target: SOURCE, pattern, error = %err, "invalid invalidation pattern"),
        }
    }

    /// Flush both backends.
    pub async fn clear(&self) {
        if let Some(remote) = self.connected_remote()
            && let Err(err) = self.guarded("clear", remote.clear()).await
        {
            self.degrade("clear", "*", &err);
        }

        self.local.clear();
    }

    /// Release the networked connection, if any.
    pub async fn close(&self) {
        if let Some(remote) = self.remote.as_ref()
            && let Err(err) = remote.close().await
        {
            warn!(target: SOURCE, error = %err, "failed to close cache backend");
        }
    }

    fn maybe_sweep(&self) {
        let writes = self.local_writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.options.sweep_interval.max(1) == 0 {
            let purged = self.local.purge_expired();
            debug!(target: SOURCE, purged, "swept expired in-memory entries");
        }
    }

    /// Entries held by the in-process store.
    pub fn local_len(&self) -> usize {
        self.local.len()
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(target: SOURCE, key, error = %err, "discarding malformed cache entry");
            None
        }
    }
}
