//! Key-value storage backends.
//!
//! `KeyValueStore` is the narrow contract the cache service talks to. Values
//! are already-serialized JSON strings so every backend stores the same
//! transportable form. `MemoryStore` is the in-process implementation and is
//! always present; the networked one lives in `redis.rs`.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

use crate::util::Glob;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("`{op}` timed out after {}ms", .timeout.as_millis())]
    Timeout { op: &'static str, timeout: Duration },
    #[error("backend is not connected")]
    NotConnected,
    #[error("invalid key pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Storage contract shared by the networked and in-process backends.
///
/// A missing key is `Ok(None)`, never an error. `delete_pattern` takes a glob
/// where `*` matches zero or more characters and the whole key must match.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Short backend name used in logs and health output.
    fn name(&self) -> &'static str;

    /// Whether the backend has an established connection.
    fn is_connected(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value`; with `ttl` it must become unreachable once the TTL elapses.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every key matching `pattern`, returning how many were removed.
    async fn delete_pattern(&self, pattern: &str) -> Result<usize, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// In-process store with absolute per-entry expiry.
///
/// Expired entries are never returned: `get` checks the deadline and drops the
/// entry on the spot. `purge_expired` only bounds memory held by entries that
/// nobody reads again.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
        }

        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// A zero TTL is treated as "no expiry".
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let expires_at = ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| Instant::now() + ttl);
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn delete_matching(&self, glob: &Glob) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !glob.is_match(key));
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop every entry whose deadline has passed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(MemoryStore::get(self, key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        MemoryStore::set(self, key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        MemoryStore::delete(self, key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, StoreError> {
        let glob = Glob::new(pattern).map_err(|source| StoreError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(self.delete_matching(&glob))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        MemoryStore::clear(self);
        Ok(())
    }
}
