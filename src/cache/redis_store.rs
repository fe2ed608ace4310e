//! Redis-backed `KeyValueStore`.
//!
//! The connection is established in a background task so startup never
//! waits on the network. Until it succeeds every call fails fast with
//! `StoreError::NotConnected` and the cache service serves from memory.

use std::sync::{
    Arc, LockResult, Mutex, RwLock, Weak,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::{KeyValueStore, StoreError};

const SOURCE: &str = "cache::redis_store";
const RECONNECT_STEP_MS: u64 = 50;
const RECONNECT_CAP_MS: u64 = 2_000;

pub struct RedisStore {
    connection: RwLock<Option<ConnectionManager>>,
    connected: AtomicBool,
    connector: Mutex<Option<JoinHandle<()>>>,
}

impl RedisStore {
    /// Validate `url` and start connecting in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect_in_background(
        url: &str,
        connect_timeout: Duration,
    ) -> Result<Arc<Self>, StoreError> {
        let client = Client::open(url)?;
        let store = Arc::new(Self {
            connection: RwLock::new(None),
            connected: AtomicBool::new(false),
            connector: Mutex::new(None),
        });

        let handle = tokio::spawn(connect_until_ready(
            client,
            Arc::downgrade(&store),
            connect_timeout,
        ));
        *recover(store.connector.lock(), "connect_in_background") = Some(handle);

        Ok(store)
    }

    fn install(&self, manager: ConnectionManager) {
        *recover(self.connection.write(), "install") = Some(manager);
        self.connected.store(true, Ordering::Release);
    }

    fn connection(&self) -> Result<ConnectionManager, StoreError> {
        recover(self.connection.read(), "connection")
            .clone()
            .ok_or(StoreError::NotConnected)
    }
}

/// A panic while holding one of these locks leaves at worst a stale
/// connection handle, so poisoning is logged and ignored.
fn recover<G>(result: LockResult<G>, op: &'static str) -> G {
    result.unwrap_or_else(|poisoned| {
        warn!(target: SOURCE, op, "recovered poisoned redis store lock");
        poisoned.into_inner()
    })
}

async fn connect_until_ready(client: Client, store: Weak<RedisStore>, connect_timeout: Duration) {
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        match tokio::time::timeout(connect_timeout, client.get_connection_manager()).await {
            Ok(Ok(manager)) => {
                if let Some(store) = store.upgrade() {
                    store.install(manager);
                    info!(target: SOURCE, attempt, "redis connected");
                }
                return;
            }
            Ok(Err(err)) => {
                warn!(
                    target: SOURCE,
                    attempt,
                    error = %err,
                    "redis connection failed, serving from in-memory cache"
                );
            }
            Err(_) => {
                warn!(
                    target: SOURCE,
                    attempt,
                    timeout_ms = connect_timeout.as_millis() as u64,
                    "redis connection attempt timed out, serving from in-memory cache"
                );
            }
        }

        if store.strong_count() == 0 {
            return;
        }
        tokio::time::sleep(reconnect_delay(attempt)).await;
    }
}

/// Linear backoff between connection attempts, capped at two seconds.
pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    let millis = u64::from(attempt)
        .saturating_mul(RECONNECT_STEP_MS)
        .min(RECONNECT_CAP_MS);
    Duration::from_millis(millis)
}

/// Translate an invalidation glob into a `KEYS` pattern. Only `*` stays a
/// wildcard; the other Redis glob metacharacters are matched literally.
pub(crate) fn keys_pattern(glob: &str) -> String {
    let mut escaped = String::with_capacity(glob.len());
    for ch in glob.chars() {
        if matches!(ch, '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl KeyValueStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection()?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        match ttl.filter(|ttl| !ttl.is_zero()) {
            // SETEX has whole-second resolution; round sub-second TTLs up.
            Some(ttl) => {
                let seconds = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
                let _: () = conn.set_ex(key, value, seconds).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection()?;
        let keys: Vec<String> = conn.keys(keys_pattern(pattern)).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let removed: usize = conn.del(&keys).await?;
        debug!(target: SOURCE, pattern, removed, "deleted keys by pattern");
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if let Some(handle) = recover(self.connector.lock(), "close").take() {
            handle.abort();
        }
        let dropped = recover(self.connection.write(), "close").take();
        self.connected.store(false, Ordering::Release);
        if dropped.is_some() {
            info!(target: SOURCE, "redis connection closed");
        }
        Ok(())
    }
}
