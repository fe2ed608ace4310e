//! Voxgate cache system.
//!
//! - `CacheService`: key-value façade over Redis with an in-process fallback.
//! - `response_cache_layer`: ETag-aware HTTP response cache built on it.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! redis_url = "redis://127.0.0.1:6379/0"
//! default_ttl_seconds = 300
//! cacheable_prefixes = ["/health", "/api/health"]
//!
//! [[cache.routes]]
//! path = "/api/elevenlabs/voices"
//! ttl_seconds = 3600
//! vary = ["accept-language"]
//! ```

mod config;
mod keys;
mod middleware;
mod redis_store;
mod service;
mod store;

pub use self::config::{CacheConfig, CacheRoute, DEFAULT_KEY_PREFIX};
pub use keys::{CacheKeys, CacheTtl, normalize_query, response_key};
pub use middleware::{
    CACHE_STATUS_HEADER, CachedHttpResponse, ResponseCache, compute_etag, response_cache_layer,
};
pub use redis_store::RedisStore;
pub use service::{BackendMode, CacheService, CacheServiceOptions};
pub use store::{KeyValueStore, MemoryStore, StoreError};
