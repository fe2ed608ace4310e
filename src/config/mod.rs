//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{CacheConfig, CacheRoute};
use crate::rate_limit::{RateLimitConfig, RateLimitPolicy, RouteRule};

mod cli;

pub use cli::{CliArgs, Command, ResolveArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "voxgate";
const ENV_PREFIX: &str = "VOXGATE";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    if let Some(url) = cli.redis_url.as_ref() {
        raw.cache.redis_url = Some(url.clone());
    }

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Resolve(_)) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    rate_limit: RawRateLimitSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(ttl) = overrides.cache_default_ttl_seconds {
            self.cache.default_ttl_seconds = Some(ttl);
        }
        if let Some(timeout) = overrides.cache_operation_timeout_ms {
            self.cache.operation_timeout_ms = Some(timeout);
        }
        if let Some(enabled) = overrides.rate_limit_enabled {
            self.rate_limit.enabled = Some(enabled);
        }
        if let Some(window) = overrides.rate_limit_window_ms {
            self.rate_limit
                .default
                .get_or_insert_with(Default::default)
                .window_ms = Some(window);
        }
        if let Some(max) = overrides.rate_limit_max {
            self.rate_limit.default.get_or_insert_with(Default::default).max = Some(max);
        }
        if let Some(trust) = overrides.rate_limit_trust_forwarded_for {
            self.rate_limit.trust_forwarded_for = Some(trust);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            rate_limit,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_config(cache)?;
        let rate_limit = build_rate_limit_config(rate_limit)?;

        Ok(Self {
            server,
            logging,
            cache,
            rate_limit,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_config(cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();

    let redis_url = cache.redis_url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if let Some(url) = redis_url.as_deref() {
        validate_redis_url(url).map_err(|reason| LoadError::invalid("cache.redis_url", reason))?;
    }

    let operation_timeout = match cache.operation_timeout_ms {
        Some(ms) => Duration::from_millis(non_zero_u64(ms, "cache.operation_timeout_ms")?.get()),
        None => defaults.operation_timeout,
    };
    let connect_timeout = match cache.connect_timeout_ms {
        Some(ms) => Duration::from_millis(non_zero_u64(ms, "cache.connect_timeout_ms")?.get()),
        None => defaults.connect_timeout,
    };
    let degraded_backoff = cache
        .degraded_backoff_ms
        .map(Duration::from_millis)
        .unwrap_or(defaults.degraded_backoff);
    let sweep_interval = match cache.sweep_interval {
        Some(value) => non_zero_u64(value, "cache.sweep_interval")?,
        None => defaults.sweep_interval,
    };
    let default_ttl = match cache.default_ttl_seconds {
        Some(secs) => Duration::from_secs(non_zero_u64(secs, "cache.default_ttl_seconds")?.get()),
        None => defaults.default_ttl,
    };
    let max_body_bytes = match cache.max_body_bytes {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.max_body_bytes",
                "must be greater than zero",
            ));
        }
        Some(bytes) => bytes,
        None => defaults.max_body_bytes,
    };

    let cacheable_prefixes = match cache.cacheable_prefixes {
        Some(prefixes) => {
            for prefix in &prefixes {
                require_path(prefix, "cache.cacheable_prefixes")?;
            }
            prefixes
        }
        None => defaults.cacheable_prefixes,
    };

    let routes = match cache.routes {
        Some(routes) => routes
            .into_iter()
            .map(|route| {
                require_path(&route.path, "cache.routes.path")?;
                let ttl = non_zero_u64(route.ttl_seconds, "cache.routes.ttl_seconds")?;
                let vary: Vec<&str> = route.vary.iter().map(String::as_str).collect();
                Ok(
                    CacheRoute::new(route.path.clone(), Duration::from_secs(ttl.get()))
                        .with_vary(&vary),
                )
            })
            .collect::<Result<Vec<_>, LoadError>>()?,
        None => defaults.routes,
    };

    Ok(CacheConfig {
        enabled: cache.enabled.unwrap_or(defaults.enabled),
        redis_url,
        operation_timeout,
        connect_timeout,
        degraded_backoff,
        sweep_interval,
        key_prefix: cache.key_prefix.unwrap_or(defaults.key_prefix),
        default_ttl,
        max_body_bytes,
        cacheable_prefixes,
        routes,
    })
}

fn build_rate_limit_config(
    rate_limit: RawRateLimitSettings,
) -> Result<RateLimitConfig, LoadError> {
    let defaults = RateLimitConfig::default();

    let default_policy = match rate_limit.default {
        Some(policy) => RateLimitPolicy::new(
            non_zero_u64(
                policy
                    .window_ms
                    .unwrap_or(defaults.default_policy.window_ms),
                "rate_limit.default.window_ms",
            )?
            .get(),
            non_zero_u32(
                policy.max.unwrap_or(u64::from(defaults.default_policy.max)),
                "rate_limit.default.max",
            )?
            .get(),
        ),
        None => defaults.default_policy,
    };

    let routes = match rate_limit.routes {
        Some(routes) => routes
            .into_iter()
            .map(|route| {
                require_path(&route.pattern, "rate_limit.routes.pattern")?;
                let window_ms = non_zero_u64(route.window_ms, "rate_limit.routes.window_ms")?;
                let max = non_zero_u32(route.max, "rate_limit.routes.max")?;
                let rule = RouteRule::new(
                    route.pattern,
                    RateLimitPolicy::new(window_ms.get(), max.get()),
                );
                Ok(match route.bucket {
                    Some(bucket) if !bucket.trim().is_empty() => rule.shared(bucket.trim()),
                    _ => rule,
                })
            })
            .collect::<Result<Vec<_>, LoadError>>()?,
        None => defaults.routes,
    };

    let exempt_paths = match rate_limit.exempt_paths {
        Some(paths) => {
            for path in &paths {
                require_path(path, "rate_limit.exempt_paths")?;
            }
            paths
        }
        None => defaults.exempt_paths,
    };

    let gc_interval = match rate_limit.gc_interval {
        Some(value) => non_zero_u64(value, "rate_limit.gc_interval")?,
        None => defaults.gc_interval,
    };

    Ok(RateLimitConfig {
        enabled: rate_limit.enabled.unwrap_or(defaults.enabled),
        default_policy,
        routes,
        exempt_paths,
        trust_forwarded_for: rate_limit
            .trust_forwarded_for
            .unwrap_or(defaults.trust_forwarded_for),
        gc_interval,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    redis_url: Option<String>,
    operation_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    degraded_backoff_ms: Option<u64>,
    sweep_interval: Option<u64>,
    key_prefix: Option<String>,
    default_ttl_seconds: Option<u64>,
    max_body_bytes: Option<usize>,
    cacheable_prefixes: Option<Vec<String>>,
    routes: Option<Vec<RawCacheRoute>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawCacheRoute {
    path: String,
    ttl_seconds: u64,
    #[serde(default)]
    vary: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRateLimitSettings {
    enabled: Option<bool>,
    default: Option<RawPolicy>,
    exempt_paths: Option<Vec<String>>,
    trust_forwarded_for: Option<bool>,
    gc_interval: Option<u64>,
    routes: Option<Vec<RawRouteRule>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPolicy {
    window_ms: Option<u64>,
    max: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRouteRule {
    pattern: String,
    window_ms: u64,
    max: u64,
    #[serde(default)]
    bucket: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn validate_redis_url(raw: &str) -> Result<(), String> {
    let url = Url::parse(raw).map_err(|err| format!("invalid url: {err}"))?;
    match url.scheme() {
        "redis" | "rediss" | "redis+unix" | "unix" => Ok(()),
        other => Err(format!("unsupported scheme `{other}`")),
    }
}

fn require_path(value: &str, key: &'static str) -> Result<(), LoadError> {
    if value.starts_with('/') {
        Ok(())
    } else {
        Err(LoadError::invalid(key, format!("`{value}` must start with `/`")))
    }
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
