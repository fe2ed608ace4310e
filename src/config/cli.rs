use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the voxgate binary.
#[derive(Debug, Parser)]
#[command(
    name = "voxgate",
    version,
    about = "Rate-limiting and response-caching edge for the voice agent API"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "VOXGATE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Redis connection URL; the cache runs in memory when unset.
    #[arg(long = "redis-url", env = "REDIS_URL", value_name = "URL", global = true)]
    pub redis_url: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP edge.
    Serve(Box<ServeArgs>),
    /// Print the rate limit policy and cache TTL that apply to a path.
    Resolve(ResolveArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct ResolveArgs {
    /// Request path, e.g. `/api/knowledge/scrape`.
    #[arg(value_name = "PATH")]
    pub path: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle the HTTP response cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the TTL for cacheable paths without a route entry.
    #[arg(long = "cache-default-ttl-seconds", value_name = "SECONDS")]
    pub cache_default_ttl_seconds: Option<u64>,

    /// Override the per-call timeout for Redis operations.
    #[arg(long = "cache-operation-timeout-ms", value_name = "MS")]
    pub cache_operation_timeout_ms: Option<u64>,

    /// Toggle rate limiting.
    #[arg(
        long = "rate-limit-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub rate_limit_enabled: Option<bool>,

    /// Override the default rate limit window.
    #[arg(long = "rate-limit-window-ms", value_name = "MS")]
    pub rate_limit_window_ms: Option<u64>,

    /// Override the default rate limit request ceiling.
    #[arg(long = "rate-limit-max", value_name = "COUNT")]
    pub rate_limit_max: Option<u64>,

    /// Identify clients by the first `X-Forwarded-For` hop.
    #[arg(
        long = "rate-limit-trust-forwarded-for",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub rate_limit_trust_forwarded_for: Option<bool>,
}
