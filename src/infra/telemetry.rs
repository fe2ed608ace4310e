//! Tracing subscriber setup and the metric catalogue.

use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

pub const CACHE_HIT: &str = "voxgate_cache_hit_total";
pub const CACHE_MISS: &str = "voxgate_cache_miss_total";
pub const CACHE_NOT_MODIFIED: &str = "voxgate_cache_not_modified_total";
pub const CACHE_BACKEND_FALLBACK: &str = "voxgate_cache_backend_fallback_total";
pub const RATE_LIMIT_ALLOWED: &str = "voxgate_rate_limit_allowed_total";
pub const RATE_LIMIT_REJECTED: &str = "voxgate_rate_limit_rejected_total";

const COUNTERS: [(&str, &str); 6] = [
    (CACHE_HIT, "Responses served from the response cache."),
    (CACHE_MISS, "Cacheable requests that had to run the handler."),
    (CACHE_NOT_MODIFIED, "Conditional requests answered with 304."),
    (
        CACHE_BACKEND_FALLBACK,
        "Cache operations served by the in-memory store instead of Redis, by operation.",
    ),
    (RATE_LIMIT_ALLOWED, "Requests admitted by the rate limiter."),
    (RATE_LIMIT_REJECTED, "Requests rejected with 429."),
];

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// `RUST_LOG` still wins over the configured level when set.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(format_layer(logging.format))
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn format_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    }
}

/// Register descriptions with whichever metrics recorder is installed.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        for (name, help) in COUNTERS {
            describe_counter!(name, Unit::Count, help);
        }
    });
}
