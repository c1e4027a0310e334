use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "trefa_cache_hit_total",
            Unit::Count,
            "Reads answered from the in-process cache, by kind."
        );
        describe_counter!(
            "trefa_cache_miss_total",
            Unit::Count,
            "Reads that had to go to the inventory backend, by kind."
        );
        describe_counter!(
            "trefa_cache_evict_total",
            Unit::Count,
            "Live entries evicted because the cache was full."
        );
        describe_counter!(
            "trefa_cache_expired_total",
            Unit::Count,
            "Entries dropped after their TTL elapsed."
        );
        describe_gauge!(
            "trefa_cache_entries",
            Unit::Count,
            "Current number of entries in the in-process cache."
        );
        describe_gauge!(
            "trefa_cache_inflight",
            Unit::Count,
            "Backend fetches currently in flight."
        );
        describe_counter!(
            "trefa_cache_dedup_joined_total",
            Unit::Count,
            "Reads that joined an in-flight fetch instead of starting one."
        );
        describe_counter!(
            "trefa_cache_invalidated_total",
            Unit::Count,
            "Entries removed by explicit revalidation, by scope."
        );
        describe_counter!(
            "trefa_cache_lock_poisoned_total",
            Unit::Count,
            "Cache lock acquisitions that recovered from a poisoned lock."
        );
        describe_histogram!(
            "trefa_backend_fetch_ms",
            Unit::Milliseconds,
            "Inventory backend fetch latency in milliseconds."
        );
    });
}
