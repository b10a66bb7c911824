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
///
/// Metric descriptions are registered once per process on the first call.
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
            "prerender_requests_total",
            Unit::Count,
            "Requests handled, labelled by outcome action and cache status."
        );
        describe_histogram!(
            "prerender_request_duration_seconds",
            Unit::Seconds,
            "End-to-end request latency by outcome action."
        );
        describe_counter!(
            "prerender_cache_hit_total",
            Unit::Count,
            "Cache lookups answered by a fresh entry."
        );
        describe_counter!(
            "prerender_cache_stale_total",
            Unit::Count,
            "Cache lookups answered by an entry inside its stale window."
        );
        describe_counter!(
            "prerender_cache_miss_total",
            Unit::Count,
            "Cache lookups that found no usable entry."
        );
        describe_counter!(
            "prerender_cache_expired_total",
            Unit::Count,
            "Entries purged after their stale window closed."
        );
        describe_counter!(
            "prerender_cache_evict_total",
            Unit::Count,
            "In-process entries evicted because the store was full."
        );
        describe_counter!(
            "prerender_cache_backend_fallback_total",
            Unit::Count,
            "Operations rerouted to the in-process backend after a networked backend failure."
        );
        describe_counter!(
            "prerender_render_total",
            Unit::Count,
            "Render tasks finished, labelled by result."
        );
        describe_histogram!(
            "prerender_render_duration_seconds",
            Unit::Seconds,
            "Render task latency including retries."
        );
        describe_counter!(
            "prerender_render_retries_total",
            Unit::Count,
            "Render attempts retried, labelled by error kind."
        );
        describe_gauge!(
            "prerender_breaker_state",
            Unit::Count,
            "Circuit breaker state (0 closed, 1 open, 2 half-open)."
        );
        describe_counter!(
            "prerender_breaker_rejections_total",
            Unit::Count,
            "Render tasks rejected by an open circuit breaker."
        );
        describe_counter!(
            "prerender_interceptor_requests_total",
            Unit::Count,
            "Sub-requests seen by the resource interceptor, labelled by decision."
        );
        describe_gauge!(
            "prerender_pool_sessions",
            Unit::Count,
            "Live browser sessions held by the worker pool."
        );
        describe_counter!(
            "prerender_singleflight_joins_total",
            Unit::Count,
            "Requests that waited on a render already in flight."
        );
        describe_counter!(
            "prerender_swr_refresh_total",
            Unit::Count,
            "Background refreshes of stale entries, labelled by result."
        );
        describe_counter!(
            "prerender_events_dropped_total",
            Unit::Count,
            "Traffic events dropped because the queue was full."
        );
        describe_counter!(
            "prerender_events_forwarded_total",
            Unit::Count,
            "Traffic events delivered to the configured sink."
        );
        describe_counter!(
            "prerender_ip_refresh_total",
            Unit::Count,
            "Provider IP range refreshes, labelled by provider and result."
        );
    });
}
