//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by group-queue and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all group-queue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Messages offered to groups, labeled by consumer and outcome (added/duplicate).
pub static GROUPED_MESSAGES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Flush attempts, labeled by consumer, mode, and outcome.
pub static FLUSHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Chunks handed to the host, labeled by consumer.
pub static DISPATCHED_CHUNKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Messages handed to the host, labeled by consumer.
pub static DISPATCHED_MESSAGES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Messages returned from expired pending dispatches, labeled by consumer.
pub static REVIVED_MESSAGES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Last observed size of each group.
pub static GROUP_SIZE: OnceLock<GaugeVec> = OnceLock::new();

/// Sweep duration in seconds, labeled by sweep kind (flush/revival).
pub static SWEEP_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Per-group failures during sweeps, labeled by sweep kind.
pub static SWEEP_FAILURES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Recording
/// methods on [`super::MetricsCollector`] are no-ops until it has run.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let grouped_messages_total = CounterVec::new(
        Opts::new(
            "group_queue_grouped_messages_total",
            "Messages offered to groups",
        ),
        &["consumer", "outcome"],
    )?;

    let flushes_total = CounterVec::new(
        Opts::new("group_queue_flushes_total", "Flush attempts"),
        &["consumer", "mode", "outcome"],
    )?;

    let dispatched_chunks_total = CounterVec::new(
        Opts::new(
            "group_queue_dispatched_chunks_total",
            "Chunks handed to the host dispatch system",
        ),
        &["consumer"],
    )?;

    let dispatched_messages_total = CounterVec::new(
        Opts::new(
            "group_queue_dispatched_messages_total",
            "Messages handed to the host dispatch system",
        ),
        &["consumer"],
    )?;

    let revived_messages_total = CounterVec::new(
        Opts::new(
            "group_queue_revived_messages_total",
            "Messages requeued from expired pending dispatches",
        ),
        &["consumer"],
    )?;

    let group_size = GaugeVec::new(
        Opts::new("group_queue_group_size", "Last observed number of messages in a group"),
        &["group"],
    )?;

    let sweep_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "group_queue_sweep_duration_seconds",
            "Sweep duration in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["sweep"],
    )?;

    let sweep_failures_total = CounterVec::new(
        Opts::new(
            "group_queue_sweep_failures_total",
            "Groups that failed during a sweep",
        ),
        &["sweep"],
    )?;

    registry.register(Box::new(grouped_messages_total.clone()))?;
    registry.register(Box::new(flushes_total.clone()))?;
    registry.register(Box::new(dispatched_chunks_total.clone()))?;
    registry.register(Box::new(dispatched_messages_total.clone()))?;
    registry.register(Box::new(revived_messages_total.clone()))?;
    registry.register(Box::new(group_size.clone()))?;
    registry.register(Box::new(sweep_duration.clone()))?;
    registry.register(Box::new(sweep_failures_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = GROUPED_MESSAGES_TOTAL.set(grouped_messages_total);
    let _ = FLUSHES_TOTAL.set(flushes_total);
    let _ = DISPATCHED_CHUNKS_TOTAL.set(dispatched_chunks_total);
    let _ = DISPATCHED_MESSAGES_TOTAL.set(dispatched_messages_total);
    let _ = REVIVED_MESSAGES_TOTAL.set(revived_messages_total);
    let _ = GROUP_SIZE.set(group_size);
    let _ = SWEEP_DURATION.set(sweep_duration);
    let _ = SWEEP_FAILURES_TOTAL.set(sweep_failures_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
