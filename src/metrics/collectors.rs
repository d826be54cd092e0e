//! High-level interface for recording grouping metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so call sites only
//! name what happened. Every method is a no-op until `init_metrics()` has run.

use super::prometheus::{
    DISPATCHED_CHUNKS_TOTAL, DISPATCHED_MESSAGES_TOTAL, FLUSHES_TOTAL, GROUPED_MESSAGES_TOTAL,
    GROUP_SIZE, REVIVED_MESSAGES_TOTAL, SWEEP_DURATION, SWEEP_FAILURES_TOTAL,
};

/// Metrics collector for grouping activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a message offered to a group.
    pub fn record_grouped(&self, consumer: &str, count: usize, duplicates: usize) {
        if let Some(grouped) = GROUPED_MESSAGES_TOTAL.get() {
            grouped
                .with_label_values(&[consumer, "added"])
                .inc_by(count as f64);
            grouped
                .with_label_values(&[consumer, "duplicate"])
                .inc_by(duplicates as f64);
        }
    }

    /// Record the outcome of a flush attempt.
    ///
    /// # Arguments
    ///
    /// * `consumer` - Consumer identity of the group
    /// * `mode` - "plain" or "reliable"
    /// * `outcome` - "dispatched", "locked", "empty" or "failed"
    pub fn record_flush(&self, consumer: &str, mode: &str, outcome: &str) {
        if let Some(flushes) = FLUSHES_TOTAL.get() {
            flushes.with_label_values(&[consumer, mode, outcome]).inc();
        }

        tracing::trace!(
            consumer = consumer,
            mode = mode,
            outcome = outcome,
            "Recorded flush metric"
        );
    }

    /// Record chunks handed to the host.
    pub fn record_dispatch(&self, consumer: &str, chunks: usize, messages: usize) {
        if let Some(total) = DISPATCHED_CHUNKS_TOTAL.get() {
            total.with_label_values(&[consumer]).inc_by(chunks as f64);
        }
        if let Some(total) = DISPATCHED_MESSAGES_TOTAL.get() {
            total.with_label_values(&[consumer]).inc_by(messages as f64);
        }
    }

    /// Record messages revived from expired pending dispatches.
    pub fn record_revived(&self, consumer: &str, messages: usize) {
        if let Some(total) = REVIVED_MESSAGES_TOTAL.get() {
            total.with_label_values(&[consumer]).inc_by(messages as f64);
        }
    }

    /// Record the current size of a group.
    pub fn set_group_size(&self, group: &str, size: usize) {
        if let Some(gauge) = GROUP_SIZE.get() {
            gauge.with_label_values(&[group]).set(size as f64);
        }
    }

    /// Record a finished sweep.
    ///
    /// # Arguments
    ///
    /// * `sweep` - "flush" or "revival"
    /// * `duration_secs` - Wall time of the sweep
    /// * `failures` - Number of groups that failed
    pub fn record_sweep(&self, sweep: &str, duration_secs: f64, failures: usize) {
        if let Some(histogram) = SWEEP_DURATION.get() {
            histogram.with_label_values(&[sweep]).observe(duration_secs);
        }
        if let Some(total) = SWEEP_FAILURES_TOTAL.get() {
            total.with_label_values(&[sweep]).inc_by(failures as f64);
        }
    }
}
