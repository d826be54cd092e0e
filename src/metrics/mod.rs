//! Metrics module for Prometheus-based monitoring.
//!
//! Counts what the grouping engine does: messages grouped, flushes by
//! outcome, chunks dispatched, messages revived, sweep timings.
//!
//! # Example
//!
//! ```ignore
//! use group_queue::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_flush("mailer", "reliable", "dispatched");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    DISPATCHED_CHUNKS_TOTAL, DISPATCHED_MESSAGES_TOTAL, FLUSHES_TOTAL, GROUPED_MESSAGES_TOTAL,
    GROUP_SIZE, REGISTRY, REVIVED_MESSAGES_TOTAL, SWEEP_DURATION, SWEEP_FAILURES_TOTAL,
};
