//! Revival sweep.

use std::time::Instant;

use tracing::{debug, error, info};

use super::SweepReport;
use crate::error::GroupError;
use crate::grouping::Grouping;
use crate::metrics::MetricsCollector;

/// Returns expired pending dispatches of every group to its queue.
#[derive(Debug, Clone)]
pub struct RevivalSweeper {
    grouping: Grouping,
    metrics: MetricsCollector,
}

impl RevivalSweeper {
    pub fn new(grouping: Grouping) -> Self {
        Self {
            grouping,
            metrics: MetricsCollector::new(),
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, GroupError> {
        let started = Instant::now();
        let mut report = SweepReport::default();

        for group in self.grouping.all().await? {
            report.attempted += 1;
            match group.requeue_expired().await {
                Ok(requeued) => {
                    report.succeeded += 1;
                    report.messages += requeued;
                }
                Err(e) => {
                    error!(group = %group.name(), error = %e, "Revival failed");
                    report.record_failure(group.name().to_string(), e);
                }
            }
        }

        if report.messages > 0 {
            info!(revived = report.messages, "Revived expired pending messages");
        } else {
            debug!(groups = report.attempted, "Nothing to revive");
        }

        self.metrics.record_sweep(
            "revival",
            started.elapsed().as_secs_f64(),
            report.failures.len(),
        );
        Ok(report)
    }
}
