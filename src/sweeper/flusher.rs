//! Flush sweep.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::SweepReport;
use crate::error::GroupError;
use crate::grouping::{FlushOutcome, Group, Grouping};
use crate::metrics::MetricsCollector;

/// Flushes every group that is eligible by size or time.
#[derive(Debug, Clone)]
pub struct FlushSweeper {
    grouping: Grouping,
    metrics: MetricsCollector,
}

impl FlushSweeper {
    pub fn new(grouping: Grouping) -> Self {
        Self {
            grouping,
            metrics: MetricsCollector::new(),
        }
    }

    /// Runs one sweep. Each eligible group is flushed at most once.
    ///
    /// # Errors
    ///
    /// Only fails when the group registry cannot be read; per-group errors
    /// end up in the report.
    pub async fn sweep(&self) -> Result<SweepReport, GroupError> {
        let started = Instant::now();
        let mut report = SweepReport::default();

        let mut eligible = Vec::new();
        for group in self.grouping.all().await? {
            match group.could_flush().await {
                Ok(true) => eligible.push(group),
                Ok(false) => {}
                Err(e) => {
                    warn!(group = %group.name(), error = %e, "Could not check group");
                    report.record_failure(group.name().to_string(), e);
                }
            }
        }

        if eligible.is_empty() {
            debug!("No groups ready to flush");
        } else {
            let names: Vec<String> = eligible.iter().map(|g| g.name().to_string()).collect();
            info!(groups = ?names, "Flushing eligible groups");
        }

        self.flush_each(&eligible, &mut report).await;

        self.metrics.record_sweep(
            "flush",
            started.elapsed().as_secs_f64(),
            report.failures.len(),
        );
        Ok(report)
    }

    /// Flushes every registered group regardless of eligibility.
    ///
    /// Meant for tests and manual intervention; warns when the engine is not
    /// configured as a test environment.
    pub async fn force_flush(&self) -> Result<SweepReport, GroupError> {
        if !self.grouping.config().tests_env {
            warn!("force_flush should only be used in a test environment");
        }

        let started = Instant::now();
        let mut report = SweepReport::default();
        let groups = self.grouping.all().await?;
        self.flush_each(&groups, &mut report).await;

        self.metrics.record_sweep(
            "force_flush",
            started.elapsed().as_secs_f64(),
            report.failures.len(),
        );
        Ok(report)
    }

    async fn flush_each(&self, groups: &[Group], report: &mut SweepReport) {
        for group in groups {
            report.attempted += 1;
            match group.flush().await {
                Ok(FlushOutcome::Dispatched { messages, .. }) => {
                    report.succeeded += 1;
                    report.messages += messages;
                }
                Ok(FlushOutcome::Empty) | Ok(FlushOutcome::Locked) => {
                    report.succeeded += 1;
                }
                Err(e) => {
                    error!(group = %group.name(), error = %e, "Flush failed");
                    report.record_failure(group.name().to_string(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{ConsumerRegistry, ConsumerSettings, EngineConfig};
    use crate::dispatch::{CollectingDispatcher, Dispatcher};
    use crate::error::DispatchError;
    use crate::grouping::GroupName;
    use crate::store::InMemoryGroupStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    /// Rejects every chunk for one consumer and collects the rest.
    struct RejectingDispatcher {
        rejected_consumer: &'static str,
        inner: CollectingDispatcher,
    }

    #[async_trait]
    impl Dispatcher for RejectingDispatcher {
        async fn dispatch(&self, group: &GroupName, chunk: Vec<Value>) -> Result<(), DispatchError> {
            if group.consumer() == self.rejected_consumer {
                return Err(DispatchError::Rejected {
                    group: group.to_string(),
                    reason: "host down".to_string(),
                });
            }
            self.inner.dispatch(group, chunk).await
        }
    }

    fn setup() -> (Grouping, Arc<CollectingDispatcher>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let dispatcher = Arc::new(CollectingDispatcher::new());
        let consumers = ConsumerRegistry::new()
            .with_consumer("sized", ConsumerSettings::new().with_flush_threshold(2))
            .with_consumer(
                "timed",
                ConsumerSettings::new().with_flush_interval(Duration::from_secs(10)),
            );
        let grouping = Grouping::new(
            EngineConfig::default().with_tests_env(true),
            consumers,
            Arc::new(InMemoryGroupStore::with_clock("batching", clock.clone())),
            dispatcher.clone(),
        )
        .with_clock(clock.clone());
        (grouping, dispatcher, clock)
    }

    #[tokio::test]
    async fn test_sweep_flushes_only_eligible_groups() {
        let (grouping, dispatcher, clock) = setup();
        let sized = grouping.group("sized", "default").expect("group");
        let timed = grouping.group("timed", "default").expect("group");

        sized.add(&json!("a")).await.expect("add");
        sized.add(&json!("b")).await.expect("add");
        timed.add(&json!("c")).await.expect("add");

        let sweeper = FlushSweeper::new(grouping);
        let report = sweeper.sweep().await.expect("sweep");
        assert_eq!(report.attempted, 1);
        assert_eq!(report.messages, 2);
        assert_eq!(dispatcher.take().await.len(), 1);
        assert_eq!(timed.size().await.expect("size"), 1);

        clock.advance(Duration::from_secs(11));
        let report = sweeper.sweep().await.expect("sweep");
        assert_eq!(report.attempted, 1);
        let chunks = dispatcher.take().await;
        assert_eq!(chunks[0].consumer, "timed");
        assert_eq!(chunks[0].messages, vec![json!("c")]);
    }

    #[tokio::test]
    async fn test_sweep_continues_past_failing_group() {
        let clock = Arc::new(ManualClock::starting_now());
        let dispatcher = Arc::new(RejectingDispatcher {
            rejected_consumer: "a",
            inner: CollectingDispatcher::new(),
        });
        let consumers = ConsumerRegistry::new()
            .with_consumer("a", ConsumerSettings::new().with_flush_threshold(1))
            .with_consumer("b", ConsumerSettings::new().with_flush_threshold(1));
        let grouping = Grouping::new(
            EngineConfig::default(),
            consumers,
            Arc::new(InMemoryGroupStore::with_clock("batching", clock.clone())),
            dispatcher.clone(),
        )
        .with_clock(clock);

        grouping
            .group("a", "q")
            .expect("group")
            .add(&json!("x"))
            .await
            .expect("add");
        let healthy = grouping.group("b", "q").expect("group");
        healthy.add(&json!("y")).await.expect("add");

        let report = FlushSweeper::new(grouping).sweep().await.expect("sweep");
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.messages, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "a:q");

        let chunks = dispatcher.inner.chunks().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].consumer, "b");
        assert_eq!(chunks[0].messages, vec![json!("y")]);
        assert_eq!(healthy.size().await.expect("size"), 0);
    }

    #[tokio::test]
    async fn test_force_flush_ignores_eligibility() {
        let (grouping, dispatcher, _) = setup();
        grouping
            .group("timed", "default")
            .expect("group")
            .add(&json!("c"))
            .await
            .expect("add");

        let sweeper = FlushSweeper::new(grouping);
        assert_eq!(sweeper.sweep().await.expect("sweep").attempted, 0);

        let report = sweeper.force_flush().await.expect("force flush");
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(dispatcher.chunks().await.len(), 1);
    }
}
