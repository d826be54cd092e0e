//! Runs the sweepers on timers.
//!
//! The supervisor owns two long-lived tokio tasks:
//!
//! - a flush task ticking every `poll_interval`
//! - a revival task ticking every `revival_interval`, only spawned when some
//!   consumer (or the engine default) uses reliable extraction
//!
//! Both tasks listen on a broadcast shutdown channel and finish their current
//! sweep before stopping.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{FlushSweeper, RevivalSweeper, SweepReport};
use crate::error::GroupError;
use crate::grouping::Grouping;

/// Errors that can occur while starting or stopping the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Supervisor is already running.
    #[error("Supervisor is already running")]
    AlreadyRunning,

    /// Supervisor is not running.
    #[error("Supervisor is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Counters over the supervisor's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub flush_sweeps: u64,
    pub revival_sweeps: u64,
    pub messages_dispatched: u64,
    pub messages_revived: u64,
    /// Per-group failures plus sweeps that failed outright.
    pub failures: u64,
}

/// Shared state for tracking supervisor statistics.
#[derive(Default)]
struct SharedSweepStats {
    flush_sweeps: AtomicU64,
    revival_sweeps: AtomicU64,
    messages_dispatched: AtomicU64,
    messages_revived: AtomicU64,
    failures: AtomicU64,
}

impl SharedSweepStats {
    fn record_flush(&self, report: &SweepReport) {
        self.flush_sweeps.fetch_add(1, Ordering::SeqCst);
        self.messages_dispatched
            .fetch_add(report.messages as u64, Ordering::SeqCst);
        self.failures
            .fetch_add(report.failures.len() as u64, Ordering::SeqCst);
    }

    fn record_revival(&self, report: &SweepReport) {
        self.revival_sweeps.fetch_add(1, Ordering::SeqCst);
        self.messages_revived
            .fetch_add(report.messages as u64, Ordering::SeqCst);
        self.failures
            .fetch_add(report.failures.len() as u64, Ordering::SeqCst);
    }

    fn record_sweep_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn to_stats(&self) -> SupervisorStats {
        SupervisorStats {
            flush_sweeps: self.flush_sweeps.load(Ordering::SeqCst),
            revival_sweeps: self.revival_sweeps.load(Ordering::SeqCst),
            messages_dispatched: self.messages_dispatched.load(Ordering::SeqCst),
            messages_revived: self.messages_revived.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }
}

/// Which sweep a task runs.
#[derive(Debug, Clone, Copy)]
enum SweepKind {
    Flush,
    Revival,
}

impl SweepKind {
    fn as_str(&self) -> &'static str {
        match self {
            SweepKind::Flush => "flush",
            SweepKind::Revival => "revival",
        }
    }
}

/// Periodic driver for the flush and revival sweepers.
pub struct Supervisor {
    grouping: Grouping,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedSweepStats>,
    is_running: AtomicBool,
}

impl Supervisor {
    pub fn new(grouping: Grouping) -> Self {
        // Only ever sent once.
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            grouping,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedSweepStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns the sweep tasks.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::AlreadyRunning` if the tasks are already running.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyRunning);
        }

        let config = self.grouping.config();
        let poll_interval = config.poll_interval;
        let revival_interval = config.revival_interval;

        self.spawn(SweepKind::Flush, poll_interval);

        let reliable = self.grouping.reliability_in_use();
        if reliable {
            self.spawn(SweepKind::Revival, revival_interval);
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            poll_interval = ?poll_interval,
            revival = reliable,
            "Supervisor started"
        );
        Ok(())
    }

    fn spawn(&mut self, kind: SweepKind, period: Duration) {
        let task = SweepTask {
            kind,
            period,
            grouping: self.grouping.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            stats: Arc::clone(&self.stats),
        };
        self.handles.push(tokio::spawn(task.run()));
    }

    /// Signals the sweep tasks to stop and waits for them.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::ShutdownTimeout` if the tasks do not stop
    /// within the configured shutdown timeout.
    pub async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(SupervisorError::NotRunning);
        }

        info!("Initiating supervisor shutdown");

        // Tasks that already stopped have dropped their receivers.
        let _ = self.shutdown_tx.send(());

        let timeout = self.grouping.config().shutdown_timeout;
        let handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
        let result = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(joined) => {
                for joined in joined {
                    if let Err(e) = joined {
                        error!(error = %e, "Sweep task panicked during shutdown");
                    }
                }
                info!("Supervisor shutdown complete");
                Ok(())
            }
            Err(_) => Err(SupervisorError::ShutdownTimeout(timeout)),
        }
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats.to_stats()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Number of spawned sweep tasks.
    pub fn num_tasks(&self) -> usize {
        self.handles.len()
    }
}

struct SweepTask {
    kind: SweepKind,
    period: Duration,
    grouping: Grouping,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedSweepStats>,
}

impl SweepTask {
    async fn run(self) {
        let SweepTask {
            kind,
            period,
            grouping,
            mut shutdown_rx,
            stats,
        } = self;
        info!(sweep = kind.as_str(), period = ?period, "Sweep task started");

        let flusher = FlushSweeper::new(grouping.clone());
        let reviver = RevivalSweeper::new(grouping);

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(sweep = kind.as_str(), "Sweep task received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let result = match kind {
                        SweepKind::Flush => flusher.sweep().await,
                        SweepKind::Revival => reviver.sweep().await,
                    };
                    record(kind, &stats, result);
                }
            }
        }

        info!(sweep = kind.as_str(), "Sweep task stopped");
    }
}

fn record(kind: SweepKind, stats: &SharedSweepStats, result: Result<SweepReport, GroupError>) {
    match result {
        Ok(report) => {
            if report.has_failures() {
                warn!(
                    sweep = kind.as_str(),
                    failures = report.failures.len(),
                    "Sweep finished with failures"
                );
            } else {
                debug!(
                    sweep = kind.as_str(),
                    groups = report.attempted,
                    messages = report.messages,
                    "Sweep finished"
                );
            }
            match kind {
                SweepKind::Flush => stats.record_flush(&report),
                SweepKind::Revival => stats.record_revival(&report),
            }
        }
        Err(e) => {
            error!(sweep = kind.as_str(), error = %e, "Sweep failed");
            stats.record_sweep_failure();
        }
    }
}
