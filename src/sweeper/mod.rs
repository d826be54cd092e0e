//! Periodic work over all groups.
//!
//! - [`FlushSweeper`]: flushes every eligible group
//! - [`RevivalSweeper`]: returns expired pending dispatches to their groups
//! - [`Supervisor`]: runs both sweepers as cancellable tokio tasks
//!
//! A sweep never aborts because one group failed; failures are collected in
//! the [`SweepReport`] and the sweep moves on to the next group.

pub mod flusher;
pub mod reviver;
pub mod supervisor;

pub use flusher::FlushSweeper;
pub use reviver::RevivalSweeper;
pub use supervisor::{Supervisor, SupervisorError, SupervisorStats};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Groups the sweep acted on.
    pub attempted: usize,
    /// Groups where the action completed.
    pub succeeded: usize,
    /// Messages moved (dispatched by a flush sweep, requeued by a revival sweep).
    pub messages: usize,
    /// Group name and error message for each failed group.
    pub failures: Vec<(String, String)>,
}

impl SweepReport {
    pub fn record_failure(&mut self, group: impl Into<String>, error: impl ToString) {
        self.failures.push((group.into(), error.to_string()));
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}
