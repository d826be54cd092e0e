//! Command-line interface for group-queue.
//!
//! Provides commands to run the sweepers, inspect and delete groups, force
//! sweeps by hand and push test submissions.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
