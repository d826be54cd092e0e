//! group-queue: Redis-backed message grouping.
//!
//! Producers add messages to named groups; a periodic sweeper releases a
//! group to the host job queue in chunks once it reaches its size threshold
//! or its flush interval elapses. Reliable groups park extracted messages in
//! a pending dispatch until the host accepted them, and a revival sweeper
//! returns dispatches that were never acknowledged.

pub mod cli;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod grouping;
pub mod ingest;
pub mod metrics;
pub mod store;
pub mod sweeper;

// Re-export commonly used types
pub use config::{ConsumerRegistry, ConsumerSettings, EngineConfig};
pub use error::{DispatchError, GroupError, StoreError};
pub use grouping::{FlushOutcome, Group, GroupName, Grouping};
