//! Error types for group-queue operations.
//!
//! Defines error types for each subsystem:
//! - Store access (Redis or in-memory)
//! - Handing released chunks to the host dispatch system
//! - Group operations (adding, flushing, reviving)

use thiserror::Error;

/// Errors that can occur while talking to the group store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis command or script failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store returned something the engine cannot interpret.
    #[error("Unexpected reply from store: {0}")]
    UnexpectedReply(String),
}

/// Errors that can occur while handing a chunk to the host dispatch system.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Failed to serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Dispatch rejected for '{group}': {reason}")]
    Rejected { group: String, reason: String },
}

/// Errors that can occur during group operations.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid bulk input: {0}")]
    InvalidBulkInput(String),

    #[error("Invalid group name '{name}': {reason}")]
    InvalidGroupName { name: String, reason: String },
}
