//! Hand-off of released chunks to the host job system.
//!
//! A flush splits the extracted messages into chunks and passes each one to
//! a [`Dispatcher`]. Reliable groups may hand the same chunk over more than
//! once (after a crash between dispatch and acknowledgment), so dispatchers
//! and the jobs they create must tolerate re-delivery.
//!
//! - [`RedisJobDispatcher`]: pushes a job envelope onto the host's Redis queue
//! - [`CollectingDispatcher`]: keeps chunks in memory, for embedding and tests

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::DispatchError;
use crate::grouping::GroupName;

pub mod redis;

pub use self::redis::{JobEnvelope, RedisJobDispatcher};

/// Consumes chunks released by a flush.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Hands one chunk of messages, in group order, to the host.
    async fn dispatch(&self, group: &GroupName, chunk: Vec<Value>) -> Result<(), DispatchError>;
}

/// A chunk recorded by [`CollectingDispatcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedChunk {
    pub consumer: String,
    pub queue: String,
    pub messages: Vec<Value>,
}

/// Dispatcher that keeps every chunk in memory.
#[derive(Debug, Default)]
pub struct CollectingDispatcher {
    chunks: Mutex<Vec<DispatchedChunk>>,
}

impl CollectingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunks dispatched so far, in dispatch order.
    pub async fn chunks(&self) -> Vec<DispatchedChunk> {
        self.chunks.lock().await.clone()
    }

    /// Removes and returns the recorded chunks.
    pub async fn take(&self) -> Vec<DispatchedChunk> {
        std::mem::take(&mut *self.chunks.lock().await)
    }
}

#[async_trait]
impl Dispatcher for CollectingDispatcher {
    async fn dispatch(&self, group: &GroupName, chunk: Vec<Value>) -> Result<(), DispatchError> {
        self.chunks.lock().await.push(DispatchedChunk {
            consumer: group.consumer().to_string(),
            queue: group.queue().to_string(),
            messages: chunk,
        });
        Ok(())
    }
}
