//! Dispatcher that enqueues released chunks as jobs on a Redis list.
//!
//! Each chunk becomes one job envelope pushed onto `queue:{queue}`, with the
//! queue name registered in the `queues` set, which is the layout
//! Sidekiq-compatible workers poll. The first argument is the grouped marker
//! `true` so ingestion recognizes the job as already grouped and passes it
//! straight through instead of grouping it again.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Dispatcher;
use crate::error::{DispatchError, StoreError};
use crate::grouping::GroupName;

/// A job as it is written to the host queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Consumer identity (the worker class on the host side).
    pub class: String,
    pub queue: String,
    /// `[true, [message, ...]]` for released chunks.
    pub args: Vec<Value>,
    pub jid: String,
    pub created_at: f64,
    pub enqueued_at: f64,
}

impl JobEnvelope {
    pub fn new(class: impl Into<String>, queue: impl Into<String>, args: Vec<Value>) -> Self {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        Self {
            class: class.into(),
            queue: queue.into(),
            args,
            jid: Uuid::new_v4().simple().to_string(),
            created_at: now,
            enqueued_at: now,
        }
    }

    /// Wraps a chunk for `group`, tagging it with the grouped marker.
    pub fn for_chunk(group: &GroupName, chunk: Vec<Value>) -> Self {
        Self::new(
            group.consumer(),
            group.queue(),
            vec![Value::Bool(true), Value::Array(chunk)],
        )
    }

    /// The messages carried by the envelope.
    pub fn messages(&self) -> Option<&Vec<Value>> {
        self.args.get(1).and_then(Value::as_array)
    }
}

/// Pushes job envelopes onto the host's Redis queues.
#[derive(Clone)]
pub struct RedisJobDispatcher {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
}

impl RedisJobDispatcher {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Creates a dispatcher from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Key of the host list for `queue`.
    pub fn queue_key(queue: &str) -> String {
        format!("queue:{}", queue)
    }

    /// Pushes an envelope onto its queue and registers the queue.
    pub async fn enqueue(&self, envelope: &JobEnvelope) -> Result<(), DispatchError> {
        let serialized = serde_json::to_string(envelope)?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd("queues", &envelope.queue)
            .ignore()
            .lpush(Self::queue_key(&envelope.queue), serialized)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        tracing::debug!(class = %envelope.class, queue = %envelope.queue, jid = %envelope.jid, "Enqueued job");
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for RedisJobDispatcher {
    async fn dispatch(&self, group: &GroupName, chunk: Vec<Value>) -> Result<(), DispatchError> {
        self.enqueue(&JobEnvelope::for_chunk(group, chunk)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_carries_grouped_marker() {
        let group = GroupName::new("mailer", "critical").expect("valid name");
        let envelope = JobEnvelope::for_chunk(&group, vec![json!(["a", 1]), json!(["b", 2])]);

        assert_eq!(envelope.class, "mailer");
        assert_eq!(envelope.queue, "critical");
        assert_eq!(envelope.args[0], Value::Bool(true));
        assert_eq!(envelope.messages().map(Vec::len), Some(2));
        assert_eq!(envelope.jid.len(), 32);
    }

    #[test]
    fn test_envelope_serialization() {
        let group = GroupName::new("mailer", "default").expect("valid name");
        let envelope = JobEnvelope::for_chunk(&group, vec![json!(["x"])]);

        let value = serde_json::to_value(&envelope).expect("should serialize");
        assert_eq!(value["class"], "mailer");
        assert_eq!(value["args"], json!([true, [["x"]]]));
    }

    #[test]
    fn test_queue_key() {
        assert_eq!(RedisJobDispatcher::queue_key("default"), "queue:default");
    }
}
