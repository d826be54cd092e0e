//! A single group and everything that can happen to it.
//!
//! A group moves through these states:
//!
//! ```text
//! EMPTY -> ACCUMULATING -> ELIGIBLE (overflow | time) -> EXTRACTING (locked)
//!       -> DISPATCHED                 (plain)
//!       -> DISPATCH_PENDING -> acked  (reliable; or revived after pending_ttl)
//!       -> EMPTY | ACCUMULATING
//! ```
//!
//! `DISPATCH_PENDING` is only visible through the pending registry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::GroupName;
use crate::clock::Clock;
use crate::config::GroupPolicy;
use crate::dispatch::Dispatcher;
use crate::error::GroupError;
use crate::metrics::MetricsCollector;
use crate::store::{chrono_duration, GroupStore, PendingEntry};

/// Largest slice handed to a single bulk push.
pub const BULK_CHUNK_SIZE: usize = 1000;

/// How a group extracts messages on flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
    /// Messages leave the store as soon as they are plucked.
    Plain,
    /// Messages are parked in a pending dispatch until the host accepted them.
    Reliable,
}

impl GroupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupMode::Plain => "plain",
            GroupMode::Reliable => "reliable",
        }
    }
}

/// Result of [`Group::flush`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another flush holds the lock; nothing was done.
    Locked,
    /// The lock was taken but there was nothing to extract.
    Empty,
    /// Messages were extracted and dispatched. `pending_id` names the
    /// acknowledged pending dispatch of a reliable flush.
    Dispatched {
        messages: usize,
        chunks: usize,
        pending_id: Option<String>,
    },
}

/// One named group bound to a store, a dispatcher and a policy.
///
/// Holds no group state of its own; every call reads the store.
pub struct Group {
    name: GroupName,
    key: String,
    policy: GroupPolicy,
    store: Arc<dyn GroupStore>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
}

impl Group {
    pub fn new(
        name: GroupName,
        policy: GroupPolicy,
        store: Arc<dyn GroupStore>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key: name.to_string(),
            name,
            policy,
            store,
            dispatcher,
            clock,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn name(&self) -> &GroupName {
        &self.name
    }

    pub fn consumer(&self) -> &str {
        self.name.consumer()
    }

    pub fn queue(&self) -> &str {
        self.name.queue()
    }

    pub fn policy(&self) -> &GroupPolicy {
        &self.policy
    }

    pub fn mode(&self) -> GroupMode {
        if self.policy.reliable {
            GroupMode::Reliable
        } else {
            GroupMode::Plain
        }
    }

    /// Adds one message. In dedup mode a message that is already waiting
    /// (queued or pending) is dropped silently.
    ///
    /// Returns whether the message was added.
    pub async fn add(&self, message: &Value) -> Result<bool, GroupError> {
        let serialized = serde_json::to_string(message)?;

        if self.policy.dedup && self.store.is_enqueued(&self.key, &serialized).await? {
            debug!(group = %self.name, "Dropping duplicate message");
            self.metrics.record_grouped(self.consumer(), 0, 1);
            return Ok(false);
        }

        self.store
            .push(&self.key, &serialized, self.policy.dedup)
            .await?;
        self.metrics.record_grouped(self.consumer(), 1, 0);
        Ok(true)
    }

    /// Merges an array of messages into the group.
    ///
    /// `args` must hold exactly one element, a JSON array whose items are the
    /// messages. Anything else is rejected before the store is touched.
    ///
    /// Returns the number of messages appended.
    pub async fn add_bulk(&self, args: &[Value]) -> Result<usize, GroupError> {
        if args.len() != 1 {
            return Err(GroupError::InvalidBulkInput(format!(
                "received {} arguments, expected a single array of messages",
                args.len()
            )));
        }

        let Some(items) = args[0].as_array() else {
            return Err(GroupError::InvalidBulkInput(format!(
                "received {}, expected an array of messages",
                json_type_name(&args[0])
            )));
        };

        let serialized = items
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        let mut appended = 0;
        for slice in serialized.chunks(BULK_CHUNK_SIZE) {
            appended += self
                .store
                .push_bulk(&self.key, slice, self.policy.dedup)
                .await?;
        }

        self.metrics
            .record_grouped(self.consumer(), appended, items.len() - appended);
        debug!(group = %self.name, offered = items.len(), appended, "Merged messages");
        Ok(appended)
    }

    /// Number of messages waiting in the group.
    pub async fn size(&self) -> Result<usize, GroupError> {
        Ok(self.store.size(&self.key).await?)
    }

    /// Open pending dispatches, oldest first.
    pub async fn pending(&self) -> Result<Vec<PendingEntry>, GroupError> {
        Ok(self.store.pending(&self.key).await?)
    }

    pub async fn last_flush_time(&self) -> Result<Option<DateTime<Utc>>, GroupError> {
        Ok(self.store.last_flush_time(&self.key).await?)
    }

    /// When the interval next makes the group eligible, if an interval is set
    /// and the group has been observed before.
    pub async fn next_flush_time(&self) -> Result<Option<DateTime<Utc>>, GroupError> {
        let Some(interval) = self.policy.flush_interval else {
            return Ok(None);
        };
        Ok(self
            .last_flush_time()
            .await?
            .map(|last| last + chrono_duration(interval)))
    }

    /// Whether the group should be flushed now, by size or by time.
    ///
    /// The first observation of a non-empty group without a recorded flush
    /// time seeds the interval clock and returns `false`.
    pub async fn could_flush(&self) -> Result<bool, GroupError> {
        let size = self.size().await?;
        self.metrics.set_group_size(&self.key, size);

        if size >= self.policy.flush_threshold {
            return Ok(true);
        }
        self.could_flush_on_time(size).await
    }

    async fn could_flush_on_time(&self, size: usize) -> Result<bool, GroupError> {
        if size == 0 {
            return Ok(false);
        }

        let now = self.clock.now();
        match self.store.last_flush_time(&self.key).await? {
            None => {
                self.store.set_last_flush_time(&self.key, now).await?;
                Ok(false)
            }
            Some(last) => Ok(match self.policy.flush_interval {
                Some(interval) => last + chrono_duration(interval) < now,
                None => false,
            }),
        }
    }

    /// Extracts up to `flush_threshold` messages and dispatches them in
    /// chunks of `dispatch_chunk_size`.
    ///
    /// In reliable mode the extracted messages stay in a pending dispatch
    /// until every chunk was dispatched; if dispatch fails they are revived
    /// once `pending_ttl` has passed. In plain mode a failed dispatch loses
    /// the extracted messages.
    pub async fn flush(&self) -> Result<FlushOutcome, GroupError> {
        let mode = self.mode();

        if !self.store.lock(&self.key, self.policy.lock_ttl).await? {
            debug!(group = %self.name, "Flush skipped, group is locked");
            self.metrics
                .record_flush(self.consumer(), mode.as_str(), "locked");
            return Ok(FlushOutcome::Locked);
        }

        let result = match mode {
            GroupMode::Plain => self.flush_plain().await,
            GroupMode::Reliable => self.flush_reliable().await,
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics
                    .record_flush(self.consumer(), mode.as_str(), "failed");
                return Err(e);
            }
        };

        match &outcome {
            FlushOutcome::Dispatched {
                messages, chunks, ..
            } => {
                self.store
                    .set_last_flush_time(&self.key, self.clock.now())
                    .await?;
                self.metrics
                    .record_flush(self.consumer(), mode.as_str(), "dispatched");
                self.metrics
                    .record_dispatch(self.consumer(), *chunks, *messages);
                info!(
                    group = %self.name,
                    mode = mode.as_str(),
                    messages = messages,
                    chunks = chunks,
                    "Flushed group"
                );
            }
            _ => {
                self.metrics
                    .record_flush(self.consumer(), mode.as_str(), "empty");
            }
        }

        Ok(outcome)
    }

    async fn flush_plain(&self) -> Result<FlushOutcome, GroupError> {
        let raw = self
            .store
            .pluck(&self.key, self.policy.flush_threshold)
            .await?;
        if raw.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let count = raw.len();
        let result = match decode_messages(&raw) {
            Ok(messages) => self.dispatch_chunks(messages).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(chunks) => Ok(FlushOutcome::Dispatched {
                messages: count,
                chunks,
                pending_id: None,
            }),
            Err(e) => {
                error!(
                    group = %self.name,
                    messages = count,
                    error = %e,
                    "Dispatch failed after plain extraction, messages are lost"
                );
                Err(e)
            }
        }
    }

    async fn flush_reliable(&self) -> Result<FlushOutcome, GroupError> {
        let Some(pending) = self
            .store
            .reliable_pluck(&self.key, self.policy.flush_threshold, self.clock.now())
            .await?
        else {
            return Ok(FlushOutcome::Empty);
        };

        let count = pending.messages.len();
        let messages = match decode_messages(&pending.messages) {
            Ok(messages) => messages,
            Err(e) => {
                // Revival brings these back and they fail here again.
                error!(
                    group = %self.name,
                    pending_id = %pending.id,
                    messages = count,
                    error = %e,
                    "Pending messages cannot be decoded and will keep failing"
                );
                return Err(e);
            }
        };

        let chunks = match self.dispatch_chunks(messages).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(
                    group = %self.name,
                    pending_id = %pending.id,
                    messages = count,
                    error = %e,
                    "Dispatch failed, messages stay pending until revived"
                );
                return Err(e);
            }
        };

        self.store
            .remove_from_pending(&self.key, &pending.id)
            .await?;

        Ok(FlushOutcome::Dispatched {
            messages: count,
            chunks,
            pending_id: Some(pending.id),
        })
    }

    async fn dispatch_chunks(&self, messages: Vec<Value>) -> Result<usize, GroupError> {
        let mut dispatched = 0;
        for chunk in messages.chunks(self.policy.dispatch_chunk_size.max(1)) {
            self.dispatcher.dispatch(&self.name, chunk.to_vec()).await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Returns expired pending dispatches to the group.
    ///
    /// Returns the number of messages requeued.
    pub async fn requeue_expired(&self) -> Result<usize, GroupError> {
        let requeued = self
            .store
            .requeue_expired(
                &self.key,
                self.policy.dedup,
                self.policy.pending_ttl,
                self.clock.now(),
            )
            .await?;

        if requeued > 0 {
            self.metrics.record_revived(self.consumer(), requeued);
            info!(group = %self.name, requeued, "Requeued expired pending messages");
        }
        Ok(requeued)
    }

    /// Removes the group. Open pending dispatches are left for revival.
    pub async fn delete(&self) -> Result<(), GroupError> {
        self.store.delete(&self.key).await?;
        info!(group = %self.name, "Deleted group");
        Ok(())
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.key)
            .field("policy", &self.policy)
            .finish()
    }
}

fn decode_messages(raw: &[String]) -> Result<Vec<Value>, GroupError> {
    raw.iter()
        .map(|s| serde_json::from_str(s).map_err(GroupError::from))
        .collect()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
