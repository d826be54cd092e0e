//! Storage primitives for groups.
//!
//! Every operation the grouping engine performs against shared state goes
//! through the [`GroupStore`] trait. Each method is atomic with respect to
//! concurrent callers: the Redis implementation uses `MULTI` pipelines and
//! server-side Lua scripts, the in-memory implementation a single async mutex.
//!
//! # Key layout
//!
//! For a namespace `ns` and a group `consumer:queue`:
//!
//! ```text
//! {ns}:batches                                  set   - group registry
//! {ns}:{group}                                  list  - live messages (FIFO)
//! {ns}:{group}:unique_messages                  set   - fingerprints of live messages
//! {ns}:{group}:pending_unique_messages          set   - fingerprints of pending messages
//! {ns}:{group}:pending_jobs                     zset  - pending registry (score = unix secs)
//! {ns}:{group}:pending_seq                      str   - pending dispatch counter
//! {ns}:{group}:pending:{seq:020}                list  - one pending dispatch
//! {ns}:last_execution_time:{group}              str   - last flush time (RFC 3339)
//! {ns}:lock:{group}                             str   - flush lock with expiry
//! ```
//!
//! Pending dispatches registered in the same second share a score, and Redis
//! orders equal scores by member. The zero-padded sequence in the pending key
//! makes that order the extraction order.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crate::error::StoreError;

pub mod memory;
pub mod redis;

pub use memory::InMemoryGroupStore;
pub use self::redis::RedisGroupStore;

/// Messages extracted by one reliable pluck, held until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDispatch {
    /// Key of the pending list; used to acknowledge it.
    pub id: String,
    /// Extracted messages in their original order.
    pub messages: Vec<String>,
}

/// An open pending dispatch as seen in the pending registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub extracted_at: DateTime<Utc>,
    pub size: usize,
}

/// Atomic primitives over groups.
///
/// `name` is always the rendered group name (`consumer:queue`) and messages
/// are serialized JSON. The serialized message doubles as its fingerprint.
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Registers the group, appends the message and optionally remembers its fingerprint.
    async fn push(&self, name: &str, message: &str, remember_unique: bool)
        -> Result<(), StoreError>;

    /// Appends a batch in order. With `remember_unique`, messages already known
    /// (queued or pending) or repeated within the batch are skipped.
    ///
    /// Returns the number of messages appended.
    async fn push_bulk(
        &self,
        name: &str,
        messages: &[String],
        remember_unique: bool,
    ) -> Result<usize, StoreError>;

    /// Whether the fingerprint is held by the group or one of its pending dispatches.
    async fn is_enqueued(&self, name: &str, message: &str) -> Result<bool, StoreError>;

    /// Number of live messages in the group.
    async fn size(&self, name: &str) -> Result<usize, StoreError>;

    /// Names in the group registry, sorted.
    async fn groups(&self) -> Result<Vec<String>, StoreError>;

    /// Pops up to `limit` messages from the head and forgets their fingerprints.
    async fn pluck(&self, name: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Moves up to `limit` messages from the head into a new pending dispatch
    /// registered at `now`. Returns `None` when the group is empty.
    async fn reliable_pluck(
        &self,
        name: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingDispatch>, StoreError>;

    /// Acknowledges a pending dispatch: drops its list, registry entry and fingerprints.
    async fn remove_from_pending(&self, name: &str, pending_id: &str) -> Result<(), StoreError>;

    /// Returns pending dispatches extracted at or before `now - ttl` to the head
    /// of the group, in their original order.
    ///
    /// With `dedup_aware`, a message whose fingerprint is already queued is
    /// dropped instead. Returns the number of messages requeued.
    async fn requeue_expired(
        &self,
        name: &str,
        dedup_aware: bool,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Open pending dispatches of the group, oldest first.
    async fn pending(&self, name: &str) -> Result<Vec<PendingEntry>, StoreError>;

    /// Takes the flush lock if nobody holds it. The lock expires after `ttl`.
    async fn lock(&self, name: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn last_flush_time(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn set_last_flush_time(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Removes the group's list, fingerprints, last-flush record and registry
    /// entry. Open pending dispatches are left for revival.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

/// Builds the keys used for a namespace.
#[derive(Debug, Clone)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn registry(&self) -> String {
        format!("{}:batches", self.namespace)
    }

    pub fn queue(&self, name: &str) -> String {
        format!("{}:{}", self.namespace, name)
    }

    pub fn unique(&self, name: &str) -> String {
        format!("{}:{}:unique_messages", self.namespace, name)
    }

    pub fn pending_unique(&self, name: &str) -> String {
        format!("{}:{}:pending_unique_messages", self.namespace, name)
    }

    pub fn pending_registry(&self, name: &str) -> String {
        format!("{}:{}:pending_jobs", self.namespace, name)
    }

    /// Counter behind the pending dispatch keys. Survives `delete`, since
    /// pending dispatches do too.
    pub fn pending_seq(&self, name: &str) -> String {
        format!("{}:{}:pending_seq", self.namespace, name)
    }

    /// Key of the pending dispatch numbered `seq`. Keys sort in `seq` order.
    pub fn pending(&self, name: &str, seq: u64) -> String {
        format!("{}:{}:pending:{:020}", self.namespace, name, seq)
    }

    pub fn last_flush(&self, name: &str) -> String {
        format!("{}:last_execution_time:{}", self.namespace, name)
    }

    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{}", self.namespace, name)
    }
}

/// Converts a std duration into a chrono one for timestamp arithmetic.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}
