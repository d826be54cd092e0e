//! Redis-backed group store.
//!
//! Single-key operations are plain commands. Anything that touches more than
//! one key (list + fingerprints + registry) runs either as a `MULTI` pipeline
//! or as a Lua script, so a concurrent pluck and push can never interleave
//! halfway through.
//!
//! The scripts only rely on commands available since Redis 2.6 (`LPOP`
//! without a count, `RPOP`, `LPUSH`), so they run against old servers too.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{GroupStore, KeySpace, PendingDispatch, PendingEntry};
use crate::error::StoreError;

/// Appends a batch, skipping fingerprints already known when dedup is on.
///
/// KEYS: registry, queue, unique, pending_unique
/// ARGV: group name, remember_unique ('1' / '0'), messages...
const PUSH_BULK_SCRIPT: &str = r#"
local registry = KEYS[1]
local queue = KEYS[2]
local unique = KEYS[3]
local pending_unique = KEYS[4]
local remember_unique = ARGV[2] == '1'

local appended = 0
for i = 3, #ARGV do
  local message = ARGV[i]
  local known = false
  if remember_unique then
    known = redis.call('sismember', unique, message) == 1
      or redis.call('sismember', pending_unique, message) == 1
  end
  if not known then
    redis.call('rpush', queue, message)
    if remember_unique then
      redis.call('sadd', unique, message)
    end
    appended = appended + 1
  end
end

redis.call('sadd', registry, ARGV[1])
return appended
"#;

/// Pops up to ARGV[1] messages from the head and forgets their fingerprints.
///
/// KEYS: queue, unique
const PLUCK_SCRIPT: &str = r#"
local queue = KEYS[1]
local unique = KEYS[2]
local limit = tonumber(ARGV[1])

local values = {}
for i = 1, limit do
  local value = redis.call('lpop', queue)
  if not value then
    break
  end
  values[#values + 1] = value
  redis.call('srem', unique, value)
end
return values
"#;

/// Moves up to ARGV[1] messages into a pending list registered at ARGV[2].
///
/// KEYS: queue, unique, pending_unique, pending_registry, pending
const RELIABLE_PLUCK_SCRIPT: &str = r#"
local queue = KEYS[1]
local unique = KEYS[2]
local pending_unique = KEYS[3]
local pending_registry = KEYS[4]
local pending = KEYS[5]
local limit = tonumber(ARGV[1])
local now = tonumber(ARGV[2])

local values = {}
for i = 1, limit do
  local value = redis.call('lpop', queue)
  if not value then
    break
  end
  redis.call('rpush', pending, value)
  if redis.call('srem', unique, value) == 1 then
    redis.call('sadd', pending_unique, value)
  end
  values[#values + 1] = value
end

if #values > 0 then
  redis.call('zadd', pending_registry, now, pending)
end
return values
"#;

/// Acknowledges a pending dispatch.
///
/// KEYS: pending, pending_registry, pending_unique
const REMOVE_PENDING_SCRIPT: &str = r#"
local pending = KEYS[1]
local pending_registry = KEYS[2]
local pending_unique = KEYS[3]

local values = redis.call('lrange', pending, 0, -1)
for _, value in ipairs(values) do
  redis.call('srem', pending_unique, value)
end
redis.call('del', pending)
redis.call('zrem', pending_registry, pending)
return #values
"#;

/// Returns one pending dispatch to the head of its group, tail first so the
/// original order is kept.
///
/// KEYS: pending, queue, pending_registry, unique, pending_unique
/// ARGV: dedup_aware ('1' / '0')
const REQUEUE_SCRIPT: &str = r#"
local pending = KEYS[1]
local queue = KEYS[2]
local pending_registry = KEYS[3]
local unique = KEYS[4]
local pending_unique = KEYS[5]
local dedup_aware = ARGV[1] == '1'

local requeued = 0
while true do
  local message = redis.call('rpop', pending)
  if not message then
    break
  end
  local restored = redis.call('srem', pending_unique, message) == 1
  local fresher = dedup_aware and redis.call('sismember', unique, message) == 1
  if not fresher then
    redis.call('lpush', queue, message)
    if restored then
      redis.call('sadd', unique, message)
    end
    requeued = requeued + 1
  end
end
redis.call('zrem', pending_registry, pending)
return requeued
"#;

struct Scripts {
    push_bulk: Script,
    pluck: Script,
    reliable_pluck: Script,
    remove_pending: Script,
    requeue: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            push_bulk: Script::new(PUSH_BULK_SCRIPT),
            pluck: Script::new(PLUCK_SCRIPT),
            reliable_pluck: Script::new(RELIABLE_PLUCK_SCRIPT),
            remove_pending: Script::new(REMOVE_PENDING_SCRIPT),
            requeue: Script::new(REQUEUE_SCRIPT),
        }
    }
}

/// Group store backed by Redis.
pub struct RedisGroupStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    keys: KeySpace,
    scripts: Scripts,
}

impl RedisGroupStore {
    /// Connects to Redis and creates a store under `namespace`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, namespace))
    }

    /// Creates a store from an existing ConnectionManager.
    ///
    /// Useful when sharing a connection with the dispatcher.
    pub fn from_connection(redis: ConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            keys: KeySpace::new(namespace),
            scripts: Scripts::new(),
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn timestamp_from_score(score: f64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp(score as i64, 0)
        .ok_or_else(|| StoreError::UnexpectedReply(format!("invalid pending score {}", score)))
}

#[async_trait]
impl GroupStore for RedisGroupStore {
    async fn push(
        &self,
        name: &str,
        message: &str,
        remember_unique: bool,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(self.keys.registry(), name)
            .ignore()
            .rpush(self.keys.queue(name), message)
            .ignore();
        if remember_unique {
            pipe.sadd(self.keys.unique(name), message).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn push_bulk(
        &self,
        name: &str,
        messages: &[String],
        remember_unique: bool,
    ) -> Result<usize, StoreError> {
        if messages.is_empty() {
            return Ok(0);
        }

        let mut conn = self.redis.clone();
        let mut invocation = self.scripts.push_bulk.prepare_invoke();
        invocation
            .key(self.keys.registry())
            .key(self.keys.queue(name))
            .key(self.keys.unique(name))
            .key(self.keys.pending_unique(name))
            .arg(name)
            .arg(flag(remember_unique));
        for message in messages {
            invocation.arg(message.as_str());
        }

        let appended: usize = invocation.invoke_async(&mut conn).await?;
        Ok(appended)
    }

    async fn is_enqueued(&self, name: &str, message: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();

        let (queued, pending): (bool, bool) = redis::pipe()
            .sismember(self.keys.unique(name), message)
            .sismember(self.keys.pending_unique(name), message)
            .query_async(&mut conn)
            .await?;

        Ok(queued || pending)
    }

    async fn size(&self, name: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.keys.queue(name)).await?;
        Ok(len)
    }

    async fn groups(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let mut names: Vec<String> = conn.smembers(self.keys.registry()).await?;
        names.sort();
        Ok(names)
    }

    async fn pluck(&self, name: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let values: Vec<String> = self
            .scripts
            .pluck
            .key(self.keys.queue(name))
            .key(self.keys.unique(name))
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn reliable_pluck(
        &self,
        name: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingDispatch>, StoreError> {
        let mut conn = self.redis.clone();
        let seq: u64 = conn.incr(self.keys.pending_seq(name), 1).await?;
        let pending_id = self.keys.pending(name, seq);

        let values: Vec<String> = self
            .scripts
            .reliable_pluck
            .key(self.keys.queue(name))
            .key(self.keys.unique(name))
            .key(self.keys.pending_unique(name))
            .key(self.keys.pending_registry(name))
            .key(&pending_id)
            .arg(limit)
            .arg(now.timestamp())
            .invoke_async(&mut conn)
            .await?;

        if values.is_empty() {
            return Ok(None);
        }

        Ok(Some(PendingDispatch {
            id: pending_id,
            messages: values,
        }))
    }

    async fn remove_from_pending(&self, name: &str, pending_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        self.scripts
            .remove_pending
            .key(pending_id)
            .key(self.keys.pending_registry(name))
            .key(self.keys.pending_unique(name))
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue_expired(
        &self,
        name: &str,
        dedup_aware: bool,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let cutoff = now.timestamp() - ttl.as_secs() as i64;

        let expired: Vec<String> = conn
            .zrangebyscore(self.keys.pending_registry(name), "-inf", cutoff)
            .await?;

        // Ties on the score come back in key order, which is extraction order.
        // Newest first, so the oldest dispatch ends up at the head.
        let mut requeued = 0;
        for pending_id in expired.into_iter().rev() {
            let count: usize = self
                .scripts
                .requeue
                .key(&pending_id)
                .key(self.keys.queue(name))
                .key(self.keys.pending_registry(name))
                .key(self.keys.unique(name))
                .key(self.keys.pending_unique(name))
                .arg(flag(dedup_aware))
                .invoke_async(&mut conn)
                .await?;
            requeued += count;
        }

        Ok(requeued)
    }

    async fn pending(&self, name: &str) -> Result<Vec<PendingEntry>, StoreError> {
        let mut conn = self.redis.clone();
        let entries: Vec<(String, f64)> = conn
            .zrange_withscores(self.keys.pending_registry(name), 0, -1)
            .await?;

        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for (id, _) in &entries {
            pipe.llen(id);
        }
        let sizes: Vec<usize> = pipe.query_async(&mut conn).await?;

        entries
            .into_iter()
            .zip(sizes)
            .map(|((id, score), size)| {
                Ok(PendingEntry {
                    id,
                    extracted_at: timestamp_from_score(score)?,
                    size,
                })
            })
            .collect()
    }

    async fn lock(&self, name: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        // SET NX PX replies OK when the lock was taken and nil otherwise.
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.keys.lock(name))
            .arg("true")
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn last_flush_time(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(self.keys.last_flush(name)).await?;

        match raw {
            Some(s) => {
                let parsed = DateTime::parse_from_rfc3339(&s).map_err(|e| {
                    StoreError::UnexpectedReply(format!("invalid last flush time '{}': {}", s, e))
                })?;
                Ok(Some(parsed.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    async fn set_last_flush_time(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(self.keys.last_flush(name), at.to_rfc3339())
            .await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(self.keys.last_flush(name))
            .del(self.keys.queue(name))
            .del(self.keys.unique(name))
            .srem(self.keys.registry(), name);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }
}
