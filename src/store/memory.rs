//! Single-process group store.
//!
//! Mirrors the semantics of the Redis scripts exactly, with every operation
//! running under one async mutex. Useful for tests and for embedding the
//! engine in a process that does not share groups with anyone else.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{chrono_duration, GroupStore, KeySpace, PendingDispatch, PendingEntry};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct GroupState {
    messages: VecDeque<String>,
    unique: HashSet<String>,
    pending_unique: HashSet<String>,
    last_flush: Option<DateTime<Utc>>,
    lock_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct PendingState {
    group: String,
    extracted_at: DateTime<Utc>,
    seq: u64,
    messages: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    registry: BTreeSet<String>,
    groups: HashMap<String, GroupState>,
    pending: BTreeMap<String, PendingState>,
    pending_seq: HashMap<String, u64>,
}

/// In-memory [`GroupStore`].
pub struct InMemoryGroupStore {
    keys: KeySpace,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl InMemoryGroupStore {
    /// Creates an empty store using the system clock for lock expiry.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::with_clock(namespace, Arc::new(SystemClock))
    }

    /// Creates an empty store whose locks expire according to `clock`.
    pub fn with_clock(namespace: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: KeySpace::new(namespace),
            clock,
            state: Mutex::new(State::default()),
        }
    }
}

impl std::fmt::Debug for InMemoryGroupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryGroupStore")
            .field("namespace", &self.keys.namespace())
            .finish()
    }
}

#[async_trait]
impl GroupStore for InMemoryGroupStore {
    async fn push(
        &self,
        name: &str,
        message: &str,
        remember_unique: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.registry.insert(name.to_string());
        let group = state.groups.entry(name.to_string()).or_default();
        group.messages.push_back(message.to_string());
        if remember_unique {
            group.unique.insert(message.to_string());
        }
        Ok(())
    }

    async fn push_bulk(
        &self,
        name: &str,
        messages: &[String],
        remember_unique: bool,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.registry.insert(name.to_string());
        let group = state.groups.entry(name.to_string()).or_default();

        let mut appended = 0;
        for message in messages {
            if remember_unique {
                if group.unique.contains(message) || group.pending_unique.contains(message) {
                    continue;
                }
                group.unique.insert(message.clone());
            }
            group.messages.push_back(message.clone());
            appended += 1;
        }
        Ok(appended)
    }

    async fn is_enqueued(&self, name: &str, message: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .groups
            .get(name)
            .map(|g| g.unique.contains(message) || g.pending_unique.contains(message))
            .unwrap_or(false))
    }

    async fn size(&self, name: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.groups.get(name).map(|g| g.messages.len()).unwrap_or(0))
    }

    async fn groups(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.registry.iter().cloned().collect())
    }

    async fn pluck(&self, name: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(group) = state.groups.get_mut(name) else {
            return Ok(Vec::new());
        };

        let take = limit.min(group.messages.len());
        let values: Vec<String> = group.messages.drain(..take).collect();
        for value in &values {
            group.unique.remove(value);
        }
        Ok(values)
    }

    async fn reliable_pluck(
        &self,
        name: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingDispatch>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(group) = state.groups.get_mut(name) else {
            return Ok(None);
        };

        let take = limit.min(group.messages.len());
        if take == 0 {
            return Ok(None);
        }

        let values: Vec<String> = group.messages.drain(..take).collect();
        for value in &values {
            if group.unique.remove(value) {
                group.pending_unique.insert(value.clone());
            }
        }

        let seq = {
            let counter = state.pending_seq.entry(name.to_string()).or_default();
            *counter += 1;
            *counter
        };
        let id = self.keys.pending(name, seq);
        state.pending.insert(
            id.clone(),
            PendingState {
                group: name.to_string(),
                extracted_at: now,
                seq,
                messages: values.clone(),
            },
        );

        Ok(Some(PendingDispatch {
            id,
            messages: values,
        }))
    }

    async fn remove_from_pending(&self, name: &str, pending_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let Some(pending) = state.pending.remove(pending_id) else {
            return Ok(());
        };
        if let Some(group) = state.groups.get_mut(name) {
            for message in &pending.messages {
                group.pending_unique.remove(message);
            }
        }
        Ok(())
    }

    async fn requeue_expired(
        &self,
        name: &str,
        dedup_aware: bool,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let cutoff = now - chrono_duration(ttl);
        let mut state = self.state.lock().await;

        let mut expired: Vec<(DateTime<Utc>, u64, String)> = state
            .pending
            .iter()
            .filter(|(_, p)| p.group == name && p.extracted_at <= cutoff)
            .map(|(id, p)| (p.extracted_at, p.seq, id.clone()))
            .collect();
        // Newest first, so the oldest dispatch ends up at the head.
        expired.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));

        let mut requeued = 0;
        for (_, _, id) in expired {
            let Some(pending) = state.pending.remove(&id) else {
                continue;
            };
            let group = state.groups.entry(name.to_string()).or_default();

            // Walk backwards so pushing onto the front keeps the original order.
            for message in pending.messages.into_iter().rev() {
                let restored = group.pending_unique.remove(&message);
                if dedup_aware && group.unique.contains(&message) {
                    continue;
                }
                if restored {
                    group.unique.insert(message.clone());
                }
                group.messages.push_front(message);
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn pending(&self, name: &str) -> Result<Vec<PendingEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut entries: Vec<PendingEntry> = state
            .pending
            .iter()
            .filter(|(_, p)| p.group == name)
            .map(|(id, p)| PendingEntry {
                id: id.clone(),
                extracted_at: p.extracted_at,
                size: p.messages.len(),
            })
            .collect();
        entries.sort_by(|a, b| {
            a.extracted_at
                .cmp(&b.extracted_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(entries)
    }

    async fn lock(&self, name: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let group = state.groups.entry(name.to_string()).or_default();

        if matches!(group.lock_expires_at, Some(expires_at) if expires_at > now) {
            return Ok(false);
        }
        group.lock_expires_at = Some(now + chrono_duration(ttl));
        Ok(true)
    }

    async fn last_flush_time(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.groups.get(name).and_then(|g| g.last_flush))
    }

    async fn set_last_flush_time(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.groups.entry(name.to_string()).or_default().last_flush = Some(at);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.registry.remove(name);

        let has_pending = state.pending.values().any(|p| p.group == name);
        let Some(group) = state.groups.get_mut(name) else {
            return Ok(());
        };
        let locked = matches!(group.lock_expires_at, Some(expires_at) if expires_at > now);

        if has_pending || locked {
            group.messages.clear();
            group.unique.clear();
            group.last_flush = None;
        } else {
            state.groups.remove(name);
            state.pending_seq.remove(name);
        }
        Ok(())
    }
}
