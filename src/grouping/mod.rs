//! Grouping engine: groups, their registry and the admin overview.
//!
//! [`Grouping`] is the entry point. It binds the engine configuration, the
//! consumer registry, a [`GroupStore`] and a [`Dispatcher`] together and hands
//! out [`Group`] handles. Handles are cheap and stateless; all group state
//! lives in the store.
//!
//! # Example
//!
//! ```ignore
//! use group_queue::config::{ConsumerRegistry, ConsumerSettings, EngineConfig};
//! use group_queue::grouping::Grouping;
//!
//! let consumers = ConsumerRegistry::new()
//!     .with_consumer("mailer", ConsumerSettings::new().with_flush_threshold(100));
//! let grouping = Grouping::connect(EngineConfig::from_env()?, consumers).await?;
//!
//! let group = grouping.group("mailer", "default")?;
//! group.add(&serde_json::json!(["user-1"])).await?;
//! ```

mod group;
mod name;

pub use group::{FlushOutcome, Group, GroupMode, BULK_CHUNK_SIZE};
pub use name::GroupName;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{ConsumerRegistry, EngineConfig};
use crate::dispatch::{Dispatcher, RedisJobDispatcher};
use crate::error::{GroupError, StoreError};
use crate::store::{GroupStore, RedisGroupStore};

/// Admin view of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub consumer: String,
    pub queue: String,
    pub size: usize,
    pub pending: usize,
    pub last_flush: Option<DateTime<Utc>>,
    pub next_flush: Option<DateTime<Utc>>,
}

/// The grouping engine.
#[derive(Clone)]
pub struct Grouping {
    config: Arc<EngineConfig>,
    consumers: Arc<ConsumerRegistry>,
    store: Arc<dyn GroupStore>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
}

impl Grouping {
    pub fn new(
        config: EngineConfig,
        consumers: ConsumerRegistry,
        store: Arc<dyn GroupStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            consumers: Arc::new(consumers),
            store,
            dispatcher,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for flush timing and pending expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Connects to Redis and builds an engine whose store and dispatcher share
    /// one connection.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(
        config: EngineConfig,
        consumers: ConsumerRegistry,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        info!(
            redis_url = %config.redis_url,
            namespace = %config.namespace,
            consumers = consumers.len(),
            "Connected grouping engine"
        );

        let store = Arc::new(RedisGroupStore::from_connection(
            connection.clone(),
            &config.namespace,
        ));
        let dispatcher = Arc::new(RedisJobDispatcher::from_connection(connection));
        Ok(Self::new(config, consumers, store, dispatcher))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn consumers(&self) -> &ConsumerRegistry {
        &self.consumers
    }

    pub fn store(&self) -> &Arc<dyn GroupStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Whether a revival sweeper is needed for this engine.
    pub fn reliability_in_use(&self) -> bool {
        self.consumers.reliability_in_use(&self.config)
    }

    /// Handle for the group of `consumer` on `queue`.
    pub fn group(&self, consumer: &str, queue: &str) -> Result<Group, GroupError> {
        Ok(self.group_for(GroupName::new(consumer, queue)?))
    }

    /// Handle for a group by identity, using its consumer's settings.
    pub fn group_for(&self, name: GroupName) -> Group {
        let policy = self
            .consumers
            .settings_for(name.consumer())
            .resolve(&self.config);
        Group::new(
            name,
            policy,
            self.store.clone(),
            self.dispatcher.clone(),
            self.clock.clone(),
        )
    }

    /// Every registered group. Registry entries that are not valid group
    /// names are skipped with a warning.
    pub async fn all(&self) -> Result<Vec<Group>, GroupError> {
        let names = self.store.groups().await?;
        let mut groups = Vec::with_capacity(names.len());
        for raw in names {
            match GroupName::parse(&raw) {
                Ok(name) => groups.push(self.group_for(name)),
                Err(e) => warn!(group = %raw, error = %e, "Skipping unparsable group name"),
            }
        }
        Ok(groups)
    }

    /// Summaries of every registered group, for admin tooling.
    pub async fn overview(&self) -> Result<Vec<GroupSummary>, GroupError> {
        let mut summaries = Vec::new();
        for group in self.all().await? {
            summaries.push(GroupSummary {
                name: group.name().to_string(),
                consumer: group.consumer().to_string(),
                queue: group.queue().to_string(),
                size: group.size().await?,
                pending: group.pending().await?.len(),
                last_flush: group.last_flush_time().await?,
                next_flush: group.next_flush_time().await?,
            });
        }
        Ok(summaries)
    }

    /// Deletes a group by its rendered name.
    pub async fn delete(&self, name: &str) -> Result<(), GroupError> {
        self.group_for(GroupName::parse(name)?).delete().await
    }
}

impl std::fmt::Debug for Grouping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grouping")
            .field("namespace", &self.config.namespace)
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ConsumerSettings;
    use crate::dispatch::CollectingDispatcher;
    use crate::store::InMemoryGroupStore;
    use serde_json::json;
    use std::time::Duration;

    fn engine() -> (Grouping, Arc<InMemoryGroupStore>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryGroupStore::with_clock("batching", clock.clone()));
        let consumers = ConsumerRegistry::new()
            .with_consumer("mailer", ConsumerSettings::new().with_flush_threshold(2))
            .with_consumer(
                "audit",
                ConsumerSettings::new()
                    .with_flush_interval(Duration::from_secs(60))
                    .with_reliable(true),
            );
        let grouping = Grouping::new(
            EngineConfig::default(),
            consumers,
            store.clone(),
            Arc::new(CollectingDispatcher::new()),
        )
        .with_clock(clock);
        (grouping, store)
    }

    #[tokio::test]
    async fn test_group_uses_consumer_policy() {
        let (grouping, _) = engine();

        let mailer = grouping.group("mailer", "default").expect("group");
        assert_eq!(mailer.policy().flush_threshold, 2);
        assert_eq!(mailer.mode(), GroupMode::Plain);

        let audit = grouping.group("audit", "default").expect("group");
        assert_eq!(audit.policy().flush_threshold, 1000);
        assert_eq!(audit.mode(), GroupMode::Reliable);

        assert!(grouping.reliability_in_use());
        assert!(grouping.group("bad:consumer", "q").is_err());
    }

    #[tokio::test]
    async fn test_all_skips_unparsable_names() {
        let (grouping, store) = engine();

        grouping
            .group("mailer", "default")
            .expect("group")
            .add(&json!("a"))
            .await
            .expect("add");
        store.push("garbage", "\"x\"", false).await.expect("push");

        let groups = grouping.all().await.expect("all");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name().to_string(), "mailer:default");
    }

    #[tokio::test]
    async fn test_overview_and_delete() {
        let (grouping, _) = engine();

        let audit = grouping.group("audit", "reports").expect("group");
        audit.add(&json!({"id": 1})).await.expect("add");
        audit.could_flush().await.expect("could_flush");

        let overview = grouping.overview().await.expect("overview");
        assert_eq!(overview.len(), 1);
        let summary = &overview[0];
        assert_eq!(summary.name, "audit:reports");
        assert_eq!(summary.consumer, "audit");
        assert_eq!(summary.size, 1);
        assert_eq!(summary.pending, 0);
        assert!(summary.last_flush.is_some());
        assert!(summary.next_flush.is_some());

        grouping.delete("audit:reports").await.expect("delete");
        assert!(grouping.overview().await.expect("overview").is_empty());
        assert!(grouping.delete("nocolon").await.is_err());
    }
}
