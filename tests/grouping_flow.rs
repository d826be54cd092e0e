//! End-to-end grouping flows against the in-memory store.
//!
//! Every test drives time through a `ManualClock` so interval and TTL
//! behavior is deterministic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use group_queue::clock::{Clock, ManualClock};
use group_queue::dispatch::CollectingDispatcher;
use group_queue::error::StoreError;
use group_queue::ingest::{Intercepted, Interceptor, Submission};
use group_queue::store::{GroupStore, InMemoryGroupStore, PendingDispatch, PendingEntry};
use group_queue::sweeper::{FlushSweeper, RevivalSweeper};
use group_queue::{ConsumerRegistry, ConsumerSettings, EngineConfig, FlushOutcome, Grouping};

struct Harness {
    grouping: Grouping,
    dispatcher: Arc<CollectingDispatcher>,
    clock: Arc<ManualClock>,
}

fn harness(consumers: ConsumerRegistry) -> Harness {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryGroupStore::with_clock("batching", clock.clone()));
    harness_with_store(consumers, store, clock)
}

fn harness_with_store(
    consumers: ConsumerRegistry,
    store: Arc<dyn GroupStore>,
    clock: Arc<ManualClock>,
) -> Harness {
    let dispatcher = Arc::new(CollectingDispatcher::new());
    let grouping = Grouping::new(
        EngineConfig::default().with_tests_env(true),
        consumers,
        store,
        dispatcher.clone(),
    )
    .with_clock(clock.clone());
    Harness {
        grouping,
        dispatcher,
        clock,
    }
}

/// Records the size of every bulk push before delegating, and fails
/// revival for one group when asked to.
struct CountingStore {
    inner: InMemoryGroupStore,
    bulk_pushes: Mutex<Vec<usize>>,
    broken_group: Option<&'static str>,
}

impl CountingStore {
    fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            inner: InMemoryGroupStore::with_clock("batching", clock),
            bulk_pushes: Mutex::new(Vec::new()),
            broken_group: None,
        }
    }

    fn with_broken_group(mut self, name: &'static str) -> Self {
        self.broken_group = Some(name);
        self
    }
}

#[async_trait]
impl GroupStore for CountingStore {
    async fn push(&self, name: &str, message: &str, remember_unique: bool) -> Result<(), StoreError> {
        self.inner.push(name, message, remember_unique).await
    }

    async fn push_bulk(
        &self,
        name: &str,
        messages: &[String],
        remember_unique: bool,
    ) -> Result<usize, StoreError> {
        self.bulk_pushes.lock().await.push(messages.len());
        self.inner.push_bulk(name, messages, remember_unique).await
    }

    async fn is_enqueued(&self, name: &str, message: &str) -> Result<bool, StoreError> {
        self.inner.is_enqueued(name, message).await
    }

    async fn size(&self, name: &str) -> Result<usize, StoreError> {
        self.inner.size(name).await
    }

    async fn groups(&self) -> Result<Vec<String>, StoreError> {
        self.inner.groups().await
    }

    async fn pluck(&self, name: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        self.inner.pluck(name, limit).await
    }

    async fn reliable_pluck(
        &self,
        name: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingDispatch>, StoreError> {
        self.inner.reliable_pluck(name, limit, now).await
    }

    async fn remove_from_pending(&self, name: &str, pending_id: &str) -> Result<(), StoreError> {
        self.inner.remove_from_pending(name, pending_id).await
    }

    async fn requeue_expired(
        &self,
        name: &str,
        dedup_aware: bool,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        if self.broken_group == Some(name) {
            return Err(StoreError::UnexpectedReply(format!("{} is unreadable", name)));
        }
        self.inner.requeue_expired(name, dedup_aware, ttl, now).await
    }

    async fn pending(&self, name: &str) -> Result<Vec<PendingEntry>, StoreError> {
        self.inner.pending(name).await
    }

    async fn lock(&self, name: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.inner.lock(name, ttl).await
    }

    async fn last_flush_time(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.inner.last_flush_time(name).await
    }

    async fn set_last_flush_time(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.set_last_flush_time(name, at).await
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete(name).await
    }
}

#[tokio::test]
async fn test_threshold_scenario_releases_in_order() {
    let h = harness(
        ConsumerRegistry::new()
            .with_consumer("mailer", ConsumerSettings::new().with_flush_threshold(3)),
    );
    let group = h.grouping.group("mailer", "default").expect("group");

    for m in ["m1", "m2", "m3", "m4", "m5"] {
        group.add(&json!(m)).await.expect("add");
    }
    assert!(group.could_flush().await.expect("could_flush"));

    let outcome = group.flush().await.expect("flush");
    assert_eq!(
        outcome,
        FlushOutcome::Dispatched {
            messages: 3,
            chunks: 1,
            pending_id: None,
        }
    );
    assert_eq!(group.size().await.expect("size"), 2);
    assert!(!group.could_flush().await.expect("could_flush"));

    let chunks = h.dispatcher.chunks().await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(
        chunks[0].messages,
        vec![json!("m1"), json!("m2"), json!("m3")]
    );
}

#[tokio::test]
async fn test_fifo_across_successive_flushes() {
    let h = harness(
        ConsumerRegistry::new()
            .with_consumer("mailer", ConsumerSettings::new().with_flush_threshold(4)),
    );
    let group = h.grouping.group("mailer", "default").expect("group");

    for n in 0..10 {
        group.add(&json!(n)).await.expect("add");
    }
    while group.size().await.expect("size") > 0 {
        h.clock.advance(Duration::from_secs(2));
        group.flush().await.expect("flush");
    }

    let released: Vec<Value> = h
        .dispatcher
        .chunks()
        .await
        .into_iter()
        .flat_map(|c| c.messages)
        .collect();
    let expected: Vec<Value> = (0..10).map(|n| json!(n)).collect();
    assert_eq!(released, expected);
}

#[tokio::test]
async fn test_bulk_merge_splits_into_store_slices() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(CountingStore::new(clock.clone()));
    let h = harness_with_store(
        ConsumerRegistry::new().with_consumer(
            "importer",
            ConsumerSettings::new()
                .with_flush_threshold(5000)
                .with_bulk_merge(true),
        ),
        store.clone(),
        clock,
    );
    let group = h.grouping.group("importer", "default").expect("group");

    let items: Vec<Value> = (0..1006).map(|n| json!({"id": n})).collect();
    let appended = group
        .add_bulk(&[Value::Array(items)])
        .await
        .expect("bulk");

    assert_eq!(appended, 1006);
    assert_eq!(*store.bulk_pushes.lock().await, vec![1000, 6]);
    assert_eq!(group.size().await.expect("size"), 1006);
}

#[tokio::test]
async fn test_reliable_recovery_after_crash() {
    let h = harness(ConsumerRegistry::new().with_consumer(
        "audit",
        ConsumerSettings::new()
            .with_flush_threshold(2)
            .with_dedup(true)
            .with_reliable(true)
            .with_pending_ttl(Duration::from_secs(3600)),
    ));
    let group = h.grouping.group("audit", "default").expect("group");
    group.add(&json!("x")).await.expect("add");
    group.add(&json!("y")).await.expect("add");

    // Crash after extraction: the pending dispatch is never acknowledged.
    h.grouping
        .store()
        .reliable_pluck("audit:default", 2, h.clock.now())
        .await
        .expect("pluck")
        .expect("pending dispatch");
    assert_eq!(group.size().await.expect("size"), 0);

    // Pending messages still count as enqueued for dedup.
    assert!(!group.add(&json!("x")).await.expect("add"));

    let reviver = RevivalSweeper::new(h.grouping.clone());
    h.clock.advance(Duration::from_secs(1800));
    assert_eq!(reviver.sweep().await.expect("sweep").messages, 0);

    h.clock.advance(Duration::from_secs(1801));
    assert_eq!(reviver.sweep().await.expect("sweep").messages, 2);
    assert_eq!(group.size().await.expect("size"), 2);

    let report = FlushSweeper::new(h.grouping.clone())
        .sweep()
        .await
        .expect("sweep");
    assert_eq!(report.messages, 2);

    let chunks = h.dispatcher.chunks().await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].messages, vec![json!("x"), json!("y")]);
    assert!(group.pending().await.expect("pending").is_empty());

    // Released messages can be grouped again.
    assert!(group.add(&json!("x")).await.expect("add"));
}

#[tokio::test]
async fn test_revival_continues_past_failing_group() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(CountingStore::new(clock.clone()).with_broken_group("a:q"));
    let reliable = ConsumerSettings::new()
        .with_flush_threshold(10)
        .with_reliable(true)
        .with_pending_ttl(Duration::from_secs(60));
    let h = harness_with_store(
        ConsumerRegistry::new()
            .with_consumer("a", reliable.clone())
            .with_consumer("b", reliable),
        store.clone(),
        clock,
    );

    for consumer in ["a", "b"] {
        let group = h.grouping.group(consumer, "q").expect("group");
        group.add(&json!("m")).await.expect("add");
        store
            .reliable_pluck(&format!("{}:q", consumer), 10, h.clock.now())
            .await
            .expect("pluck")
            .expect("pending dispatch");
    }

    h.clock.advance(Duration::from_secs(61));
    let report = RevivalSweeper::new(h.grouping.clone())
        .sweep()
        .await
        .expect("sweep");

    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.messages, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "a:q");

    let healthy = h.grouping.group("b", "q").expect("group");
    assert_eq!(healthy.size().await.expect("size"), 1);
    assert!(healthy.pending().await.expect("pending").is_empty());
}

#[tokio::test]
async fn test_time_trigger_through_sweeper() {
    let h = harness(ConsumerRegistry::new().with_consumer(
        "digest",
        ConsumerSettings::new()
            .with_flush_threshold(100)
            .with_flush_interval(Duration::from_secs(60)),
    ));
    let group = h.grouping.group("digest", "daily").expect("group");
    let sweeper = FlushSweeper::new(h.grouping.clone());

    group.add(&json!("a")).await.expect("add");
    assert_eq!(sweeper.sweep().await.expect("sweep").attempted, 0);

    h.clock.advance(Duration::from_secs(30));
    assert_eq!(sweeper.sweep().await.expect("sweep").attempted, 0);

    h.clock.advance(Duration::from_secs(31));
    let report = sweeper.sweep().await.expect("sweep");
    assert_eq!(report.attempted, 1);
    assert_eq!(report.messages, 1);
    assert_eq!(group.size().await.expect("size"), 0);

    // The next message waits a full interval from the last flush.
    group.add(&json!("b")).await.expect("add");
    h.clock.advance(Duration::from_secs(59));
    assert_eq!(sweeper.sweep().await.expect("sweep").attempted, 0);
    h.clock.advance(Duration::from_secs(2));
    assert_eq!(sweeper.sweep().await.expect("sweep").attempted, 1);
}

#[tokio::test]
async fn test_interceptor_round_trip() {
    let h = harness(
        ConsumerRegistry::new()
            .with_consumer("mailer", ConsumerSettings::new().with_flush_threshold(2)),
    );
    let interceptor = Interceptor::new(h.grouping.clone());

    for user in ["u1", "u2"] {
        let result = interceptor
            .intercept(Submission::new("mailer", "default", vec![json!(user)]))
            .await
            .expect("intercept");
        assert_eq!(result, Intercepted::Grouped { added: 1 });
    }

    FlushSweeper::new(h.grouping.clone())
        .sweep()
        .await
        .expect("sweep");
    let chunk = h.dispatcher.take().await.remove(0);

    // The released chunk comes back marked and is passed through unchanged.
    let released = Submission::new(
        "mailer",
        "default",
        vec![json!(true), Value::Array(chunk.messages.clone())],
    );
    let result = interceptor.intercept(released).await.expect("intercept");
    assert_eq!(
        result,
        Intercepted::Dispatch(Submission::new(
            "mailer",
            "default",
            vec![json!([["u1"], ["u2"]])]
        ))
    );
}

#[tokio::test]
async fn test_overview_reflects_groups() {
    let h = harness(ConsumerRegistry::new().with_consumer(
        "audit",
        ConsumerSettings::new()
            .with_flush_threshold(10)
            .with_reliable(true),
    ));
    let group = h.grouping.group("audit", "default").expect("group");
    for n in 0..3 {
        group.add(&json!(n)).await.expect("add");
    }
    h.grouping
        .store()
        .reliable_pluck("audit:default", 1, h.clock.now())
        .await
        .expect("pluck");

    let overview = h.grouping.overview().await.expect("overview");
    assert_eq!(overview.len(), 1);
    assert_eq!(overview[0].size, 2);
    assert_eq!(overview[0].pending, 1);
}
