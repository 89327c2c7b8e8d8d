mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fairq::batch::{
    BatchCompletionHandler, BatchCompletionTracker, BatchItem, BatchItemFailure, BatchItemHandler,
    BatchMeta, BatchQueue, BatchQueueOptions, BatchResult, DrrBackend, DrrOptions,
    InMemoryDrrBackend, ItemOutcome, PopResult, RedisDrrBackend, ScheduledItem,
};
use serde_json::json;
use tokio::sync::Mutex;

#[tokio::test]
async fn recording_is_idempotent() {
    let Some(store) = common::store().await else { return };
    let tracker = BatchCompletionTracker::new(store);
    tracker
        .store_meta(&BatchMeta::new("b1", "org_1", "proj_1", "env_1", 3))
        .await
        .unwrap();

    assert_eq!(tracker.record_success("b1", "run_a", Some(0)).await.unwrap(), 1);
    assert_eq!(tracker.record_success("b1", "run_a", Some(0)).await.unwrap(), 1);
    let failure = BatchItemFailure::new(1, "task", "boom").with_error_code("E1");
    assert_eq!(tracker.record_failure("b1", &failure).await.unwrap(), 2);
    assert_eq!(tracker.record_failure("b1", &failure).await.unwrap(), 2);
    assert!(!tracker.is_complete("b1").await.unwrap());

    assert_eq!(tracker.record_success("b1", "run_c", Some(2)).await.unwrap(), 3);
    assert!(tracker.is_complete("b1").await.unwrap());

    let result = tracker.completion_result("b1").await.unwrap();
    assert_eq!(result.run_ids, vec!["run_a", "run_c"]);
    assert_eq!(result.successful_run_count, 2);
    assert_eq!(result.failed_run_count, 1);
    assert_eq!(result.failures[0].error_code.as_deref(), Some("E1"));

    tracker.cleanup("b1").await.unwrap();
    assert!(tracker.get_meta("b1").await.unwrap().is_none());
    assert_eq!(tracker.get_processed_count("b1").await.unwrap(), 0);
    assert!(!tracker.is_complete("b1").await.unwrap());
}

#[tokio::test]
async fn enqueued_marks_are_first_wins() {
    let Some(store) = common::store().await else { return };
    let tracker = BatchCompletionTracker::new(store);
    assert!(tracker.mark_item_enqueued("b2", 0).await.unwrap());
    assert!(!tracker.mark_item_enqueued("b2", 0).await.unwrap());
    assert!(tracker.mark_item_enqueued("b2", 1).await.unwrap());
    assert_eq!(tracker.get_enqueued_count("b2").await.unwrap(), 2);
}

/// Fails odd indices, succeeds the rest.
struct OddsFail;

#[async_trait]
impl BatchItemHandler for OddsFail {
    async fn handle(&self, _meta: &BatchMeta, item: &ScheduledItem) -> ItemOutcome {
        if item.item.index % 2 == 1 {
            ItemOutcome::failure(format!("item {} failed", item.item.index))
        } else {
            ItemOutcome::success(format!("run_{}_{}", item.batch_id, item.item.index))
        }
    }
}

#[derive(Default)]
struct Completions {
    seen: Mutex<Vec<(BatchMeta, BatchResult)>>,
}

#[async_trait]
impl BatchCompletionHandler for Completions {
    async fn on_complete(&self, meta: BatchMeta, result: BatchResult) -> fairq::Result<()> {
        self.seen.lock().await.push((meta, result));
        Ok(())
    }
}

fn items(n: u32) -> Vec<BatchItem> {
    (0..n)
        .map(|i| BatchItem::new(i, "task", json!({"i": i})))
        .collect()
}

async fn drain<B: DrrBackend + 'static>(queue: &BatchQueue<B>) -> usize {
    let mut total = 0;
    for _ in 0..50 {
        let n = queue.run_round().await.unwrap();
        if n == 0 {
            break;
        }
        total += n;
    }
    total
}

async fn completes_every_batch_once<B: DrrBackend + 'static>(backend: B) {
    let Some(store) = common::store().await else { return };
    let completions = Arc::new(Completions::default());
    let queue = BatchQueue::new(
        store,
        backend,
        Arc::new(OddsFail),
        completions.clone(),
        BatchQueueOptions::default().with_drr(DrrOptions {
            quantum: 2.0,
            max_deficit: 10.0,
            max_items_per_round: 100,
        }),
    )
    .unwrap();

    let big = BatchMeta::new("big", "org_1", "proj_1", "env_a", 9);
    let small = BatchMeta::new("small", "org_1", "proj_1", "env_b", 2);
    assert_eq!(queue.enqueue_batch(&big, items(9)).await.unwrap(), 9);
    assert_eq!(queue.enqueue_batch(&small, items(2)).await.unwrap(), 2);
    // resubmitting is a no-op
    assert_eq!(queue.enqueue_batch(&small, items(2)).await.unwrap(), 0);

    assert_eq!(drain(&queue).await, 11);

    let seen = completions.seen.lock().await;
    assert_eq!(seen.len(), 2);
    // the small env is not stuck behind the big one
    assert_eq!(seen[0].0.batch_id, "small");
    let (_, big_result) = seen.iter().find(|(m, _)| m.batch_id == "big").unwrap();
    assert_eq!(big_result.successful_run_count, 5);
    assert_eq!(big_result.failed_run_count, 4);
    drop(seen);

    assert!(queue.tracker().get_meta("big").await.unwrap().is_none());
    assert_eq!(queue.run_round().await.unwrap(), 0);
}

#[tokio::test]
async fn batch_queue_with_in_memory_scheduler() {
    completes_every_batch_once(InMemoryDrrBackend::new()).await;
}

#[tokio::test]
async fn batch_queue_with_redis_scheduler() {
    let Some(store) = common::store().await else { return };
    completes_every_batch_once(RedisDrrBackend::new(store)).await;
}

#[tokio::test]
async fn redis_scheduler_tracks_deficit() {
    let Some(store) = common::store().await else { return };
    let backend = RedisDrrBackend::new(store);
    backend.add_batch("env", "b", items(3), 1).await.unwrap();
    assert_eq!(backend.active_envs().await.unwrap(), vec!["env"]);

    assert_eq!(backend.add_quantum("env", 1.5, 2.0).await.unwrap(), 1.5);
    assert_eq!(backend.add_quantum("env", 1.5, 2.0).await.unwrap(), 2.0);
    assert!(matches!(
        backend.pop_item("env").await.unwrap(),
        fairq::batch::PopResult::Item(_)
    ));
    assert_eq!(backend.deficit("env").await.unwrap(), 1.0);
}

#[tokio::test]
async fn redis_scheduler_requeues_at_the_head() {
    let Some(store) = common::store().await else { return };
    let backend = RedisDrrBackend::new(store);
    backend.add_batch("env", "b", items(2), 1).await.unwrap();
    backend.add_quantum("env", 5.0, 5.0).await.unwrap();

    let PopResult::Item(first) = backend.pop_item("env").await.unwrap() else {
        panic!("expected an item");
    };
    assert_eq!(first.item.index, 0);
    backend.requeue_item(first.clone(), 2).await.unwrap();
    assert_eq!(backend.pop_item("env").await.unwrap(), PopResult::Item(first));

    // draining deactivates the env; a requeue brings it back
    let PopResult::Item(last) = backend.pop_item("env").await.unwrap() else {
        panic!("expected an item");
    };
    assert!(backend.active_envs().await.unwrap().is_empty());
    backend.requeue_item(last, 3).await.unwrap();
    assert_eq!(backend.active_envs().await.unwrap(), vec!["env"]);
}

#[tokio::test]
async fn started_queue_processes_in_background() {
    let Some(store) = common::store().await else { return };
    let completions = Arc::new(Completions::default());
    let queue = BatchQueue::new(
        store,
        InMemoryDrrBackend::new(),
        Arc::new(OddsFail),
        completions.clone(),
        BatchQueueOptions::default()
            .with_poll_interval(std::time::Duration::from_millis(20)),
    )
    .unwrap();
    queue.start().await.unwrap();
    assert!(queue.start().await.is_err());

    let meta = BatchMeta::new("bg", "org_1", "proj_1", "env_a", 4);
    queue.enqueue_batch(&meta, items(4)).await.unwrap();

    for _ in 0..100 {
        if !completions.seen.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    queue.stop().await;
    assert_eq!(completions.seen.lock().await.len(), 1);
}

/// Fails the first `failures` callbacks, then behaves like [`Completions`].
struct FlakyCompletions {
    failures: AtomicU32,
    calls: AtomicU32,
    inner: Completions,
}

impl FlakyCompletions {
    fn new(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            inner: Completions::default(),
        }
    }
}

#[async_trait]
impl BatchCompletionHandler for FlakyCompletions {
    async fn on_complete(&self, meta: BatchMeta, result: BatchResult) -> fairq::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(fairq::QueueError::Internal("webhook down".into()));
        }
        self.inner.on_complete(meta, result).await
    }
}

/// In-memory scheduler whose `add_batch` fails while `failing_adds` > 0.
#[derive(Default)]
struct FlakyBackend {
    inner: InMemoryDrrBackend,
    failing_adds: AtomicU32,
}

#[async_trait]
impl DrrBackend for FlakyBackend {
    async fn add_batch(
        &self,
        env_id: &str,
        batch_id: &str,
        items: Vec<BatchItem>,
        created_at_ms: i64,
    ) -> fairq::Result<()> {
        if self
            .failing_adds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(fairq::QueueError::Internal("scheduler unavailable".into()));
        }
        self.inner.add_batch(env_id, batch_id, items, created_at_ms).await
    }

    async fn requeue_item(&self, item: ScheduledItem, created_at_ms: i64) -> fairq::Result<()> {
        self.inner.requeue_item(item, created_at_ms).await
    }

    async fn active_envs(&self) -> fairq::Result<Vec<String>> {
        self.inner.active_envs().await
    }

    async fn add_quantum(&self, env_id: &str, quantum: f64, max_deficit: f64) -> fairq::Result<f64> {
        self.inner.add_quantum(env_id, quantum, max_deficit).await
    }

    async fn pop_item(&self, env_id: &str) -> fairq::Result<PopResult> {
        self.inner.pop_item(env_id).await
    }

    async fn deficit(&self, env_id: &str) -> fairq::Result<f64> {
        self.inner.deficit(env_id).await
    }
}

fn queue_with<B: DrrBackend + 'static>(
    store: fairq::RedisStore,
    backend: B,
    completions: Arc<dyn BatchCompletionHandler>,
) -> BatchQueue<B> {
    BatchQueue::new(
        store,
        backend,
        Arc::new(OddsFail),
        completions,
        BatchQueueOptions::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn failed_completion_is_retried() {
    let Some(store) = common::store().await else { return };
    let completions = Arc::new(FlakyCompletions::new(1));
    let queue = queue_with(store, InMemoryDrrBackend::new(), completions.clone());
    let meta = BatchMeta::new("flaky", "org_1", "proj_1", "env_a", 2);
    queue.enqueue_batch(&meta, items(2)).await.unwrap();

    assert_eq!(queue.run_round().await.unwrap(), 2);
    assert_eq!(completions.calls.load(Ordering::SeqCst), 1);
    assert!(completions.inner.seen.lock().await.is_empty());
    assert!(queue.tracker().get_meta("flaky").await.unwrap().is_some());

    // the next round retries even though no items are left
    assert_eq!(queue.run_round().await.unwrap(), 0);
    assert_eq!(completions.calls.load(Ordering::SeqCst), 2);
    let seen = completions.inner.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1.successful_run_count, 1);
    assert_eq!(seen[0].1.failed_run_count, 1);
    drop(seen);
    assert!(queue.tracker().get_meta("flaky").await.unwrap().is_none());

    assert!(!queue.try_complete("flaky").await.unwrap());
    assert_eq!(queue.run_round().await.unwrap(), 0);
    assert_eq!(completions.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn try_complete_waits_for_every_item() {
    let Some(store) = common::store().await else { return };
    let completions = Arc::new(Completions::default());
    let queue = queue_with(store, InMemoryDrrBackend::new(), completions.clone());
    let meta = BatchMeta::new("sweep", "org_1", "proj_1", "env_a", 2);
    queue.enqueue_batch(&meta, items(2)).await.unwrap();

    assert!(!queue.try_complete("sweep").await.unwrap());
    queue
        .tracker()
        .record_success("sweep", "run_0", Some(0))
        .await
        .unwrap();
    queue
        .tracker()
        .record_success("sweep", "run_1", Some(1))
        .await
        .unwrap();
    assert!(queue.try_complete("sweep").await.unwrap());
    assert_eq!(completions.seen.lock().await.len(), 1);
}

#[tokio::test]
async fn failed_scheduling_can_be_resubmitted() {
    let Some(store) = common::store().await else { return };
    let completions = Arc::new(Completions::default());
    let backend = FlakyBackend::default();
    backend.failing_adds.store(1, Ordering::SeqCst);
    let queue = queue_with(store, backend, completions.clone());
    let meta = BatchMeta::new("retry", "org_1", "proj_1", "env_a", 3);

    assert!(queue.enqueue_batch(&meta, items(3)).await.is_err());
    assert_eq!(queue.tracker().get_enqueued_count("retry").await.unwrap(), 0);

    assert_eq!(queue.enqueue_batch(&meta, items(3)).await.unwrap(), 3);
    assert_eq!(drain(&queue).await, 3);
    assert_eq!(completions.seen.lock().await.len(), 1);
}

#[tokio::test]
async fn unrecorded_items_are_scheduled_again() {
    let Some(store) = common::store().await else { return };
    let completions = Arc::new(Completions::default());
    let queue = queue_with(store.clone(), InMemoryDrrBackend::new(), completions.clone());
    let meta = BatchMeta::new("broken", "org_1", "proj_1", "env_a", 2);
    queue.enqueue_batch(&meta, items(2)).await.unwrap();

    // unreadable metadata makes every item of the round fail to record
    let mut conn = store.conn().await.unwrap();
    let _: () = redis::AsyncCommands::set(&mut *conn, store.key("batch:{broken}:meta"), "not json")
        .await
        .unwrap();
    drop(conn);
    assert_eq!(queue.run_round().await.unwrap(), 2);
    assert_eq!(queue.tracker().get_processed_count("broken").await.unwrap(), 0);
    assert_eq!(
        queue.scheduler().backend().active_envs().await.unwrap(),
        vec!["env_a"]
    );

    queue.tracker().store_meta(&meta).await.unwrap();

    assert_eq!(drain(&queue).await, 2);
    let seen = completions.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1.successful_run_count + seen[0].1.failed_run_count, 2);
}
