//! Batch processing: items are scheduled fairly across environments by the
//! DRR scheduler, handed to an item handler, recorded by the completion
//! tracker, and the batch's completion callback fires once the last item is
//! recorded.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use redis::AsyncCommands;
use tracing::{debug, error, info, warn};

use super::completion::{BatchCompletionTracker, BatchItemFailure, BatchMeta, BatchResult};
use super::drr::{BatchItem, DrrBackend, DrrOptions, DrrScheduler, ScheduledItem};
use crate::error::{QueueError, Result};
use crate::store::RedisStore;

/// How long the "completion already fired" marker outlives the batch.
const COMPLETION_MARKER_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// How long one worker may hold a batch's completion before another one can
/// claim it. Covers a worker that dies inside the callback.
const COMPLETION_LEASE_MS: u64 = 60 * 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Success {
        run_id: String,
    },
    Failure {
        error: String,
        error_code: Option<String>,
    },
}

impl ItemOutcome {
    pub fn success(run_id: impl Into<String>) -> Self {
        ItemOutcome::Success {
            run_id: run_id.into(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        ItemOutcome::Failure {
            error: error.into(),
            error_code: None,
        }
    }
}

/// Turns one batch item into a run.
#[async_trait]
pub trait BatchItemHandler: Send + Sync + 'static {
    async fn handle(&self, meta: &BatchMeta, item: &ScheduledItem) -> ItemOutcome;
}

/// Called once per batch, after every item was recorded.
#[async_trait]
pub trait BatchCompletionHandler: Send + Sync + 'static {
    async fn on_complete(&self, meta: BatchMeta, result: BatchResult) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchQueueOptions {
    pub drr: DrrOptions,
    /// Sleep between rounds that found nothing to do.
    pub poll_interval_ms: u64,
    /// Items of one round processed concurrently.
    pub item_concurrency: usize,
}

impl Default for BatchQueueOptions {
    fn default() -> Self {
        Self {
            drr: DrrOptions::default(),
            poll_interval_ms: 100,
            item_concurrency: 10,
        }
    }
}

impl BatchQueueOptions {
    pub fn with_drr(mut self, drr: DrrOptions) -> Self {
        self.drr = drr;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_item_concurrency(mut self, n: usize) -> Self {
        self.item_concurrency = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.drr.validate()?;
        if self.item_concurrency == 0 {
            return Err(QueueError::Configuration(
                "item_concurrency must be > 0".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(QueueError::Configuration(
                "poll_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

struct Inner<B> {
    store: RedisStore,
    scheduler: DrrScheduler<B>,
    tracker: BatchCompletionTracker,
    item_handler: Arc<dyn BatchItemHandler>,
    completion_handler: Arc<dyn BatchCompletionHandler>,
    options: BatchQueueOptions,
    /// Batches whose completion failed and is retried every round.
    pending_completions: Mutex<HashSet<String>>,
}

pub struct BatchQueue<B> {
    inner: Arc<Inner<B>>,
    running: Arc<RwLock<bool>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<B: DrrBackend + 'static> BatchQueue<B> {
    pub fn new(
        store: RedisStore,
        backend: B,
        item_handler: Arc<dyn BatchItemHandler>,
        completion_handler: Arc<dyn BatchCompletionHandler>,
        options: BatchQueueOptions,
    ) -> Result<Self> {
        options.validate()?;
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                tracker: BatchCompletionTracker::new(store.clone()),
                scheduler: DrrScheduler::new(backend, options.drr.clone())?,
                store,
                item_handler,
                completion_handler,
                options,
                pending_completions: Mutex::new(HashSet::new()),
            }),
            running: Arc::new(RwLock::new(false)),
            shutdown_tx,
            handle: Mutex::new(None),
        })
    }

    pub fn tracker(&self) -> &BatchCompletionTracker {
        &self.inner.tracker
    }

    pub fn scheduler(&self) -> &DrrScheduler<B> {
        &self.inner.scheduler
    }

    /// Store the batch metadata and schedule its items. Items whose index was
    /// already enqueued are skipped, so resubmitting a batch (or a chunk of
    /// it) is safe. If scheduling fails the marks of this call are undone,
    /// so a retry submits the same items again. Returns the number of newly
    /// scheduled items.
    pub async fn enqueue_batch(&self, meta: &BatchMeta, items: Vec<BatchItem>) -> Result<usize> {
        let tracker = &self.inner.tracker;
        if tracker.get_meta(&meta.batch_id).await?.is_none() {
            tracker.store_meta(meta).await?;
        }

        let mut fresh = Vec::with_capacity(items.len());
        for item in items {
            if tracker.mark_item_enqueued(&meta.batch_id, item.index).await? {
                fresh.push(item);
            } else {
                debug!(batch_id = %meta.batch_id, index = item.index, "batch item already enqueued");
            }
        }
        let count = fresh.len();
        let indices: Vec<u32> = fresh.iter().map(|item| item.index).collect();
        if let Err(e) = self
            .inner
            .scheduler
            .add_batch(&meta.environment_id, &meta.batch_id, fresh, meta.created_at)
            .await
        {
            warn!(batch_id = %meta.batch_id, error = %e, "scheduling batch failed, unmarking items");
            tracker.unmark_items_enqueued(&meta.batch_id, &indices).await?;
            return Err(e);
        }

        info!(batch_id = %meta.batch_id, env_id = %meta.environment_id, items = count, "batch enqueued");
        Ok(count)
    }

    /// Run one DRR round and process what it hands out. Returns the number
    /// of items processed.
    pub async fn run_round(&self) -> Result<usize> {
        self.inner.run_round().await
    }

    /// Fire the completion callback of a batch whose items are all recorded,
    /// unless another worker holds or already fired it. Returns true if the
    /// callback ran. Rounds retry failed completions on their own; this is
    /// for sweeping batches left behind by a worker that died.
    pub async fn try_complete(&self, batch_id: &str) -> Result<bool> {
        self.inner.complete(batch_id).await
    }

    /// Spawn the processing loop. Returns immediately.
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(QueueError::Internal("batch queue already running".into()));
            }
            *running = true;
        }
        self.shutdown_tx.send_replace(false);

        let inner = self.inner.clone();
        let running = self.running.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let poll_interval = Duration::from_millis(inner.options.poll_interval_ms);

        let handle = tokio::spawn(async move {
            info!("batch queue started");
            while *running.read().await {
                if *shutdown_rx.borrow() {
                    break;
                }
                // popped items are gone from the scheduler, so a round is
                // never cancelled halfway
                let sleep_for = match inner.run_round().await {
                    Ok(0) => poll_interval,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "batch round failed");
                        poll_interval.max(Duration::from_secs(1))
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {},
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("batch queue stopped");
        });

        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    /// Signal the loop to stop and wait for the in-flight round to finish.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "batch queue task panicked");
            }
        }
    }
}

impl<B: DrrBackend> Inner<B> {
    async fn run_round(&self) -> Result<usize> {
        self.retry_completions().await;

        let items = self.scheduler.run_round().await?;
        let count = items.len();
        let mut failed = Vec::new();
        for chunk in items.chunks(self.options.item_concurrency) {
            let pending: Vec<_> = chunk.iter().map(|item| self.process_item(item)).collect();
            for (item, result) in chunk.iter().zip(join_all(pending).await) {
                if let Err(e) = result {
                    error!(
                        batch_id = %item.batch_id,
                        index = item.item.index,
                        error = %e,
                        "failed to record batch item, requeueing"
                    );
                    failed.push(item.clone());
                }
            }
        }
        // pushed to the head one by one, so go backwards to keep their order
        for item in failed.into_iter().rev() {
            let (batch_id, index) = (item.batch_id.clone(), item.item.index);
            if let Err(e) = self.scheduler.requeue(item).await {
                error!(batch_id = %batch_id, index, error = %e, "batch item lost");
            }
        }
        Ok(count)
    }

    /// Handle and record one item. An error means the item was not
    /// recorded and must be scheduled again.
    async fn process_item(&self, item: &ScheduledItem) -> Result<()> {
        let Some(meta) = self.tracker.get_meta(&item.batch_id).await? else {
            warn!(batch_id = %item.batch_id, index = item.item.index, "dropping item of unknown batch");
            return Ok(());
        };

        let index = item.item.index;
        let processed = match self.item_handler.handle(&meta, item).await {
            ItemOutcome::Success { run_id } => {
                self.tracker
                    .record_success(&meta.batch_id, &run_id, Some(index))
                    .await?
            }
            ItemOutcome::Failure { error, error_code } => {
                let mut failure = BatchItemFailure::new(index, &item.item.task_identifier, error);
                failure.error_code = error_code;
                self.tracker.record_failure(&meta.batch_id, &failure).await?
            }
        };

        if processed >= meta.run_count {
            if let Err(e) = self.complete(&meta.batch_id).await {
                warn!(batch_id = %meta.batch_id, error = %e, "batch completion failed, will retry");
                self.pending_completions
                    .lock()
                    .await
                    .insert(meta.batch_id.clone());
            }
        }
        Ok(())
    }

    async fn retry_completions(&self) {
        let batch_ids: Vec<String> = self.pending_completions.lock().await.iter().cloned().collect();
        for batch_id in batch_ids {
            match self.complete(&batch_id).await {
                Ok(_) => {
                    self.pending_completions.lock().await.remove(&batch_id);
                }
                Err(e) => warn!(batch_id = %batch_id, error = %e, "batch completion retry failed"),
            }
        }
    }

    fn completion_marker(&self, batch_id: &str) -> String {
        self.store.key(&format!("batch:{{{}}}:completed", batch_id))
    }

    /// Fire the completion callback unless another worker holds or already
    /// fired it. The marker is a lease while the callback runs and becomes
    /// permanent once it succeeded; on failure it is dropped so the next
    /// attempt can claim it.
    async fn complete(&self, batch_id: &str) -> Result<bool> {
        let marker = self.completion_marker(batch_id);
        let mut conn = self.store.conn().await?;
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&marker)
            .arg("running")
            .arg("NX")
            .arg("PX")
            .arg(COMPLETION_LEASE_MS)
            .query_async(&mut *conn)
            .await?;
        drop(conn);
        if claimed.is_none() {
            debug!(batch_id, "batch completion already handled");
            return Ok(false);
        }

        let fired = self.fire_completion(batch_id).await;
        let mut conn = self.store.conn().await?;
        match fired {
            Ok(true) => {
                let _: () = redis::cmd("SET")
                    .arg(&marker)
                    .arg("done")
                    .arg("PX")
                    .arg(COMPLETION_MARKER_TTL_MS)
                    .query_async(&mut *conn)
                    .await?;
                drop(conn);
                self.tracker.cleanup(batch_id).await?;
                Ok(true)
            }
            Ok(false) => {
                let _: () = conn.del(&marker).await?;
                Ok(false)
            }
            Err(e) => {
                let _: () = conn.del(&marker).await?;
                Err(e)
            }
        }
    }

    async fn fire_completion(&self, batch_id: &str) -> Result<bool> {
        let Some(meta) = self.tracker.get_meta(batch_id).await? else {
            debug!(batch_id, "batch already cleaned up");
            return Ok(false);
        };
        if self.tracker.get_processed_count(batch_id).await? < meta.run_count {
            return Ok(false);
        }

        let result = self.tracker.completion_result(batch_id).await?;
        info!(
            batch_id,
            succeeded = result.successful_run_count,
            failed = result.failed_run_count,
            "batch completed"
        );
        if let Err(e) = self.completion_handler.on_complete(meta, result).await {
            error!(batch_id, error = %e, "batch completion handler failed");
            return Err(e);
        }
        Ok(true)
    }
}
