use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::catalog::{JobCatalog, JobContext, JobError, JobHandler};
use super::retry::RetryOptions;
use crate::error::{QueueError, Result};
use crate::metrics::{
    MetricsSink, NoopMetrics, JOB_DEAD_LETTERED, JOB_RETRIED, MESSAGES_ACKED,
};
use crate::simple_queue::{EnqueueItem, QueueItem, SimpleQueue, DEFAULT_VISIBILITY_TIMEOUT};
use crate::store::RedisStore;

/// Body of a redrive request published on the redrive channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedriveRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    pub queue_name: String,
    /// Concurrent worker loops.
    pub concurrency: usize,
    /// Longest sleep between empty polls.
    pub poll_interval_ms: u64,
    /// First sleep after an empty poll; doubles up to `poll_interval_ms`.
    pub immediate_poll_interval_ms: u64,
    pub visibility_timeout_ms: u64,
    pub retry: RetryOptions,
    /// Pub/sub channel listened on for redrive requests.
    pub redrive_channel: Option<String>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            queue_name: "default".into(),
            concurrency: 5,
            poll_interval_ms: 1_000,
            immediate_poll_interval_ms: 100,
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT.as_millis() as u64,
            retry: RetryOptions::default(),
            redrive_channel: None,
        }
    }
}

impl WorkerOptions {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn with_poll_intervals(mut self, immediate: Duration, steady: Duration) -> Self {
        self.immediate_poll_interval_ms = immediate.as_millis() as u64;
        self.poll_interval_ms = steady.as_millis() as u64;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_redrive_channel(mut self, channel: impl Into<String>) -> Self {
        self.redrive_channel = Some(channel.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_name.is_empty() {
            return Err(QueueError::Configuration("queue_name must not be empty".into()));
        }
        if self.concurrency == 0 {
            return Err(QueueError::Configuration("concurrency must be > 0".into()));
        }
        if self.immediate_poll_interval_ms == 0
            || self.poll_interval_ms < self.immediate_poll_interval_ms
        {
            return Err(QueueError::Configuration(
                "poll intervals must satisfy 0 < immediate <= steady".into(),
            ));
        }
        if self.visibility_timeout_ms == 0 {
            return Err(QueueError::Configuration(
                "visibility_timeout_ms must be > 0".into(),
            ));
        }
        self.retry.validate()
    }
}

/// Exponential backoff for idle polls.
struct Backoff {
    current: Duration,
    base: Duration,
    max: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            current: base,
            base,
            max,
        }
    }

    fn reset(&mut self) {
        self.current = self.base;
    }

    fn next(&mut self) -> Duration {
        let next = self.current;
        self.current = (self.current * 2).min(self.max);
        next
    }
}

/// What happened to one delivered item.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Retried { retry_at: DateTime<Utc> },
    DeadLettered { error: String },
}

struct Shared {
    queue: SimpleQueue,
    catalog: JobCatalog,
    options: WorkerOptions,
    metrics: Arc<dyn MetricsSink>,
}

/// Runs catalogued jobs off a [`SimpleQueue`], retrying with backoff and
/// dead-lettering what cannot succeed.
pub struct Worker {
    store: RedisStore,
    shared: Arc<Shared>,
    running: Arc<RwLock<bool>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(store: RedisStore, catalog: JobCatalog, options: WorkerOptions) -> Result<Self> {
        options.validate()?;
        catalog.validate()?;
        for name in catalog.names() {
            if let Some(retry) = catalog.get(name).and_then(|job| job.retry_options()) {
                retry.validate()?;
            }
        }
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                queue: SimpleQueue::new(store.clone(), options.queue_name.clone()),
                catalog,
                options,
                metrics: Arc::new(NoopMetrics),
            }),
            store,
            running: Arc::new(RwLock::new(false)),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Must be called before `start`.
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.metrics = sink;
        }
        self
    }

    pub fn queue(&self) -> &SimpleQueue {
        &self.shared.queue
    }

    pub fn catalog(&self) -> &JobCatalog {
        &self.shared.catalog
    }

    /// Enqueue a job under a fresh id; returns the id.
    pub async fn enqueue<H: JobHandler>(&self, payload: &H::Payload) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.enqueue_with_id::<H>(&id, payload, None).await?;
        Ok(id)
    }

    /// Enqueue under a caller-chosen id. An existing item with the same id is
    /// replaced.
    pub async fn enqueue_with_id<H: JobHandler>(
        &self,
        id: &str,
        payload: &H::Payload,
        available_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if !self.shared.catalog.contains(H::NAME) {
            return Err(QueueError::UnknownJob(H::NAME.to_string()));
        }
        let mut item = EnqueueItem::new(id, H::NAME, serde_json::to_value(payload)?)
            .visibility_timeout(self.shared.visibility_timeout_for(H::NAME));
        if let Some(at) = available_at {
            item = item.available_at(at);
        }
        self.shared.queue.enqueue(item).await
    }

    /// Ask every worker listening on the redrive channel to redrive `id`.
    pub async fn publish_redrive(&self, id: &str) -> Result<()> {
        let Some(channel) = self.shared.options.redrive_channel.as_deref() else {
            return Err(QueueError::Configuration("no redrive channel configured".into()));
        };
        let body = serde_json::to_string(&RedriveRequest { id: id.to_string() })?;
        let mut conn = self.store.conn().await?;
        let _: i64 = conn.publish(channel, body).await?;
        Ok(())
    }

    /// Process one delivered item to completion. The worker loops call this;
    /// it is public so callers can drive a worker by hand.
    pub async fn process(&self, item: QueueItem) -> Result<JobOutcome> {
        self.shared.process(item).await
    }

    /// Spawn the worker loops (and the redrive listener, when configured).
    /// Returns once they are running.
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(QueueError::Internal("worker already running".into()));
            }
            *running = true;
        }
        self.shutdown_tx.send_replace(false);

        let mut handles = self.handles.lock().await;
        for worker_id in 0..self.shared.options.concurrency {
            handles.push(self.spawn_loop(worker_id));
        }
        if let Some(channel) = self.shared.options.redrive_channel.clone() {
            handles.push(self.spawn_redrive_listener(channel).await?);
        }

        info!(
            queue = %self.shared.options.queue_name,
            concurrency = self.shared.options.concurrency,
            jobs = ?self.shared.catalog.names(),
            "worker started"
        );
        Ok(())
    }

    /// Stop polling and wait for in-flight jobs to finish.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!(queue = %self.shared.options.queue_name, "worker stopped");
    }

    fn spawn_loop(&self, worker_id: usize) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let running = self.running.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            debug!(%worker_id, "worker loop started");
            let mut backoff = Backoff::new(
                Duration::from_millis(shared.options.immediate_poll_interval_ms),
                Duration::from_millis(shared.options.poll_interval_ms),
            );

            while *running.read().await {
                if *shutdown_rx.borrow() {
                    break;
                }
                let sleep_for = match shared.queue.dequeue(1).await {
                    Ok(items) if items.is_empty() => backoff.next(),
                    Ok(items) => {
                        backoff.reset();
                        for item in items {
                            let id = item.id.clone();
                            if let Err(e) = shared.process(item).await {
                                error!(%worker_id, id = %id, error = %e, "failed to settle job");
                            }
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(%worker_id, error = %e, "dequeue failed");
                        Duration::from_millis(shared.options.poll_interval_ms)
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {},
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!(%worker_id, "worker loop stopped");
        })
    }

    async fn spawn_redrive_listener(&self, channel: String) -> Result<JoinHandle<()>> {
        let mut pubsub = self.store.client()?.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        let shared = self.shared.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        Ok(tokio::spawn(async move {
            debug!(channel = %channel, "redrive listener started");
            let mut messages = pubsub.on_message();
            loop {
                let msg = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    msg = messages.next() => msg,
                };
                let Some(msg) = msg else {
                    warn!(channel = %channel, "redrive subscription closed");
                    break;
                };
                let request = msg
                    .get_payload::<String>()
                    .map_err(QueueError::from)
                    .and_then(|raw| Ok(serde_json::from_str::<RedriveRequest>(&raw)?));
                match request {
                    Ok(request) => {
                        if let Err(e) = shared.queue.redrive_from_dead_letter_queue(&request.id).await {
                            warn!(id = %request.id, error = %e, "redrive failed");
                        }
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "ignoring malformed redrive request"),
                }
            }
            debug!(channel = %channel, "redrive listener stopped");
        }))
    }
}

impl Shared {
    fn visibility_timeout_for(&self, job: &str) -> Duration {
        self.catalog
            .get(job)
            .and_then(|j| j.visibility_timeout())
            .unwrap_or(Duration::from_millis(self.options.visibility_timeout_ms))
    }

    async fn process(&self, item: QueueItem) -> Result<JobOutcome> {
        let Some(job) = self.catalog.get(&item.job) else {
            let error = QueueError::UnknownJob(item.job.clone()).to_string();
            return self.dead_letter(&item, error).await;
        };

        let ctx = JobContext {
            id: item.id.clone(),
            job: item.job.clone(),
            attempt: item.attempt,
            enqueued_at: item.enqueued_at,
        };
        debug!(id = %item.id, job = %item.job, attempt = item.attempt, "running job");

        let result = match tokio::time::timeout(item.visibility_timeout, job.run(item.item.clone(), ctx)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::retryable(format!(
                "timed out after {:?}",
                item.visibility_timeout
            ))),
        };

        match result {
            Ok(()) => {
                self.queue.ack(&item.id).await?;
                self.metrics.inc_counter(MESSAGES_ACKED, 1);
                debug!(id = %item.id, job = %item.job, "job completed");
                Ok(JobOutcome::Completed)
            }
            Err(JobError::Fatal(error)) => self.dead_letter(&item, error).await,
            Err(JobError::Retryable(error)) => {
                let retry = job.retry_options().unwrap_or_else(|| self.options.retry.clone());
                if !retry.should_retry(item.attempt) {
                    return self
                        .dead_letter(&item, format!("exhausted {} attempts: {}", retry.max_attempts, error))
                        .await;
                }
                let delay = retry.delay(item.attempt);
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                let next = EnqueueItem::new(&item.id, &item.job, item.item.clone())
                    .visibility_timeout(item.visibility_timeout)
                    .available_at(retry_at)
                    .attempt(item.attempt + 1);
                self.queue.enqueue(next).await?;
                self.metrics.inc_counter(JOB_RETRIED, 1);
                warn!(
                    id = %item.id,
                    job = %item.job,
                    attempt = item.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "job failed, retrying"
                );
                Ok(JobOutcome::Retried { retry_at })
            }
        }
    }

    async fn dead_letter(&self, item: &QueueItem, error: String) -> Result<JobOutcome> {
        self.queue.move_to_dead_letter_queue(&item.id, &error).await?;
        self.metrics.inc_counter(JOB_DEAD_LETTERED, 1);
        error!(id = %item.id, job = %item.job, attempt = item.attempt, error = %error, "job dead-lettered");
        Ok(JobOutcome::DeadLettered { error })
    }
}
