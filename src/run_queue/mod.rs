//! The multi-tenant run queue.
//!
//! Runs live in per-queue sorted sets scored by their eligibility time. Every
//! non-empty queue is registered in a parent queue (the shared queue, or a
//! worker queue) scored by its oldest run, and consumers poll the parent
//! through a [`FairDequeueStrategy`] which decides the order in which queues
//! are tried.
//!
//! A dequeue from one queue is a single Lua script that checks the org
//! disabled flag, every concurrency scope and the queue's rate limit, takes
//! the oldest eligible run, increments all scopes and rebalances the parent.
//! Ack, nack and release undo the increments exactly once.

mod concurrency;
mod message;
mod rate_limit;
mod scripts;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use concurrency::{ConcurrencyLimiter, ConcurrencyScope};
pub use message::{DequeueAttempt, DequeueOutcome, EnqueueMessage, RunQueueMessage};
pub use rate_limit::{RateLimitBackoff, RateLimitConfig};

use crate::error::{QueueError, Result};
use crate::fair::FairDequeueStrategy;
use crate::keys::{KeyProducer, KeyStyle, QueueDescriptor, RuntimeEnvironment};
use crate::simple_queue::millis_to_datetime;
use crate::store::{now_ms, RedisStore};
use scripts::RunQueueScripts;

/// Enqueue retries when an in-flight run changes between read and rewrite.
const ENQUEUE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunQueueOptions {
    pub key_style: KeyStyle,
    /// Env limit used when no limit has been written for an environment.
    pub default_env_concurrency: u32,
    /// Global switch for queue rate limits. When off, configs are kept but
    /// ignored.
    pub rate_limits_enabled: bool,
    pub rate_limit_backoff: RateLimitBackoff,
    /// How many of a queue's oldest eligible runs one dequeue looks at
    /// before giving up. Lets a run behind a rate-limited one go first.
    pub max_candidates: usize,
    /// How many queues one poll of a parent queue tries.
    pub max_queues_per_dequeue: usize,
}

impl Default for RunQueueOptions {
    fn default() -> Self {
        Self {
            key_style: KeyStyle::Long,
            default_env_concurrency: 100,
            rate_limits_enabled: true,
            rate_limit_backoff: RateLimitBackoff::Keep,
            max_candidates: 10,
            max_queues_per_dequeue: 10,
        }
    }
}

impl RunQueueOptions {
    pub fn with_key_style(mut self, style: KeyStyle) -> Self {
        self.key_style = style;
        self
    }

    pub fn with_rate_limits_enabled(mut self, enabled: bool) -> Self {
        self.rate_limits_enabled = enabled;
        self
    }

    pub fn with_rate_limit_backoff(mut self, backoff: RateLimitBackoff) -> Self {
        self.rate_limit_backoff = backoff;
        self
    }

    pub fn with_max_candidates(mut self, n: usize) -> Self {
        self.max_candidates = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_candidates == 0 {
            return Err(QueueError::Configuration("max_candidates must be > 0".into()));
        }
        if self.max_queues_per_dequeue == 0 {
            return Err(QueueError::Configuration(
                "max_queues_per_dequeue must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// The keys ack/nack/release touch for one message.
struct MessageKeys {
    message: String,
    queue: String,
    parent: String,
    queue_current: String,
    env_current: String,
    project_current: String,
    task_current: String,
}

impl MessageKeys {
    fn all(&self) -> [&str; 7] {
        [
            &self.message,
            &self.queue,
            &self.parent,
            &self.queue_current,
            &self.env_current,
            &self.project_current,
            &self.task_current,
        ]
    }
}

pub struct RunQueue {
    store: RedisStore,
    keys: KeyProducer,
    options: RunQueueOptions,
    strategy: Arc<dyn FairDequeueStrategy>,
    scripts: RunQueueScripts,
    limiter: ConcurrencyLimiter,
}

impl RunQueue {
    pub fn new(
        store: RedisStore,
        options: RunQueueOptions,
        strategy: Arc<dyn FairDequeueStrategy>,
    ) -> Result<Self> {
        options.validate()?;
        let keys = KeyProducer::new(store.key_prefix(), options.key_style);
        Ok(Self {
            limiter: ConcurrencyLimiter::new(store.clone()),
            store,
            keys,
            options,
            strategy,
            scripts: RunQueueScripts::new(),
        })
    }

    pub fn keys(&self) -> &KeyProducer {
        &self.keys
    }

    pub fn options(&self) -> &RunQueueOptions {
        &self.options
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Lua sources of every script, for `SCRIPT LOAD` checks.
    pub fn script_sources() -> Vec<String> {
        RunQueueScripts::sources()
    }

    fn descriptor(env: &RuntimeEnvironment, queue: &str, concurrency_key: Option<&str>) -> QueueDescriptor {
        QueueDescriptor {
            org_id: env.organization_id.clone(),
            project_id: env.project_id.clone(),
            env_id: env.id.clone(),
            queue: queue.to_string(),
            concurrency_key: concurrency_key.map(str::to_string),
            priority: None,
        }
    }

    fn parent_queue_key(&self, worker_queue: Option<&str>) -> String {
        match worker_queue {
            Some(worker_queue) => self.keys.worker_queue_key(worker_queue),
            None => self.keys.shared_queue_key(),
        }
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Add a run to its queue and register the queue in the parent queue
    /// (`worker_queue`, or the shared queue when `None`).
    ///
    /// Enqueueing an existing run id overwrites its data. A queued run that
    /// now targets another queue (priority, concurrency key or parent) is
    /// moved there, never duplicated. A run that is in flight or released
    /// keeps its state and its scope; only its payload is replaced.
    pub async fn enqueue_message(
        &self,
        env: &RuntimeEnvironment,
        message: EnqueueMessage,
        worker_queue: Option<&str>,
    ) -> Result<()> {
        if message.run_id.is_empty() {
            return Err(QueueError::Configuration("run_id must not be empty".into()));
        }
        let mut descriptor =
            Self::descriptor(env, &message.queue, message.concurrency_key.as_deref());
        descriptor.priority = message.priority;
        self.keys.validate_descriptor(&descriptor)?;

        let queue_key = self.keys.queue_key_from_descriptor(&descriptor);
        let parent = self.parent_queue_key(worker_queue);
        let timestamp = message
            .available_at
            .map(|at| at.timestamp_millis())
            .unwrap_or_else(now_ms);

        let stored = RunQueueMessage {
            run_id: message.run_id,
            task_identifier: message.task_identifier,
            org_id: env.organization_id.clone(),
            project_id: env.project_id.clone(),
            environment_id: env.id.clone(),
            queue: queue_key.clone(),
            parent_queue: parent.clone(),
            concurrency_key: message.concurrency_key,
            rate_limit_key: message.rate_limit_key,
            priority: message.priority,
            payload: message.payload,
            timestamp,
            attempt: 0,
        };
        let raw = serde_json::to_string(&stored)?;
        let message_key = self.keys.message_key(&env.organization_id, &stored.run_id);
        let env_limit_key =
            self.keys
                .env_concurrency_limit_key(&env.organization_id, &env.project_id, &env.id);

        let mut conn = self.store.conn().await?;
        for _ in 0..ENQUEUE_ATTEMPTS {
            let mut invocation = self.scripts.enqueue.prepare_invoke();
            invocation
                .key(&queue_key)
                .key(&parent)
                .key(&message_key)
                .key(&env_limit_key)
                .arg(&stored.run_id)
                .arg(&raw)
                .arg(timestamp)
                .arg(env.maximum_concurrency_limit);
            let (status, held): (String, String) = invocation.invoke_async(&mut *conn).await?;
            if status != "held" {
                debug!(
                    run_id = %stored.run_id,
                    queue = %queue_key,
                    parent_queue = %parent,
                    status = %status,
                    "run enqueued"
                );
                return Ok(());
            }

            // The holder acks against the scope it dequeued from, so only the
            // payload is replaced.
            let previous: RunQueueMessage = serde_json::from_str(&held)?;
            let updated = RunQueueMessage {
                payload: stored.payload.clone(),
                rate_limit_key: stored.rate_limit_key.clone(),
                ..previous
            };
            let swapped: i64 = self
                .scripts
                .overwrite_held
                .prepare_invoke()
                .key(&message_key)
                .arg(&held)
                .arg(serde_json::to_string(&updated)?)
                .invoke_async(&mut *conn)
                .await?;
            if swapped == 1 {
                debug!(
                    run_id = %stored.run_id,
                    queue = %updated.queue,
                    "in-flight run updated in place"
                );
                return Ok(());
            }
        }
        Err(QueueError::Internal(format!(
            "run {} kept changing during enqueue",
            stored.run_id
        )))
    }

    /// Enqueue each message independently. A failure does not roll back
    /// the messages that were already enqueued; results are in input order.
    pub async fn batch_enqueue(
        &self,
        env: &RuntimeEnvironment,
        messages: Vec<EnqueueMessage>,
        worker_queue: Option<&str>,
    ) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            let run_id = message.run_id.clone();
            let result = self.enqueue_message(env, message, worker_queue).await;
            if let Err(e) = &result {
                warn!(run_id = %run_id, error = %e, "batch enqueue item failed");
            }
            results.push(result);
        }
        results
    }

    // ------------------------------------------------------------------
    // Dequeue
    // ------------------------------------------------------------------

    pub async fn dequeue_message_in_shared_queue(
        &self,
        consumer_id: &str,
    ) -> Result<Option<RunQueueMessage>> {
        let parent = self.keys.shared_queue_key();
        Ok(self.poll_parent_queue(consumer_id, &parent).await?.message)
    }

    pub async fn dequeue_message_from_worker_queue(
        &self,
        consumer_id: &str,
        worker_queue: &str,
    ) -> Result<Option<RunQueueMessage>> {
        let parent = self.keys.worker_queue_key(worker_queue);
        Ok(self.poll_parent_queue(consumer_id, &parent).await?.message)
    }

    /// Ask the strategy for an ordering of the parent's queues and try them
    /// in turn until one yields a run.
    pub async fn poll_parent_queue(
        &self,
        consumer_id: &str,
        parent_queue: &str,
    ) -> Result<DequeueAttempt> {
        let queues = self
            .strategy
            .distribute_fair_queues_from_parent_queue(parent_queue, consumer_id)
            .await?;

        let mut attempt = DequeueAttempt::default();
        for queue in queues.iter().take(self.options.max_queues_per_dequeue) {
            let outcome = match self.dequeue_from_queue(queue, parent_queue).await {
                Ok(outcome) => outcome,
                Err(QueueError::InvalidKey(key)) => {
                    warn!(consumer_id, queue = %key, "skipping malformed queue key in parent queue");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match outcome {
                DequeueOutcome::Dequeued { message, remaining } => {
                    debug!(
                        consumer_id,
                        run_id = %message.run_id,
                        queue = %queue,
                        remaining,
                        "run dequeued"
                    );
                    attempt.queue_depth = remaining;
                    attempt.message = Some(message);
                    return Ok(attempt);
                }
                DequeueOutcome::Empty => {}
                other => {
                    debug!(consumer_id, queue = %queue, outcome = ?other, "queue skipped");
                    attempt.throttled += 1;
                }
            }
        }
        Ok(attempt)
    }

    /// One atomic dequeue attempt against a single queue.
    pub async fn dequeue_from_queue(
        &self,
        queue_key: &str,
        parent_queue: &str,
    ) -> Result<DequeueOutcome> {
        let d = self.keys.extract_components_from_queue(queue_key)?;
        let reschedule = self.options.rate_limit_backoff == RateLimitBackoff::Reschedule;

        let mut invocation = self.scripts.dequeue.prepare_invoke();
        invocation
            .key(queue_key)
            .key(parent_queue)
            .key(self.keys.queue_current_concurrency_key(&d))
            .key(self.keys.queue_concurrency_limit_key(&d))
            .key(self.keys.env_current_concurrency_key(&d.org_id, &d.project_id, &d.env_id))
            .key(self.keys.env_concurrency_limit_key(&d.org_id, &d.project_id, &d.env_id))
            .key(self.keys.project_current_concurrency_key(&d.org_id, &d.project_id))
            .key(self.keys.org_disabled_concurrency_key(&d.org_id))
            .key(self.keys.queue_rate_limit_key(&d))
            .arg(now_ms())
            .arg(self.options.default_env_concurrency)
            .arg(self.keys.message_key_prefix(&d.org_id))
            .arg(self.keys.task_key_prefix(&d.org_id, &d.project_id, &d.env_id))
            .arg(self.keys.current_concurrency_suffix())
            .arg(self.keys.concurrency_limit_suffix())
            .arg(self.keys.rate_limit_bucket_prefix(&d))
            .arg(if self.options.rate_limits_enabled { "1" } else { "0" })
            .arg(self.options.max_candidates)
            .arg(if reschedule { "1" } else { "0" });

        let mut conn = self.store.conn().await?;
        let raw: Vec<String> = invocation.invoke_async(&mut *conn).await?;
        parse_dequeue_reply(raw)
    }

    // ------------------------------------------------------------------
    // Ack / nack / release
    // ------------------------------------------------------------------

    fn message_keys(&self, message: &RunQueueMessage) -> Result<MessageKeys> {
        let d = self.keys.extract_components_from_queue(&message.queue)?;
        Ok(MessageKeys {
            message: self.keys.message_key(&message.org_id, &message.run_id),
            queue: message.queue.clone(),
            parent: message.parent_queue.clone(),
            queue_current: self.keys.queue_current_concurrency_key(&d),
            env_current: self.keys.env_current_concurrency_key(&d.org_id, &d.project_id, &d.env_id),
            project_current: self.keys.project_current_concurrency_key(&d.org_id, &d.project_id),
            task_current: self.keys.task_current_concurrency_key(
                &d.org_id,
                &d.project_id,
                &d.env_id,
                &message.task_identifier,
            ),
        })
    }

    async fn invoke_for_message(
        &self,
        script: &redis::Script,
        message: &RunQueueMessage,
        retry_at: Option<i64>,
    ) -> Result<bool> {
        let keys = self.message_keys(message)?;
        let mut invocation = script.prepare_invoke();
        for key in keys.all() {
            invocation.key(key);
        }
        invocation.arg(&message.run_id);
        if let Some(retry_at) = retry_at {
            invocation.arg(retry_at);
        }
        let mut conn = self.store.conn().await?;
        let changed: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(changed == 1)
    }

    /// Remove a run for good and release its concurrency. Returns false if
    /// the run was already gone.
    pub async fn acknowledge_message(&self, org_id: &str, run_id: &str) -> Result<bool> {
        let Some(message) = self.read_message(org_id, run_id).await? else {
            debug!(run_id, "ack for unknown run");
            return Ok(false);
        };
        let acked = self
            .invoke_for_message(&self.scripts.ack, &message, None)
            .await?;
        debug!(run_id, acked, "run acknowledged");
        Ok(acked)
    }

    /// Put an in-flight run back in its queue, eligible at `retry_at`
    /// (default now), releasing its concurrency and bumping its attempt.
    /// Returns false if the run was not in flight.
    pub async fn nack_message(
        &self,
        org_id: &str,
        run_id: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let Some(message) = self.read_message(org_id, run_id).await? else {
            return Ok(false);
        };
        let retry_at = retry_at.map(|at| at.timestamp_millis()).unwrap_or_else(now_ms);
        let nacked = self
            .invoke_for_message(&self.scripts.nack, &message, Some(retry_at))
            .await?;
        debug!(run_id, nacked, retry_at, "run nacked");
        Ok(nacked)
    }

    /// Give back the concurrency an in-flight run holds without removing it.
    pub async fn release_concurrency(&self, org_id: &str, run_id: &str) -> Result<bool> {
        let Some(message) = self.read_message(org_id, run_id).await? else {
            return Ok(false);
        };
        self.invoke_for_message(&self.scripts.release, &message, None)
            .await
    }

    /// The scopes a run of `task` on `queue` is counted against, in the
    /// same shape the dequeue script uses. Useful with [`ConcurrencyLimiter`].
    pub fn concurrency_scopes(
        &self,
        env: &RuntimeEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
        task: &str,
    ) -> Vec<ConcurrencyScope> {
        let d = Self::descriptor(env, queue, concurrency_key);
        let (org, proj, id) = (&env.organization_id, &env.project_id, &env.id);
        vec![
            ConcurrencyScope::disabled_flag(self.keys.org_disabled_concurrency_key(org)),
            ConcurrencyScope::limited(
                self.keys.env_current_concurrency_key(org, proj, id),
                self.keys.env_concurrency_limit_key(org, proj, id),
                Some(env.maximum_concurrency_limit),
            ),
            ConcurrencyScope::unlimited(self.keys.project_current_concurrency_key(org, proj)),
            ConcurrencyScope::limited(
                self.keys.task_current_concurrency_key(org, proj, id, task),
                self.keys.task_concurrency_limit_key(org, proj, id, task),
                None,
            ),
            ConcurrencyScope::limited(
                self.keys.queue_current_concurrency_key(&d),
                self.keys.queue_concurrency_limit_key(&d),
                Some(env.maximum_concurrency_limit),
            ),
        ]
    }

    // ------------------------------------------------------------------
    // Limits
    // ------------------------------------------------------------------

    async fn set_value(&self, key: String, value: u32) -> Result<()> {
        let mut conn = self.store.conn().await?;
        let _: () = conn.set(&key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: String) -> Result<()> {
        let mut conn = self.store.conn().await?;
        let _: () = conn.del(&key).await?;
        Ok(())
    }

    /// `0` pauses the queue.
    pub async fn update_queue_concurrency_limit(
        &self,
        env: &RuntimeEnvironment,
        queue: &str,
        limit: u32,
    ) -> Result<()> {
        self.keys
            .validate_descriptor(&Self::descriptor(env, queue, None))?;
        info!(env_id = %env.id, queue, limit, "updating queue concurrency limit");
        self.set_value(self.keys.queue_concurrency_limit_key_for(env, queue), limit)
            .await
    }

    /// Fall back to the environment's limit.
    pub async fn remove_queue_concurrency_limit(
        &self,
        env: &RuntimeEnvironment,
        queue: &str,
    ) -> Result<()> {
        self.delete(self.keys.queue_concurrency_limit_key_for(env, queue))
            .await
    }

    /// Write `env.maximum_concurrency_limit` as the environment's limit.
    pub async fn update_env_concurrency_limit(&self, env: &RuntimeEnvironment) -> Result<()> {
        info!(env_id = %env.id, limit = env.maximum_concurrency_limit, "updating env concurrency limit");
        self.set_value(
            self.keys
                .env_concurrency_limit_key(&env.organization_id, &env.project_id, &env.id),
            env.maximum_concurrency_limit,
        )
        .await
    }

    pub async fn update_task_concurrency_limit(
        &self,
        env: &RuntimeEnvironment,
        task: &str,
        limit: u32,
    ) -> Result<()> {
        self.set_value(
            self.keys.task_concurrency_limit_key(
                &env.organization_id,
                &env.project_id,
                &env.id,
                task,
            ),
            limit,
        )
        .await
    }

    pub async fn remove_task_concurrency_limit(
        &self,
        env: &RuntimeEnvironment,
        task: &str,
    ) -> Result<()> {
        self.delete(self.keys.task_concurrency_limit_key(
            &env.organization_id,
            &env.project_id,
            &env.id,
            task,
        ))
        .await
    }

    /// Stop every dequeue for the organisation until re-enabled.
    pub async fn disable_org_concurrency(&self, org_id: &str) -> Result<()> {
        info!(org_id, "disabling org concurrency");
        self.set_value(self.keys.org_disabled_concurrency_key(org_id), 1)
            .await
    }

    pub async fn enable_org_concurrency(&self, org_id: &str) -> Result<()> {
        info!(org_id, "enabling org concurrency");
        self.delete(self.keys.org_disabled_concurrency_key(org_id))
            .await
    }

    pub async fn set_queue_rate_limit(
        &self,
        env: &RuntimeEnvironment,
        queue: &str,
        config: RateLimitConfig,
    ) -> Result<()> {
        config.validate()?;
        let descriptor = Self::descriptor(env, queue, None);
        self.keys.validate_descriptor(&descriptor)?;
        let key = self.keys.queue_rate_limit_key(&descriptor);
        let mut conn = self.store.conn().await?;
        let _: () = conn
            .hset_multiple(
                &key,
                &[
                    ("limit", config.limit.to_string()),
                    ("periodMs", config.period_ms.to_string()),
                    ("burst", config.burst.to_string()),
                ],
            )
            .await?;
        info!(env_id = %env.id, queue, ?config, "queue rate limit set");
        Ok(())
    }

    /// Buckets already in flight expire on their own.
    pub async fn remove_queue_rate_limit(&self, env: &RuntimeEnvironment, queue: &str) -> Result<()> {
        self.delete(
            self.keys
                .queue_rate_limit_key(&Self::descriptor(env, queue, None)),
        )
        .await
    }

    pub async fn get_queue_rate_limit(
        &self,
        env: &RuntimeEnvironment,
        queue: &str,
    ) -> Result<Option<RateLimitConfig>> {
        let key = self
            .keys
            .queue_rate_limit_key(&Self::descriptor(env, queue, None));
        let mut conn = self.store.conn().await?;
        let (limit, period_ms, burst): (Option<u32>, Option<u64>, Option<u32>) = redis::cmd("HMGET")
            .arg(&key)
            .arg("limit")
            .arg("periodMs")
            .arg("burst")
            .query_async(&mut *conn)
            .await?;
        Ok(match (limit, period_ms, burst) {
            (Some(limit), Some(period_ms), Some(burst)) => Some(RateLimitConfig {
                limit,
                period_ms,
                burst,
            }),
            _ => None,
        })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    async fn get_count(&self, key: String) -> Result<u64> {
        let mut conn = self.store.conn().await?;
        let value: Option<u64> = conn.get(&key).await?;
        Ok(value.unwrap_or(0))
    }

    pub async fn current_concurrency_of_queue(
        &self,
        env: &RuntimeEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> Result<u64> {
        self.get_count(
            self.keys
                .queue_current_concurrency_key(&Self::descriptor(env, queue, concurrency_key)),
        )
        .await
    }

    pub async fn current_concurrency_of_env(&self, env: &RuntimeEnvironment) -> Result<u64> {
        self.get_count(self.keys.env_current_concurrency_key(
            &env.organization_id,
            &env.project_id,
            &env.id,
        ))
        .await
    }

    pub async fn current_concurrency_of_project(&self, env: &RuntimeEnvironment) -> Result<u64> {
        self.get_count(
            self.keys
                .project_current_concurrency_key(&env.organization_id, &env.project_id),
        )
        .await
    }

    pub async fn current_concurrency_of_task(
        &self,
        env: &RuntimeEnvironment,
        task: &str,
    ) -> Result<u64> {
        self.get_count(self.keys.task_current_concurrency_key(
            &env.organization_id,
            &env.project_id,
            &env.id,
            task,
        ))
        .await
    }

    /// Runs waiting in the queue, future-scheduled ones included.
    pub async fn length_of_queue(
        &self,
        env: &RuntimeEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
        priority: Option<u32>,
    ) -> Result<u64> {
        let key = self
            .keys
            .queue_key_with_priority(env, queue, concurrency_key, priority);
        let mut conn = self.store.conn().await?;
        Ok(conn.zcard(&key).await?)
    }

    pub async fn oldest_message_in_queue(
        &self,
        env: &RuntimeEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>> {
        let key = self.keys.queue_key(env, queue, concurrency_key);
        let mut conn = self.store.conn().await?;
        let entries: Vec<(String, f64)> = conn.zrange_withscores(&key, 0, 0).await?;
        Ok(entries
            .first()
            .map(|(_, score)| millis_to_datetime(*score as i64)))
    }

    pub async fn read_message(&self, org_id: &str, run_id: &str) -> Result<Option<RunQueueMessage>> {
        let key = self.keys.message_key(org_id, run_id);
        let mut conn = self.store.conn().await?;
        let (data, attempt): (Option<String>, Option<u32>) = redis::cmd("HMGET")
            .arg(&key)
            .arg("data")
            .arg("attempt")
            .query_async(&mut *conn)
            .await?;
        let Some(data) = data else { return Ok(None) };
        let mut message: RunQueueMessage = serde_json::from_str(&data)?;
        message.attempt = attempt.unwrap_or(0);
        Ok(Some(message))
    }

    /// Queue keys of an environment, found with `SCAN`. Counter, limit and
    /// bucket keys sharing the queue prefix are filtered out.
    pub async fn queue_concurrency_scan(&self, env: &RuntimeEnvironment) -> Result<Vec<String>> {
        let pattern = self.keys.queue_pattern_for_env(env);
        let mut conn = self.store.conn().await?;
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut *conn)
                .await?;
            found.extend(batch.into_iter().filter(|key| self.keys.is_queue_key(key)));
            if next == 0 {
                break;
            }
            cursor = next;
        }
        found.sort();
        found.dedup();
        Ok(found)
    }
}

fn parse_dequeue_reply(raw: Vec<String>) -> Result<DequeueOutcome> {
    let [status, data, remaining, attempt]: [String; 4] = raw.try_into().map_err(|raw: Vec<String>| {
        QueueError::Internal(format!(
            "dequeue script returned {} fields, expected 4",
            raw.len()
        ))
    })?;

    Ok(match status.as_str() {
        "dequeued" => {
            let mut message: RunQueueMessage = serde_json::from_str(&data)?;
            message.attempt = attempt.parse().unwrap_or(0);
            DequeueOutcome::Dequeued {
                message,
                remaining: remaining.parse().unwrap_or(0),
            }
        }
        "empty" => DequeueOutcome::Empty,
        "org_disabled" => DequeueOutcome::OrgDisabled,
        "env_at_capacity" => DequeueOutcome::EnvAtCapacity,
        "queue_at_capacity" => DequeueOutcome::QueueAtCapacity,
        "task_at_capacity" => DequeueOutcome::TaskAtCapacity,
        "rate_limited" => DequeueOutcome::RateLimited,
        other => {
            return Err(QueueError::Internal(format!(
                "unknown dequeue status: {}",
                other
            )))
        }
    })
}
