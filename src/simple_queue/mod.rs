//! A single logical delay queue with visibility timeouts.
//!
//! Items move through these states:
//!
//! ```text
//! Available --dequeue--> Invisible(until now + visibility timeout)
//! Invisible --ack--> Removed
//! Invisible --timeout--> Available (attempt + 1)
//! Available|Invisible --move_to_dead_letter_queue--> DeadLettered
//! DeadLettered --redrive--> Available (attempt reset)
//! ```
//!
//! Invisibility is encoded in the score: a dequeued item is re-scored to the
//! moment it becomes visible again, so a consumer that crashes before acking
//! gets its item redelivered without any heartbeat or reaper.

mod scripts;

use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{QueueError, Result};
use crate::store::{now_ms, RedisStore};
use scripts::SimpleQueueScripts;

/// Dead-letter ids read per step of [`SimpleQueue::redrive_all`].
const REDRIVE_PAGE: isize = 100;

/// Default time an item stays invisible after a dequeue.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// What is stored in the items hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredItem {
    job: String,
    item: Value,
    visibility_timeout_ms: u64,
    enqueued_at: i64,
}

/// Input of [`SimpleQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueItem {
    pub id: String,
    pub job: String,
    pub item: Value,
    pub visibility_timeout: Duration,
    pub available_at: Option<DateTime<Utc>>,
    pub attempt: u32,
}

impl EnqueueItem {
    pub fn new(id: impl Into<String>, job: impl Into<String>, item: Value) -> Self {
        Self {
            id: id.into(),
            job: job.into(),
            item,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            available_at: None,
            attempt: 0,
        }
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// An item handed to a consumer by [`SimpleQueue::dequeue`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub job: String,
    pub item: Value,
    pub visibility_timeout: Duration,
    /// Number of earlier deliveries of this item.
    pub attempt: u32,
    pub available_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

/// An item parked in the dead-letter queue.
#[derive(Debug, Clone)]
pub struct DeadLetterItem {
    pub id: String,
    pub job: String,
    pub item: Value,
    pub error: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}

struct QueueKeys {
    queue: String,
    items: String,
    attempts: String,
    dlq: String,
    dlq_items: String,
    dlq_errors: String,
}

impl QueueKeys {
    fn new(prefix: &str, name: &str) -> Self {
        let base = format!("{}simplequeue:{{{}}}", prefix, name);
        Self {
            queue: format!("{}:queue", base),
            items: format!("{}:items", base),
            attempts: format!("{}:attempts", base),
            dlq: format!("{}:dlq", base),
            dlq_items: format!("{}:dlq:items", base),
            dlq_errors: format!("{}:dlq:errors", base),
        }
    }

    fn all(&self) -> [&str; 6] {
        [
            &self.queue,
            &self.items,
            &self.attempts,
            &self.dlq,
            &self.dlq_items,
            &self.dlq_errors,
        ]
    }
}

/// One parsed dequeue reply.
struct Dequeued {
    orphans: u64,
    /// Moved to the dead-letter queue by the script.
    dead_lettered: u64,
    items: Vec<QueueItem>,
    /// Valid JSON that is not a stored item, with the decode error.
    undecodable: Vec<(String, String)>,
}

/// Redis-backed queue with visibility timeouts and a dead-letter queue.
pub struct SimpleQueue {
    name: String,
    store: RedisStore,
    keys: QueueKeys,
    scripts: SimpleQueueScripts,
}

impl SimpleQueue {
    pub fn new(store: RedisStore, name: impl Into<String>) -> Self {
        let name = name.into();
        let keys = QueueKeys::new(store.key_prefix(), &name);
        Self {
            name,
            store,
            keys,
            scripts: SimpleQueueScripts::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lua sources of every script, for `SCRIPT LOAD` checks.
    pub fn script_sources() -> [&'static str; 5] {
        SimpleQueueScripts::sources()
    }

    fn invocation<'a>(&'a self, script: &'a redis::Script) -> redis::ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        for key in self.keys.all() {
            invocation.key(key);
        }
        invocation
    }

    /// Insert or overwrite the item with `item.id`. Re-enqueueing an id
    /// replaces its payload and schedule; it never creates a duplicate.
    pub async fn enqueue(&self, item: EnqueueItem) -> Result<()> {
        let now = now_ms();
        let available_at = item
            .available_at
            .map(|t| t.timestamp_millis())
            .unwrap_or(now);
        let stored = StoredItem {
            job: item.job.clone(),
            item: item.item,
            visibility_timeout_ms: item.visibility_timeout.as_millis() as u64,
            enqueued_at: now,
        };
        let raw = serde_json::to_string(&stored)?;

        let mut conn = self.store.conn().await?;
        let mut invocation = self.invocation(&self.scripts.enqueue);
        invocation
            .arg(&item.id)
            .arg(available_at)
            .arg(raw)
            .arg(item.attempt);
        let _: i64 = invocation.invoke_async(&mut *conn).await?;

        debug!(queue = %self.name, id = %item.id, job = %item.job, available_at, "item enqueued");
        Ok(())
    }

    /// Claim up to `count` visible items. Each claimed item becomes invisible
    /// for its visibility timeout.
    pub async fn dequeue(&self, count: usize) -> Result<Vec<QueueItem>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.store.conn().await?;
        let mut invocation = self.invocation(&self.scripts.dequeue);
        invocation.arg(now_ms()).arg(count);
        let raw: Vec<String> = invocation.invoke_async(&mut *conn).await?;
        drop(conn);
        let dequeued = self.parse_dequeued(raw)?;

        if dequeued.orphans > 0 {
            debug!(queue = %self.name, orphans = dequeued.orphans, "removed orphaned queue entries");
        }
        if dequeued.dead_lettered > 0 {
            warn!(
                queue = %self.name,
                count = dequeued.dead_lettered,
                "dead-lettered items that are not valid json"
            );
        }
        for (id, error) in dequeued.undecodable {
            warn!(queue = %self.name, id = %id, error = %error, "dead-lettering undecodable item");
            self.move_to_dead_letter_queue(&id, &format!("undecodable item: {}", error))
                .await?;
        }
        Ok(dequeued.items)
    }

    fn parse_dequeued(&self, raw: Vec<String>) -> Result<Dequeued> {
        let mut iter = raw.into_iter();
        let mut header = || {
            iter.next()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| QueueError::Internal("dequeue script returned no header".into()))
        };
        let orphans = header()?;
        let dead_lettered = header()?;

        let rest: Vec<String> = iter.collect();
        if rest.len() % 4 != 0 {
            return Err(QueueError::Internal(format!(
                "dequeue script returned {} fields, expected a multiple of 4",
                rest.len()
            )));
        }

        let mut dequeued = Dequeued {
            orphans,
            dead_lettered,
            items: Vec::with_capacity(rest.len() / 4),
            undecodable: Vec::new(),
        };
        for chunk in rest.chunks(4) {
            let id = chunk[0].clone();
            let score: f64 = chunk[1]
                .parse()
                .map_err(|_| QueueError::Internal(format!("bad score for {}", id)))?;
            let stored: StoredItem = match serde_json::from_str(&chunk[2]) {
                Ok(stored) => stored,
                Err(e) => {
                    dequeued.undecodable.push((id, e.to_string()));
                    continue;
                }
            };
            let attempt: u32 = chunk[3].parse().unwrap_or(0);
            dequeued.items.push(QueueItem {
                id,
                job: stored.job,
                item: stored.item,
                visibility_timeout: Duration::from_millis(stored.visibility_timeout_ms),
                attempt,
                available_at: millis_to_datetime(score as i64),
                enqueued_at: millis_to_datetime(stored.enqueued_at),
            });
        }
        Ok(dequeued)
    }

    /// Remove an item for good. Acking an unknown id is a no-op.
    pub async fn ack(&self, id: &str) -> Result<bool> {
        let mut conn = self.store.conn().await?;
        let mut invocation = self.invocation(&self.scripts.ack);
        invocation.arg(id);
        let removed: i64 = invocation.invoke_async(&mut *conn).await?;
        debug!(queue = %self.name, id = %id, removed = removed == 1, "item acked");
        Ok(removed == 1)
    }

    /// Move the item's visibility to `available_at`. No-op if absent.
    pub async fn reschedule(&self, id: &str, available_at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.store.conn().await?;
        let changed: i64 = redis::cmd("ZADD")
            .arg(&self.keys.queue)
            .arg("XX")
            .arg("CH")
            .arg(available_at.timestamp_millis())
            .arg(id)
            .query_async(&mut *conn)
            .await?;
        Ok(changed == 1)
    }

    /// Park an item in the dead-letter queue with the reason it failed.
    pub async fn move_to_dead_letter_queue(&self, id: &str, error: &str) -> Result<bool> {
        let mut conn = self.store.conn().await?;
        let mut invocation = self.invocation(&self.scripts.move_to_dlq);
        invocation.arg(id).arg(now_ms()).arg(error);
        let moved: i64 = invocation.invoke_async(&mut *conn).await?;
        if moved == 1 {
            info!(queue = %self.name, id = %id, error = %error, "item moved to dead letter queue");
        }
        Ok(moved == 1)
    }

    /// Make a dead-lettered item available again with its attempt reset.
    pub async fn redrive_from_dead_letter_queue(&self, id: &str) -> Result<bool> {
        let mut conn = self.store.conn().await?;
        let mut invocation = self.invocation(&self.scripts.redrive);
        invocation.arg(id).arg(now_ms());
        let moved: i64 = invocation.invoke_async(&mut *conn).await?;
        if moved == 1 {
            info!(queue = %self.name, id = %id, "item redriven from dead letter queue");
        } else {
            debug!(queue = %self.name, id = %id, "redrive requested for unknown item");
        }
        Ok(moved == 1)
    }

    /// Redrive every dead-lettered item; returns how many moved. Dead-letter
    /// entries whose item is gone are dropped on the way.
    pub async fn redrive_all(&self) -> Result<u64> {
        let mut moved = 0;
        loop {
            let ids: Vec<String> = {
                let mut conn = self.store.conn().await?;
                conn.zrange(&self.keys.dlq, 0, REDRIVE_PAGE - 1).await?
            };
            if ids.is_empty() {
                return Ok(moved);
            }
            for id in ids {
                if self.redrive_from_dead_letter_queue(&id).await? {
                    moved += 1;
                    continue;
                }
                let mut conn = self.store.conn().await?;
                let _: () = redis::pipe()
                    .atomic()
                    .zrem(&self.keys.dlq, &id)
                    .hdel(&self.keys.dlq_errors, &id)
                    .query_async(&mut *conn)
                    .await?;
                debug!(queue = %self.name, id = %id, "dropped orphaned dead letter entry");
            }
        }
    }

    /// Number of items in the live queue. With `include_future = false` only
    /// items visible right now are counted.
    pub async fn size(&self, include_future: bool) -> Result<u64> {
        let mut conn = self.store.conn().await?;
        let size: u64 = if include_future {
            conn.zcard(&self.keys.queue).await?
        } else {
            conn.zcount(&self.keys.queue, "-inf", now_ms()).await?
        };
        Ok(size)
    }

    pub async fn size_of_dead_letter_queue(&self) -> Result<u64> {
        let mut conn = self.store.conn().await?;
        Ok(conn.zcard(&self.keys.dlq).await?)
    }

    /// Oldest dead-lettered items first. An item that does not decode is
    /// listed with an empty job and its raw text as the item.
    pub async fn list_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetterItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.store.conn().await?;
        let entries: Vec<(String, f64)> = conn
            .zrange_withscores(&self.keys.dlq, 0, limit as isize - 1)
            .await?;

        let mut out = Vec::with_capacity(entries.len());
        for (id, score) in entries {
            let raw: Option<String> = conn.hget(&self.keys.dlq_items, &id).await?;
            let error: Option<String> = conn.hget(&self.keys.dlq_errors, &id).await?;
            let Some(raw) = raw else { continue };
            let (job, item) = match serde_json::from_str::<StoredItem>(&raw) {
                Ok(stored) => (stored.job, stored.item),
                Err(_) => (String::new(), Value::String(raw)),
            };
            out.push(DeadLetterItem {
                id,
                job,
                item,
                error,
                dead_lettered_at: millis_to_datetime(score as i64),
            });
        }
        Ok(out)
    }

    /// Look at an item without claiming it.
    pub async fn get(&self, id: &str) -> Result<Option<QueueItem>> {
        let mut conn = self.store.conn().await?;
        let raw: Option<String> = conn.hget(&self.keys.items, id).await?;
        let Some(raw) = raw else { return Ok(None) };
        let score: Option<f64> = conn.zscore(&self.keys.queue, id).await?;
        let attempt: Option<u32> = conn.hget(&self.keys.attempts, id).await?;
        let stored: StoredItem = serde_json::from_str(&raw)?;
        Ok(Some(QueueItem {
            id: id.to_string(),
            job: stored.job,
            item: stored.item,
            visibility_timeout: Duration::from_millis(stored.visibility_timeout_ms),
            attempt: attempt.unwrap_or(0),
            available_at: millis_to_datetime(score.unwrap_or_default() as i64),
            enqueued_at: millis_to_datetime(stored.enqueued_at),
        }))
    }

    /// Delete every key of this queue, dead-letter queue included.
    pub async fn clear(&self) -> Result<()> {
        let mut conn = self.store.conn().await?;
        let _: () = conn.del(&self.keys.all()[..]).await?;
        Ok(())
    }
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
