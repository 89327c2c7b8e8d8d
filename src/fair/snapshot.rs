//! Point-in-time view of a parent queue used by the weighted shuffle.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::{QueueError, Result};
use crate::keys::{KeyProducer, QueueDescriptor};
use crate::store::{now_ms, RedisStore};

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub key: String,
    pub env_id: String,
    /// How long the oldest run of the queue has been waiting.
    pub age_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSnapshot {
    pub env_id: String,
    pub current_concurrency: u64,
    pub concurrency_limit: u64,
}

impl EnvSnapshot {
    pub fn at_capacity(&self) -> bool {
        self.current_concurrency >= self.concurrency_limit
    }
}

/// Environments in the order their oldest queue appeared in the parent
/// queue, with environments at capacity already removed.
#[derive(Debug, Clone, Default)]
pub struct FairQueueSnapshot {
    pub envs: Vec<EnvSnapshot>,
    pub queues: Vec<QueueSnapshot>,
}

impl FairQueueSnapshot {
    pub fn queues_of<'a>(&'a self, env_id: &'a str) -> impl Iterator<Item = &'a QueueSnapshot> {
        self.queues.iter().filter(move |q| q.env_id == env_id)
    }
}

/// Where snapshots read their data from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// `(queue key, oldest run score)` pairs, oldest first.
    async fn parent_queue(&self, parent_queue: &str, limit: usize) -> Result<Vec<(String, f64)>>;

    /// `(current, limit)` concurrency of the environment the queue belongs to.
    async fn env_concurrency(&self, queue: &QueueDescriptor) -> Result<(u64, u64)>;
}

pub struct RedisSnapshotSource {
    store: RedisStore,
    keys: KeyProducer,
    default_env_concurrency: u64,
}

impl RedisSnapshotSource {
    pub fn new(store: RedisStore, keys: KeyProducer, default_env_concurrency: u64) -> Self {
        Self {
            store,
            keys,
            default_env_concurrency,
        }
    }
}

#[async_trait]
impl SnapshotSource for RedisSnapshotSource {
    async fn parent_queue(&self, parent_queue: &str, limit: usize) -> Result<Vec<(String, f64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.store.conn().await?;
        Ok(conn
            .zrange_withscores(parent_queue, 0, limit as isize - 1)
            .await?)
    }

    async fn env_concurrency(&self, d: &QueueDescriptor) -> Result<(u64, u64)> {
        let current_key = self
            .keys
            .env_current_concurrency_key(&d.org_id, &d.project_id, &d.env_id);
        let limit_key = self
            .keys
            .env_concurrency_limit_key(&d.org_id, &d.project_id, &d.env_id);
        let mut conn = self.store.conn().await?;
        let (current, limit): (Option<u64>, Option<u64>) = redis::cmd("MGET")
            .arg(&current_key)
            .arg(&limit_key)
            .query_async(&mut *conn)
            .await?;
        Ok((
            current.unwrap_or(0),
            limit.unwrap_or(self.default_env_concurrency),
        ))
    }
}

/// An in-memory source whose contents are set by hand.
#[derive(Default)]
pub struct StaticSnapshotSource {
    queues: Mutex<Vec<(String, f64)>>,
    envs: Mutex<HashMap<String, (u64, u64)>>,
    reads: Mutex<u64>,
}

impl StaticSnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_queues(&self, queues: Vec<(String, f64)>) {
        if let Ok(mut guard) = self.queues.lock() {
            *guard = queues;
        }
    }

    pub fn set_env(&self, env_id: impl Into<String>, current: u64, limit: u64) {
        if let Ok(mut guard) = self.envs.lock() {
            guard.insert(env_id.into(), (current, limit));
        }
    }

    /// Number of parent queue reads served so far.
    pub fn reads(&self) -> u64 {
        self.reads.lock().map(|g| *g).unwrap_or(0)
    }
}

fn poisoned() -> QueueError {
    QueueError::Internal("snapshot source lock poisoned".into())
}

#[async_trait]
impl SnapshotSource for StaticSnapshotSource {
    async fn parent_queue(&self, _parent_queue: &str, limit: usize) -> Result<Vec<(String, f64)>> {
        *self.reads.lock().map_err(|_| poisoned())? += 1;
        let queues = self.queues.lock().map_err(|_| poisoned())?;
        Ok(queues.iter().take(limit).cloned().collect())
    }

    async fn env_concurrency(&self, d: &QueueDescriptor) -> Result<(u64, u64)> {
        let envs = self.envs.lock().map_err(|_| poisoned())?;
        Ok(envs.get(&d.env_id).copied().unwrap_or((0, u64::MAX)))
    }
}

/// Read the parent queue, group it by environment, keep at most
/// `maximum_env_count` environments and drop the ones at capacity.
pub(crate) async fn build_snapshot(
    source: &dyn SnapshotSource,
    keys: &KeyProducer,
    parent_queue: &str,
    parent_queue_limit: usize,
    maximum_env_count: usize,
) -> Result<FairQueueSnapshot> {
    let entries = source.parent_queue(parent_queue, parent_queue_limit).await?;
    let now = now_ms();

    let mut snapshot = FairQueueSnapshot::default();
    let mut descriptors: Vec<QueueDescriptor> = Vec::new();

    for (key, score) in entries {
        let d = match keys.extract_components_from_queue(&key) {
            Ok(d) => d,
            Err(e) => {
                warn!(parent_queue, queue = %key, error = %e, "ignoring malformed queue in snapshot");
                continue;
            }
        };
        let known = descriptors.iter().any(|seen| seen.env_id == d.env_id);
        if !known {
            if descriptors.len() >= maximum_env_count {
                continue;
            }
            descriptors.push(d.clone());
        }
        snapshot.queues.push(QueueSnapshot {
            key,
            env_id: d.env_id,
            age_ms: (now - score as i64).max(0),
        });
    }

    for d in &descriptors {
        let (current, limit) = source.env_concurrency(d).await?;
        let env = EnvSnapshot {
            env_id: d.env_id.clone(),
            current_concurrency: current,
            concurrency_limit: limit,
        };
        if env.at_capacity() {
            snapshot.queues.retain(|q| q.env_id != env.env_id);
        } else {
            snapshot.envs.push(env);
        }
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyStyle, RuntimeEnvironment};

    #[tokio::test]
    async fn snapshot_caps_envs_and_drops_full_ones() {
        let keys = KeyProducer::new("", KeyStyle::Long);
        let source = StaticSnapshotSource::new();
        let now = now_ms() as f64;
        let envs: Vec<RuntimeEnvironment> = (0..4)
            .map(|i| RuntimeEnvironment::new("o", "p", format!("e{}", i), 10))
            .collect();
        source.set_queues(
            envs.iter()
                .enumerate()
                .map(|(i, e)| (keys.queue_key(e, "q", None), now - 1000.0 * (4 - i) as f64))
                .collect(),
        );
        source.set_env("e0", 10, 10);
        source.set_env("e1", 1, 10);
        source.set_env("e2", 0, 5);

        let snapshot = build_snapshot(&source, &keys, "parent", 100, 3).await.unwrap();
        let ids: Vec<&str> = snapshot.envs.iter().map(|e| e.env_id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
        assert_eq!(snapshot.queues.len(), 2);
        assert!(snapshot.queues_of("e3").next().is_none());
        assert!(snapshot.queues[0].age_ms >= 3000);
    }
}
