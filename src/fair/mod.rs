//! Fair dequeue strategies.
//!
//! A strategy looks at a parent queue and returns the order in which its
//! child queues should be tried. It never mutates anything; the run queue's
//! dequeue script does the actual claiming, so a strategy that returns a
//! queue which is at capacity costs one wasted script call, nothing more.

mod priority;
mod snapshot;
mod weighted_shuffle;

use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;

pub use priority::{sort_queues_by_priority, EnvPriorityStrategy, PriorityStrategy};
pub use snapshot::{
    EnvSnapshot, FairQueueSnapshot, QueueSnapshot, RedisSnapshotSource, SnapshotSource,
    StaticSnapshotSource,
};
pub use weighted_shuffle::{FairQueueBiases, WeightedShuffleOptions, WeightedShuffleStrategy};

use crate::error::Result;
use crate::keys::KeyProducer;
use crate::store::RedisStore;

/// The queues of one environment, in the order they should be tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvQueues {
    pub env_id: String,
    pub queues: Vec<String>,
}

#[async_trait]
pub trait FairDequeueStrategy: Send + Sync {
    /// Ordered environments, each with its ordered queues.
    async fn distribute_fair_queues_by_env(
        &self,
        parent_queue: &str,
        consumer_id: &str,
    ) -> Result<Vec<EnvQueues>>;

    /// The flat order in which the run queue tries queues.
    async fn distribute_fair_queues_from_parent_queue(
        &self,
        parent_queue: &str,
        consumer_id: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .distribute_fair_queues_by_env(parent_queue, consumer_id)
            .await?
            .into_iter()
            .flat_map(|env| env.queues)
            .collect())
    }
}

#[async_trait]
impl<T: FairDequeueStrategy + ?Sized> FairDequeueStrategy for Arc<T> {
    async fn distribute_fair_queues_by_env(
        &self,
        parent_queue: &str,
        consumer_id: &str,
    ) -> Result<Vec<EnvQueues>> {
        (**self)
            .distribute_fair_queues_by_env(parent_queue, consumer_id)
            .await
    }

    async fn distribute_fair_queues_from_parent_queue(
        &self,
        parent_queue: &str,
        consumer_id: &str,
    ) -> Result<Vec<String>> {
        (**self)
            .distribute_fair_queues_from_parent_queue(parent_queue, consumer_id)
            .await
    }
}

/// Group queue keys by environment, keeping first-seen order for both the
/// environments and the queues inside each one. Keys that do not parse end
/// up in an environment of their own, named after the key.
pub fn group_queues_by_env(keys: &KeyProducer, queues: Vec<String>) -> Vec<EnvQueues> {
    let mut grouped: Vec<EnvQueues> = Vec::new();
    for queue in queues {
        let env_id = match keys.extract_components_from_queue(&queue) {
            Ok(d) => d.env_id,
            Err(_) => queue.clone(),
        };
        match grouped.iter_mut().find(|e| e.env_id == env_id) {
            Some(env) => env.queues.push(queue),
            None => grouped.push(EnvQueues {
                env_id,
                queues: vec![queue],
            }),
        }
    }
    grouped
}

/// Parent queue order: oldest queue first, no fairness at all.
pub struct NoopStrategy {
    store: RedisStore,
    keys: KeyProducer,
    limit: usize,
}

impl NoopStrategy {
    pub fn new(store: RedisStore, keys: KeyProducer, limit: usize) -> Self {
        Self { store, keys, limit }
    }

    async fn parent_queue_order(&self, parent_queue: &str) -> Result<Vec<String>> {
        if self.limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.store.conn().await?;
        Ok(conn
            .zrange(parent_queue, 0, self.limit as isize - 1)
            .await?)
    }
}

#[async_trait]
impl FairDequeueStrategy for NoopStrategy {
    async fn distribute_fair_queues_by_env(
        &self,
        parent_queue: &str,
        _consumer_id: &str,
    ) -> Result<Vec<EnvQueues>> {
        let queues = self.parent_queue_order(parent_queue).await?;
        Ok(group_queues_by_env(&self.keys, queues))
    }

    async fn distribute_fair_queues_from_parent_queue(
        &self,
        parent_queue: &str,
        _consumer_id: &str,
    ) -> Result<Vec<String>> {
        self.parent_queue_order(parent_queue).await
    }
}

/// Returns a fixed list regardless of the parent queue. Handy for wiring a
/// run queue to a known set of queues, and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticStrategy {
    envs: Vec<EnvQueues>,
}

impl StaticStrategy {
    pub fn new(envs: Vec<EnvQueues>) -> Self {
        Self { envs }
    }

    pub fn from_queues(keys: &KeyProducer, queues: Vec<String>) -> Self {
        Self {
            envs: group_queues_by_env(keys, queues),
        }
    }
}

#[async_trait]
impl FairDequeueStrategy for StaticStrategy {
    async fn distribute_fair_queues_by_env(
        &self,
        _parent_queue: &str,
        _consumer_id: &str,
    ) -> Result<Vec<EnvQueues>> {
        Ok(self.envs.clone())
    }
}
