//! Weighted random ordering of environments and their queues.
//!
//! Environments are permuted with a weighted draw without replacement; the
//! weight grows with the environment's concurrency limit and with its spare
//! capacity, depending on the configured biases. Inside an environment queues
//! are ordered oldest first, optionally blurred by `queue_age_randomization`.
//!
//! All randomness comes from one injected `ChaCha8Rng`, so a fixed seed
//! gives a fixed schedule.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::snapshot::{build_snapshot, EnvSnapshot, FairQueueSnapshot, QueueSnapshot, SnapshotSource};
use super::{EnvQueues, FairDequeueStrategy};
use crate::error::{QueueError, Result};
use crate::keys::KeyProducer;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FairQueueBiases {
    /// Favour environments with a higher concurrency limit. 0 disables.
    pub concurrency_limit_bias: f64,
    /// Favour environments with more unused capacity. 0 disables.
    pub available_capacity_bias: f64,
    /// 0 keeps queues strictly oldest first; 1 ignores age entirely.
    pub queue_age_randomization: f64,
}

impl Default for FairQueueBiases {
    fn default() -> Self {
        Self {
            concurrency_limit_bias: 0.75,
            available_capacity_bias: 0.3,
            queue_age_randomization: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightedShuffleOptions {
    /// Queues read from the parent queue per snapshot.
    pub parent_queue_limit: usize,
    pub maximum_env_count: usize,
    /// How many extra calls reuse a snapshot before it is rebuilt.
    pub reuse_snapshot_count: usize,
    pub biases: FairQueueBiases,
    /// Fixed PRNG seed. Random when absent.
    pub seed: Option<u64>,
}

impl Default for WeightedShuffleOptions {
    fn default() -> Self {
        Self {
            parent_queue_limit: 100,
            maximum_env_count: 50,
            reuse_snapshot_count: 0,
            biases: FairQueueBiases::default(),
            seed: None,
        }
    }
}

impl WeightedShuffleOptions {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_biases(mut self, biases: FairQueueBiases) -> Self {
        self.biases = biases;
        self
    }

    pub fn with_reuse_snapshot_count(mut self, count: usize) -> Self {
        self.reuse_snapshot_count = count;
        self
    }

    pub fn with_maximum_env_count(mut self, count: usize) -> Self {
        self.maximum_env_count = count;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.parent_queue_limit == 0 || self.maximum_env_count == 0 {
            return Err(QueueError::Configuration(
                "parent_queue_limit and maximum_env_count must be > 0".into(),
            ));
        }
        let b = &self.biases;
        if b.concurrency_limit_bias < 0.0 || b.available_capacity_bias < 0.0 {
            return Err(QueueError::Configuration("biases must be >= 0".into()));
        }
        if !(0.0..=1.0).contains(&b.queue_age_randomization) {
            return Err(QueueError::Configuration(
                "queue_age_randomization must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

struct CachedSnapshot {
    snapshot: FairQueueSnapshot,
    uses_left: usize,
}

pub struct WeightedShuffleStrategy {
    source: Arc<dyn SnapshotSource>,
    keys: KeyProducer,
    options: WeightedShuffleOptions,
    rng: Mutex<ChaCha8Rng>,
    cache: Mutex<HashMap<String, CachedSnapshot>>,
}

impl WeightedShuffleStrategy {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        keys: KeyProducer,
        options: WeightedShuffleOptions,
    ) -> Result<Self> {
        options.validate()?;
        let rng = match options.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::seed_from_u64(rand::random()),
        };
        Ok(Self {
            source,
            keys,
            options,
            rng: Mutex::new(rng),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Replace the generator, e.g. with one shared by a test harness.
    pub fn with_rng(mut self, rng: ChaCha8Rng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    fn cached(&self, parent_queue: &str) -> Result<Option<FairQueueSnapshot>> {
        let mut cache = self.cache.lock().map_err(|_| poisoned())?;
        if let Some(entry) = cache.get_mut(parent_queue) {
            if entry.uses_left > 0 {
                entry.uses_left -= 1;
                return Ok(Some(entry.snapshot.clone()));
            }
            cache.remove(parent_queue);
        }
        Ok(None)
    }

    async fn snapshot(&self, parent_queue: &str) -> Result<FairQueueSnapshot> {
        if let Some(snapshot) = self.cached(parent_queue)? {
            return Ok(snapshot);
        }
        let snapshot = build_snapshot(
            self.source.as_ref(),
            &self.keys,
            parent_queue,
            self.options.parent_queue_limit,
            self.options.maximum_env_count,
        )
        .await?;
        if self.options.reuse_snapshot_count > 0 {
            let mut cache = self.cache.lock().map_err(|_| poisoned())?;
            cache.insert(
                parent_queue.to_string(),
                CachedSnapshot {
                    snapshot: snapshot.clone(),
                    uses_left: self.options.reuse_snapshot_count,
                },
            );
        }
        Ok(snapshot)
    }

    fn order(&self, snapshot: &FairQueueSnapshot) -> Result<Vec<EnvQueues>> {
        let mut rng = self.rng.lock().map_err(|_| poisoned())?;
        let biases = &self.options.biases;

        let weights = env_weights(&snapshot.envs, biases);
        let order = weighted_permutation(&mut *rng, &weights);

        let mut out = Vec::with_capacity(order.len());
        for idx in order {
            let env = &snapshot.envs[idx];
            let queues: Vec<&QueueSnapshot> = snapshot.queues_of(&env.env_id).collect();
            let queues = order_queues(&mut *rng, queues, biases.queue_age_randomization);
            out.push(EnvQueues {
                env_id: env.env_id.clone(),
                queues,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl FairDequeueStrategy for WeightedShuffleStrategy {
    async fn distribute_fair_queues_by_env(
        &self,
        parent_queue: &str,
        consumer_id: &str,
    ) -> Result<Vec<EnvQueues>> {
        let snapshot = self.snapshot(parent_queue).await?;
        let ordered = self.order(&snapshot)?;
        debug!(
            parent_queue,
            consumer_id,
            envs = ordered.len(),
            "distributed fair queues"
        );
        Ok(ordered)
    }
}

fn poisoned() -> QueueError {
    QueueError::Internal("weighted shuffle lock poisoned".into())
}

/// Every environment starts at weight 1. Each active bias multiplies it by
/// `1 + (factor * bias)^2`, where the factor is the environment's limit
/// relative to the largest one, or its unused share of capacity.
pub(crate) fn env_weights(envs: &[EnvSnapshot], biases: &FairQueueBiases) -> Vec<f64> {
    let max_limit = envs
        .iter()
        .map(|e| e.concurrency_limit)
        .max()
        .unwrap_or(1)
        .max(1) as f64;

    envs.iter()
        .map(|env| {
            let mut weight = 1.0;
            if biases.concurrency_limit_bias > 0.0 {
                let normalized = env.concurrency_limit as f64 / max_limit;
                weight *= 1.0 + (normalized * biases.concurrency_limit_bias).powi(2);
            }
            if biases.available_capacity_bias > 0.0 && env.concurrency_limit > 0 {
                let used = env.current_concurrency as f64 / env.concurrency_limit as f64;
                let available = (1.0 - used).clamp(0.0, 1.0);
                weight *= 1.0 + (available * biases.available_capacity_bias).powi(2);
            }
            weight
        })
        .collect()
}

/// Weighted draw without replacement; returns indices into `weights`.
pub(crate) fn weighted_permutation<R: Rng>(rng: &mut R, weights: &[f64]) -> Vec<usize> {
    let mut remaining: Vec<usize> = (0..weights.len()).collect();
    let mut out = Vec::with_capacity(weights.len());
    while !remaining.is_empty() {
        let total: f64 = remaining.iter().map(|&i| weights[i].max(0.0)).sum();
        let pick = if total <= 0.0 {
            0
        } else {
            let mut target = rng.random::<f64>() * total;
            let mut chosen = remaining.len() - 1;
            for (pos, &i) in remaining.iter().enumerate() {
                target -= weights[i].max(0.0);
                if target < 0.0 {
                    chosen = pos;
                    break;
                }
            }
            chosen
        };
        out.push(remaining.remove(pick));
    }
    out
}

/// Oldest first. With randomization `r > 0` each queue is drawn with weight
/// `(1 - r) * normalized_age + r`, so `r = 1` is a uniform shuffle.
pub(crate) fn order_queues<R: Rng>(
    rng: &mut R,
    mut queues: Vec<&QueueSnapshot>,
    randomization: f64,
) -> Vec<String> {
    // stable, so equal ages keep parent queue order
    queues.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
    if randomization <= 0.0 || queues.len() < 2 {
        return queues.into_iter().map(|q| q.key.clone()).collect();
    }

    let max_age = queues.iter().map(|q| q.age_ms).max().unwrap_or(0).max(1) as f64;
    let weights: Vec<f64> = queues
        .iter()
        .map(|q| (1.0 - randomization) * (q.age_ms as f64 / max_age) + randomization)
        .collect();
    weighted_permutation(rng, &weights)
        .into_iter()
        .map(|i| queues[i].key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fair::StaticSnapshotSource;
    use crate::keys::{KeyStyle, RuntimeEnvironment};
    use crate::store::now_ms;

    fn env(i: usize) -> RuntimeEnvironment {
        RuntimeEnvironment::new("o", "p", format!("e{}", i), 10)
    }

    fn source_with_envs(keys: &KeyProducer, n: usize) -> Arc<StaticSnapshotSource> {
        let source = Arc::new(StaticSnapshotSource::new());
        let now = now_ms() as f64;
        let mut queues = Vec::new();
        for i in 0..n {
            queues.push((keys.queue_key(&env(i), "a", None), now - 5000.0));
            queues.push((keys.queue_key(&env(i), "b", None), now - 1000.0));
            source.set_env(format!("e{}", i), 0, 10);
        }
        source.set_queues(queues);
        source
    }

    fn strategy(source: Arc<StaticSnapshotSource>, options: WeightedShuffleOptions) -> WeightedShuffleStrategy {
        WeightedShuffleStrategy::new(source, KeyProducer::new("", KeyStyle::Long), options).unwrap()
    }

    #[tokio::test]
    async fn same_seed_same_schedule() {
        let keys = KeyProducer::new("", KeyStyle::Long);
        // uniform queue draw so the schedule depends on the seed alone
        let options = WeightedShuffleOptions::default()
            .with_seed(42)
            .with_biases(FairQueueBiases {
                queue_age_randomization: 1.0,
                ..FairQueueBiases::default()
            });
        let source = source_with_envs(&keys, 8);
        let a = strategy(source.clone(), options.clone());
        let b = strategy(source, options);
        for _ in 0..5 {
            let x = a.distribute_fair_queues_from_parent_queue("p", "c").await.unwrap();
            let y = b.distribute_fair_queues_from_parent_queue("p", "c").await.unwrap();
            assert_eq!(x, y);
            assert_eq!(x.len(), 16);
        }
    }

    #[tokio::test]
    async fn envs_at_capacity_are_excluded() {
        let keys = KeyProducer::new("", KeyStyle::Long);
        let source = source_with_envs(&keys, 3);
        source.set_env("e1", 10, 10);
        let s = strategy(source, WeightedShuffleOptions::default().with_seed(1));
        let envs = s.distribute_fair_queues_by_env("p", "c").await.unwrap();
        assert_eq!(envs.len(), 2);
        assert!(envs.iter().all(|e| e.env_id != "e1"));
    }

    #[tokio::test]
    async fn snapshot_is_reused_the_configured_number_of_times() {
        let keys = KeyProducer::new("", KeyStyle::Long);
        let source = source_with_envs(&keys, 2);
        let s = strategy(
            source.clone(),
            WeightedShuffleOptions::default()
                .with_seed(7)
                .with_reuse_snapshot_count(2),
        );
        for _ in 0..3 {
            s.distribute_fair_queues_by_env("p", "c").await.unwrap();
        }
        assert_eq!(source.reads(), 1);
        s.distribute_fair_queues_by_env("p", "c").await.unwrap();
        assert_eq!(source.reads(), 2);
    }

    #[tokio::test]
    async fn env_count_is_capped() {
        let keys = KeyProducer::new("", KeyStyle::Long);
        let s = strategy(
            source_with_envs(&keys, 10),
            WeightedShuffleOptions::default()
                .with_seed(3)
                .with_maximum_env_count(4),
        );
        let envs = s.distribute_fair_queues_by_env("p", "c").await.unwrap();
        assert_eq!(envs.len(), 4);
    }

    #[test]
    fn strict_age_order_without_randomization() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let young = QueueSnapshot { key: "young".into(), env_id: "e".into(), age_ms: 10 };
        let old = QueueSnapshot { key: "old".into(), env_id: "e".into(), age_ms: 500 };
        let tie = QueueSnapshot { key: "tie".into(), env_id: "e".into(), age_ms: 10 };
        let ordered = order_queues(&mut rng, vec![&young, &old, &tie], 0.0);
        assert_eq!(ordered, vec!["old", "young", "tie"]);
    }

    #[test]
    fn weights_follow_biases() {
        let envs = vec![
            EnvSnapshot { env_id: "big".into(), current_concurrency: 0, concurrency_limit: 100 },
            EnvSnapshot { env_id: "small".into(), current_concurrency: 0, concurrency_limit: 10 },
            EnvSnapshot { env_id: "busy".into(), current_concurrency: 90, concurrency_limit: 100 },
        ];
        let limit_only = env_weights(
            &envs,
            &FairQueueBiases { concurrency_limit_bias: 1.0, available_capacity_bias: 0.0, queue_age_randomization: 0.0 },
        );
        assert!(limit_only[0] > limit_only[1]);
        assert_eq!(limit_only[0], limit_only[2]);

        let capacity_only = env_weights(
            &envs,
            &FairQueueBiases { concurrency_limit_bias: 0.0, available_capacity_bias: 1.0, queue_age_randomization: 0.0 },
        );
        assert!(capacity_only[0] > capacity_only[2]);

        let none = env_weights(&envs, &FairQueueBiases { concurrency_limit_bias: 0.0, available_capacity_bias: 0.0, queue_age_randomization: 0.0 });
        assert!(none.iter().all(|w| (*w - 1.0).abs() < f64::EPSILON));
    }

    #[test]
    fn heavy_weight_usually_goes_first() {
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let weights = [1.0, 50.0];
        let firsts = (0..200)
            .filter(|_| weighted_permutation(&mut rng, &weights)[0] == 1)
            .count();
        assert!(firsts > 150, "heavy env first {} of 200 times", firsts);
    }

    #[test]
    fn rejects_bad_randomization() {
        let options = WeightedShuffleOptions::default().with_biases(FairQueueBiases {
            queue_age_randomization: 1.5,
            ..FairQueueBiases::default()
        });
        assert!(options.validate().is_err());
    }
}
