use std::cmp::Reverse;
use std::collections::HashSet;

use async_trait::async_trait;

use super::{EnvQueues, FairDequeueStrategy};
use crate::error::Result;
use crate::keys::KeyProducer;

/// Highest priority first. Equal priorities keep their input order, and when
/// the same logical queue appears at several priorities only its highest
/// instance is kept. Queues without a priority segment count as priority 0.
pub fn sort_queues_by_priority(keys: &KeyProducer, queues: Vec<String>) -> Vec<String> {
    let mut ranked: Vec<(u32, String, String)> = queues
        .into_iter()
        .map(|queue| match keys.extract_components_from_queue(&queue) {
            Ok(mut d) => {
                let priority = d.priority.take().unwrap_or(0);
                (priority, keys.queue_key_from_descriptor(&d), queue)
            }
            Err(_) => (0, queue.clone(), queue),
        })
        .collect();

    // sort_by_key is stable
    ranked.sort_by_key(|(priority, _, _)| Reverse(*priority));

    let mut seen = HashSet::new();
    ranked
        .into_iter()
        .filter(|(_, base, _)| seen.insert(base.clone()))
        .map(|(_, _, queue)| queue)
        .collect()
}

/// Sorts the whole flattened queue list by priority, across environments.
pub struct PriorityStrategy<S> {
    inner: S,
    keys: KeyProducer,
}

impl<S: FairDequeueStrategy> PriorityStrategy<S> {
    pub fn new(inner: S, keys: KeyProducer) -> Self {
        Self { inner, keys }
    }
}

#[async_trait]
impl<S: FairDequeueStrategy> FairDequeueStrategy for PriorityStrategy<S> {
    async fn distribute_fair_queues_by_env(
        &self,
        parent_queue: &str,
        consumer_id: &str,
    ) -> Result<Vec<EnvQueues>> {
        let envs = self
            .inner
            .distribute_fair_queues_by_env(parent_queue, consumer_id)
            .await?;
        Ok(sort_each_env(&self.keys, envs))
    }

    async fn distribute_fair_queues_from_parent_queue(
        &self,
        parent_queue: &str,
        consumer_id: &str,
    ) -> Result<Vec<String>> {
        let flat = self
            .inner
            .distribute_fair_queues_from_parent_queue(parent_queue, consumer_id)
            .await?;
        Ok(sort_queues_by_priority(&self.keys, flat))
    }
}

/// Sorts each environment's queues independently. The environments and their
/// order come from the inner strategy untouched.
pub struct EnvPriorityStrategy<S> {
    inner: S,
    keys: KeyProducer,
}

impl<S: FairDequeueStrategy> EnvPriorityStrategy<S> {
    pub fn new(inner: S, keys: KeyProducer) -> Self {
        Self { inner, keys }
    }
}

#[async_trait]
impl<S: FairDequeueStrategy> FairDequeueStrategy for EnvPriorityStrategy<S> {
    async fn distribute_fair_queues_by_env(
        &self,
        parent_queue: &str,
        consumer_id: &str,
    ) -> Result<Vec<EnvQueues>> {
        let envs = self
            .inner
            .distribute_fair_queues_by_env(parent_queue, consumer_id)
            .await?;
        Ok(sort_each_env(&self.keys, envs))
    }
}

fn sort_each_env(keys: &KeyProducer, envs: Vec<EnvQueues>) -> Vec<EnvQueues> {
    envs.into_iter()
        .map(|env| EnvQueues {
            queues: sort_queues_by_priority(keys, env.queues),
            env_id: env.env_id,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fair::StaticStrategy;
    use crate::keys::{KeyStyle, RuntimeEnvironment};

    fn keys() -> KeyProducer {
        KeyProducer::new("rq:", KeyStyle::Long)
    }

    fn q(env: &RuntimeEnvironment, name: &str, priority: Option<u32>) -> String {
        keys().queue_key_with_priority(env, name, None, priority)
    }

    #[test]
    fn mixed_priorities_keep_relative_order() {
        let env = RuntimeEnvironment::new("o", "p", "e", 10);
        let input = vec![
            q(&env, "q1", None),
            q(&env, "q2", Some(1)),
            q(&env, "q3", None),
            q(&env, "q4", Some(1)),
            q(&env, "q5", None),
        ];
        let sorted = sort_queues_by_priority(&keys(), input.clone());
        assert_eq!(
            sorted,
            vec![
                input[1].clone(),
                input[3].clone(),
                input[0].clone(),
                input[2].clone(),
                input[4].clone(),
            ]
        );
    }

    #[test]
    fn same_queue_at_several_priorities_keeps_highest() {
        let env = RuntimeEnvironment::new("o", "p", "e", 10);
        let input = vec![
            q(&env, "dup", None),
            q(&env, "dup", Some(1)),
            q(&env, "other", None),
            q(&env, "dup", Some(2)),
            q(&env, "dup", Some(3)),
        ];
        let sorted = sort_queues_by_priority(&keys(), input);
        assert_eq!(sorted, vec![q(&env, "dup", Some(3)), q(&env, "other", None)]);
    }

    #[test]
    fn unparseable_keys_are_kept_as_priority_zero() {
        let env = RuntimeEnvironment::new("o", "p", "e", 10);
        let input = vec!["garbage".to_string(), q(&env, "a", Some(5))];
        let sorted = sort_queues_by_priority(&keys(), input);
        assert_eq!(sorted, vec![q(&env, "a", Some(5)), "garbage".to_string()]);
    }

    #[tokio::test]
    async fn env_wrapper_sorts_within_each_env_only() {
        let e1 = RuntimeEnvironment::new("o", "p", "e1", 10);
        let e2 = RuntimeEnvironment::new("o", "p", "e2", 10);
        let inner = StaticStrategy::new(vec![
            EnvQueues {
                env_id: "e1".into(),
                queues: vec![q(&e1, "a", None), q(&e1, "b", Some(2))],
            },
            EnvQueues {
                env_id: "e2".into(),
                queues: vec![q(&e2, "c", Some(9))],
            },
        ]);
        let strategy = EnvPriorityStrategy::new(inner, keys());
        let flat = strategy
            .distribute_fair_queues_from_parent_queue("rq:sharedQueue", "c1")
            .await
            .unwrap();
        assert_eq!(
            flat,
            vec![q(&e1, "b", Some(2)), q(&e1, "a", None), q(&e2, "c", Some(9))]
        );
    }

    #[tokio::test]
    async fn priority_strategy_sorts_across_envs() {
        let e1 = RuntimeEnvironment::new("o", "p", "e1", 10);
        let e2 = RuntimeEnvironment::new("o", "p", "e2", 10);
        let inner = StaticStrategy::new(vec![
            EnvQueues {
                env_id: "e1".into(),
                queues: vec![q(&e1, "a", None)],
            },
            EnvQueues {
                env_id: "e2".into(),
                queues: vec![q(&e2, "c", Some(1))],
            },
        ]);
        let strategy = PriorityStrategy::new(inner, keys());
        let flat = strategy
            .distribute_fair_queues_from_parent_queue("rq:sharedQueue", "c1")
            .await
            .unwrap();
        assert_eq!(flat, vec![q(&e2, "c", Some(1)), q(&e1, "a", None)]);
    }
}
