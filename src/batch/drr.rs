//! Deficit round robin across environments, one batch item at a time.
//!
//! Each round every environment with pending batches gets one `quantum` of
//! credit (capped at `max_deficit`), then drains items from its oldest batch
//! while it has at least one unit of credit left. An environment whose last
//! batch empties loses its remaining credit.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{QueueError, Result};
use crate::store::now_ms;

/// One item of a batch, as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub index: u32,
    pub task_identifier: String,
    pub payload: Value,
}

impl BatchItem {
    pub fn new(index: u32, task_identifier: impl Into<String>, payload: Value) -> Self {
        Self {
            index,
            task_identifier: task_identifier.into(),
            payload,
        }
    }
}

/// An item handed out by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledItem {
    pub batch_id: String,
    pub env_id: String,
    pub item: BatchItem,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PopResult {
    Item(ScheduledItem),
    /// The environment has work but less than one unit of credit.
    NoCredit,
    /// The environment has no pending batches; its credit was reset.
    Empty,
}

/// Storage for the scheduler's state. Every method is atomic on its own.
#[async_trait]
pub trait DrrBackend: Send + Sync {
    /// Append items to a batch, registering the batch and its environment
    /// if they are new.
    async fn add_batch(
        &self,
        env_id: &str,
        batch_id: &str,
        items: Vec<BatchItem>,
        created_at_ms: i64,
    ) -> Result<()>;

    /// Put a popped item back at the head of its batch, registering the
    /// batch and environment again if they drained in the meantime.
    async fn requeue_item(&self, item: ScheduledItem, created_at_ms: i64) -> Result<()>;

    /// Environments with pending work, in the order they became active.
    async fn active_envs(&self) -> Result<Vec<String>>;

    /// Add `quantum`, capped at `max_deficit`; returns the new deficit.
    async fn add_quantum(&self, env_id: &str, quantum: f64, max_deficit: f64) -> Result<f64>;

    /// Take the next item of the environment's oldest batch, spending one
    /// unit of credit.
    async fn pop_item(&self, env_id: &str) -> Result<PopResult>;

    async fn deficit(&self, env_id: &str) -> Result<f64>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrrOptions {
    pub quantum: f64,
    pub max_deficit: f64,
    /// Upper bound on items handed out by one round.
    pub max_items_per_round: usize,
}

impl Default for DrrOptions {
    fn default() -> Self {
        Self {
            quantum: 5.0,
            max_deficit: 50.0,
            max_items_per_round: 100,
        }
    }
}

impl DrrOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.quantum > 0.0) {
            return Err(QueueError::Configuration("quantum must be > 0".into()));
        }
        if self.max_deficit < self.quantum.max(1.0) {
            return Err(QueueError::Configuration(
                "max_deficit must be >= quantum and >= 1".into(),
            ));
        }
        if self.max_items_per_round == 0 {
            return Err(QueueError::Configuration(
                "max_items_per_round must be > 0".into(),
            ));
        }
        Ok(())
    }
}

pub struct DrrScheduler<B> {
    backend: B,
    options: DrrOptions,
}

impl<B: DrrBackend> DrrScheduler<B> {
    pub fn new(backend: B, options: DrrOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { backend, options })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> &DrrOptions {
        &self.options
    }

    pub async fn add_batch(
        &self,
        env_id: &str,
        batch_id: &str,
        items: Vec<BatchItem>,
        created_at_ms: i64,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.backend
            .add_batch(env_id, batch_id, items, created_at_ms)
            .await
    }

    /// Hand an item back after it could not be recorded. It goes out again
    /// before the rest of its batch.
    pub async fn requeue(&self, item: ScheduledItem) -> Result<()> {
        self.backend.requeue_item(item, now_ms()).await
    }

    /// One scheduling round. Environments are visited in activation order
    /// and each gets exactly one quantum.
    pub async fn run_round(&self) -> Result<Vec<ScheduledItem>> {
        let envs = self.backend.active_envs().await?;
        let mut out = Vec::new();

        'envs: for env_id in envs {
            let deficit = self
                .backend
                .add_quantum(&env_id, self.options.quantum, self.options.max_deficit)
                .await?;
            let mut taken = 0usize;
            loop {
                if out.len() >= self.options.max_items_per_round {
                    break 'envs;
                }
                match self.backend.pop_item(&env_id).await? {
                    PopResult::Item(item) => {
                        taken += 1;
                        out.push(item);
                    }
                    PopResult::NoCredit | PopResult::Empty => break,
                }
            }
            debug!(env_id = %env_id, deficit, taken, "drr env served");
        }
        Ok(out)
    }
}

#[derive(Default)]
struct InMemoryState {
    /// (env, activated at), kept sorted by activation
    envs: Vec<(String, i64)>,
    batches: HashMap<String, VecDeque<(String, i64, VecDeque<BatchItem>)>>,
    deficits: HashMap<String, f64>,
}

impl InMemoryState {
    fn insert(
        &mut self,
        env_id: &str,
        batch_id: &str,
        items: Vec<BatchItem>,
        created_at_ms: i64,
        at_head: bool,
    ) {
        let batches = self.batches.entry(env_id.to_string()).or_default();
        match batches.iter_mut().find(|(id, _, _)| id == batch_id) {
            Some((_, _, pending)) if at_head => {
                for item in items.into_iter().rev() {
                    pending.push_front(item);
                }
            }
            Some((_, _, pending)) => pending.extend(items),
            None => {
                let pos = batches
                    .iter()
                    .position(|(id, created, _)| {
                        (*created, id.as_str()) > (created_at_ms, batch_id)
                    })
                    .unwrap_or(batches.len());
                batches.insert(pos, (batch_id.to_string(), created_at_ms, items.into()));
            }
        }
        if !self.envs.iter().any(|(e, _)| e == env_id) {
            let pos = self
                .envs
                .iter()
                .position(|(e, at)| (*at, e.as_str()) > (created_at_ms, env_id))
                .unwrap_or(self.envs.len());
            self.envs.insert(pos, (env_id.to_string(), created_at_ms));
        }
    }

    fn deactivate(&mut self, env_id: &str) {
        self.envs.retain(|(e, _)| e != env_id);
        self.batches.remove(env_id);
        self.deficits.remove(env_id);
    }
}

/// Process-local backend with the same semantics as the Redis one.
#[derive(Default)]
pub struct InMemoryDrrBackend {
    state: Mutex<InMemoryState>,
}

impl InMemoryDrrBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>> {
        self.state
            .lock()
            .map_err(|_| QueueError::Internal("drr state lock poisoned".into()))
    }
}

#[async_trait]
impl DrrBackend for InMemoryDrrBackend {
    async fn add_batch(
        &self,
        env_id: &str,
        batch_id: &str,
        items: Vec<BatchItem>,
        created_at_ms: i64,
    ) -> Result<()> {
        self.lock()?
            .insert(env_id, batch_id, items, created_at_ms, false);
        Ok(())
    }

    async fn requeue_item(&self, item: ScheduledItem, created_at_ms: i64) -> Result<()> {
        self.lock()?.insert(
            &item.env_id,
            &item.batch_id,
            vec![item.item],
            created_at_ms,
            true,
        );
        Ok(())
    }

    async fn active_envs(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.envs.iter().map(|(e, _)| e.clone()).collect())
    }

    async fn add_quantum(&self, env_id: &str, quantum: f64, max_deficit: f64) -> Result<f64> {
        let mut state = self.lock()?;
        let deficit = state.deficits.entry(env_id.to_string()).or_insert(0.0);
        *deficit = (*deficit + quantum).min(max_deficit);
        Ok(*deficit)
    }

    async fn pop_item(&self, env_id: &str) -> Result<PopResult> {
        let mut state = self.lock()?;
        let deficit = state.deficits.get(env_id).copied().unwrap_or(0.0);
        if deficit < 1.0 {
            return Ok(PopResult::NoCredit);
        }

        let popped = loop {
            let Some(batches) = state.batches.get_mut(env_id) else {
                break None;
            };
            let Some((batch_id, _, items)) = batches.front_mut() else {
                break None;
            };
            match items.pop_front() {
                Some(item) => {
                    let batch_id = batch_id.clone();
                    if items.is_empty() {
                        batches.pop_front();
                    }
                    break Some((batch_id, item));
                }
                None => {
                    batches.pop_front();
                }
            }
        };

        let Some((batch_id, item)) = popped else {
            state.deactivate(env_id);
            return Ok(PopResult::Empty);
        };

        let drained = state
            .batches
            .get(env_id)
            .map_or(true, |batches| batches.is_empty());
        if drained {
            state.deactivate(env_id);
        } else {
            state.deficits.insert(env_id.to_string(), deficit - 1.0);
        }

        Ok(PopResult::Item(ScheduledItem {
            batch_id,
            env_id: env_id.to_string(),
            item,
        }))
    }

    async fn deficit(&self, env_id: &str) -> Result<f64> {
        Ok(self.lock()?.deficits.get(env_id).copied().unwrap_or(0.0))
    }
}
