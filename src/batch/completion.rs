//! Idempotent per-item bookkeeping for batches.
//!
//! ```text
//! <prefix>batch:{id}:meta            BatchMeta json
//! <prefix>batch:{id}:processed       set of processed item keys
//! <prefix>batch:{id}:runs            list of successful run ids
//! <prefix>batch:{id}:failures        list of BatchItemFailure json
//! <prefix>batch:{id}:processedCount  counter
//! <prefix>batch:{id}:enqueued        set of enqueued item indices
//! ```
//!
//! Recording is a single script: an item key that was already processed
//! changes nothing, but the current count is returned either way, so a
//! redelivered item reads the same answer as its first delivery.

use chrono::Utc;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::store::RedisStore;

/// KEYS: processed set, list, counter
/// ARGV: item key, list value
const RECORD: &str = r#"
local added = redis.call('SADD', KEYS[1], ARGV[1])
if added == 1 then
    redis.call('RPUSH', KEYS[2], ARGV[2])
    redis.call('INCR', KEYS[3])
end
return tonumber(redis.call('GET', KEYS[3]) or '0')
"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMeta {
    pub batch_id: String,
    pub environment_id: String,
    pub organization_id: String,
    pub project_id: String,
    pub run_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    pub created_at: i64,
}

impl BatchMeta {
    pub fn new(
        batch_id: impl Into<String>,
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
        environment_id: impl Into<String>,
        run_count: u64,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            environment_id: environment_id.into(),
            organization_id: organization_id.into(),
            project_id: project_id.into(),
            run_count,
            parent_run_id: None,
            created_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_parent_run_id(mut self, parent_run_id: impl Into<String>) -> Self {
        self.parent_run_id = Some(parent_run_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub index: u32,
    pub task_identifier: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub timestamp: i64,
}

impl BatchItemFailure {
    pub fn new(index: u32, task_identifier: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            index,
            task_identifier: task_identifier.into(),
            error: error.into(),
            error_code: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }
}

/// What callers get once a batch completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub run_ids: Vec<String>,
    pub successful_run_count: u64,
    pub failed_run_count: u64,
    pub failures: Vec<BatchItemFailure>,
}

struct BatchKeys {
    meta: String,
    processed: String,
    runs: String,
    failures: String,
    processed_count: String,
    enqueued: String,
}

impl BatchKeys {
    fn new(prefix: &str, batch_id: &str) -> Self {
        let base = format!("{}batch:{{{}}}", prefix, batch_id);
        Self {
            meta: format!("{}:meta", base),
            processed: format!("{}:processed", base),
            runs: format!("{}:runs", base),
            failures: format!("{}:failures", base),
            processed_count: format!("{}:processedCount", base),
            enqueued: format!("{}:enqueued", base),
        }
    }

    fn all(&self) -> [&str; 6] {
        [
            &self.meta,
            &self.processed,
            &self.runs,
            &self.failures,
            &self.processed_count,
            &self.enqueued,
        ]
    }
}

pub struct BatchCompletionTracker {
    store: RedisStore,
    record: Script,
}

impl BatchCompletionTracker {
    pub fn new(store: RedisStore) -> Self {
        Self {
            store,
            record: Script::new(RECORD),
        }
    }

    pub fn script_source() -> &'static str {
        RECORD
    }

    fn keys(&self, batch_id: &str) -> BatchKeys {
        BatchKeys::new(self.store.key_prefix(), batch_id)
    }

    pub async fn store_meta(&self, meta: &BatchMeta) -> Result<()> {
        let raw = serde_json::to_string(meta)?;
        let mut conn = self.store.conn().await?;
        let _: () = conn.set(self.keys(&meta.batch_id).meta, raw).await?;
        Ok(())
    }

    pub async fn get_meta(&self, batch_id: &str) -> Result<Option<BatchMeta>> {
        let mut conn = self.store.conn().await?;
        let raw: Option<String> = conn.get(self.keys(batch_id).meta).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn record(&self, keys: [&str; 3], item_key: &str, value: &str) -> Result<u64> {
        let mut invocation = self.record.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(item_key).arg(value);
        let mut conn = self.store.conn().await?;
        let count: u64 = invocation.invoke_async(&mut *conn).await?;
        Ok(count)
    }

    /// Record a successful item. Deduplicated on `item_index`, or on the
    /// run id when no index is given. Returns the processed count.
    pub async fn record_success(
        &self,
        batch_id: &str,
        run_id: &str,
        item_index: Option<u32>,
    ) -> Result<u64> {
        let keys = self.keys(batch_id);
        let item_key = item_index
            .map(|i| i.to_string())
            .unwrap_or_else(|| run_id.to_string());
        let count = self
            .record([&keys.processed, &keys.runs, &keys.processed_count], &item_key, run_id)
            .await?;
        debug!(batch_id, run_id, item_key = %item_key, processed = count, "batch item succeeded");
        Ok(count)
    }

    /// Record a failed item, deduplicated on its index.
    pub async fn record_failure(&self, batch_id: &str, failure: &BatchItemFailure) -> Result<u64> {
        let keys = self.keys(batch_id);
        let raw = serde_json::to_string(failure)?;
        let count = self
            .record(
                [&keys.processed, &keys.failures, &keys.processed_count],
                &failure.index.to_string(),
                &raw,
            )
            .await?;
        debug!(batch_id, index = failure.index, processed = count, "batch item failed");
        Ok(count)
    }

    pub async fn get_processed_count(&self, batch_id: &str) -> Result<u64> {
        let mut conn = self.store.conn().await?;
        let count: Option<u64> = conn.get(self.keys(batch_id).processed_count).await?;
        Ok(count.unwrap_or(0))
    }

    /// False when the metadata is missing, including after cleanup.
    pub async fn is_complete(&self, batch_id: &str) -> Result<bool> {
        let Some(meta) = self.get_meta(batch_id).await? else {
            return Ok(false);
        };
        Ok(self.get_processed_count(batch_id).await? >= meta.run_count)
    }

    pub async fn get_successful_runs(&self, batch_id: &str) -> Result<Vec<String>> {
        let mut conn = self.store.conn().await?;
        Ok(conn.lrange(self.keys(batch_id).runs, 0, -1).await?)
    }

    pub async fn get_failures(&self, batch_id: &str) -> Result<Vec<BatchItemFailure>> {
        let mut conn = self.store.conn().await?;
        let raw: Vec<String> = conn.lrange(self.keys(batch_id).failures, 0, -1).await?;
        let mut failures = Vec::with_capacity(raw.len());
        for r in raw {
            failures.push(serde_json::from_str(&r)?);
        }
        Ok(failures)
    }

    /// Returns true the first time an index is marked.
    pub async fn mark_item_enqueued(&self, batch_id: &str, item_index: u32) -> Result<bool> {
        let mut conn = self.store.conn().await?;
        let added: u64 = conn.sadd(self.keys(batch_id).enqueued, item_index).await?;
        Ok(added == 1)
    }

    /// Forget enqueued marks, so the indices can be submitted again.
    pub async fn unmark_items_enqueued(&self, batch_id: &str, item_indices: &[u32]) -> Result<()> {
        if item_indices.is_empty() {
            return Ok(());
        }
        let mut conn = self.store.conn().await?;
        let _: u64 = conn.srem(self.keys(batch_id).enqueued, item_indices).await?;
        Ok(())
    }

    pub async fn get_enqueued_count(&self, batch_id: &str) -> Result<u64> {
        let mut conn = self.store.conn().await?;
        Ok(conn.scard(self.keys(batch_id).enqueued).await?)
    }

    pub async fn completion_result(&self, batch_id: &str) -> Result<BatchResult> {
        let run_ids = self.get_successful_runs(batch_id).await?;
        let failures = self.get_failures(batch_id).await?;
        Ok(BatchResult {
            batch_id: batch_id.to_string(),
            successful_run_count: run_ids.len() as u64,
            failed_run_count: failures.len() as u64,
            run_ids,
            failures,
        })
    }

    /// Delete every key of the batch. Call once, after the result was read.
    pub async fn cleanup(&self, batch_id: &str) -> Result<()> {
        let keys = self.keys(batch_id);
        let mut conn = self.store.conn().await?;
        let _: () = conn.del(&keys.all()[..]).await?;
        debug!(batch_id, "batch state cleaned up");
        Ok(())
    }
}
