//! Redis-backed DRR state.
//!
//! ```text
//! <prefix>drr:envs                 zset env id -> activation ms
//! <prefix>drr:env:<env>:batches    zset batch id -> created ms
//! <prefix>drr:batch:<id>:items     list of BatchItem json
//! <prefix>drr:deficit              hash env id -> credit
//! ```
//!
//! Credits are fractional, so they travel as strings: Redis truncates Lua
//! numbers to integers in replies.

use async_trait::async_trait;
use redis::{AsyncCommands, Script};

use super::drr::{BatchItem, DrrBackend, PopResult, ScheduledItem};
use crate::error::{QueueError, Result};
use crate::store::RedisStore;

/// KEYS: envs, env batches, batch items
/// ARGV: env id, batch id, created at, 'head' | 'tail', item json...
const ADD_BATCH: &str = r#"
redis.call('ZADD', KEYS[1], 'NX', ARGV[3], ARGV[1])
redis.call('ZADD', KEYS[2], 'NX', ARGV[3], ARGV[2])
if ARGV[4] == 'head' then
    for i = #ARGV, 5, -1 do
        redis.call('LPUSH', KEYS[3], ARGV[i])
    end
else
    for i = 5, #ARGV do
        redis.call('RPUSH', KEYS[3], ARGV[i])
    end
end
return #ARGV - 4
"#;

/// KEYS: deficit hash
/// ARGV: env id, quantum, max deficit
const ADD_QUANTUM: &str = r#"
local current = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '0')
local next_deficit = math.min(current + tonumber(ARGV[2]), tonumber(ARGV[3]))
redis.call('HSET', KEYS[1], ARGV[1], tostring(next_deficit))
return tostring(next_deficit)
"#;

/// KEYS: envs, deficit hash, env batches
/// ARGV: env id, batch key prefix, items suffix
const POP_ITEM: &str = r#"
local env = ARGV[1]
local deficit = tonumber(redis.call('HGET', KEYS[2], env) or '0')
if deficit < 1 then
    return {'no_credit'}
end

local function deactivate()
    redis.call('ZREM', KEYS[1], env)
    redis.call('HDEL', KEYS[2], env)
    redis.call('DEL', KEYS[3])
end

while true do
    local head = redis.call('ZRANGE', KEYS[3], 0, 0)
    if #head == 0 then
        deactivate()
        return {'empty'}
    end
    local batch = head[1]
    local items_key = ARGV[2] .. batch .. ARGV[3]
    local item = redis.call('LPOP', items_key)
    if item then
        if redis.call('LLEN', items_key) == 0 then
            redis.call('ZREM', KEYS[3], batch)
        end
        if redis.call('ZCARD', KEYS[3]) == 0 then
            deactivate()
        else
            redis.call('HSET', KEYS[2], env, tostring(deficit - 1))
        end
        return {'item', batch, item}
    end
    redis.call('ZREM', KEYS[3], batch)
end
"#;

pub struct RedisDrrBackend {
    store: RedisStore,
    add_batch: Script,
    add_quantum: Script,
    pop_item: Script,
}

impl RedisDrrBackend {
    pub fn new(store: RedisStore) -> Self {
        Self {
            store,
            add_batch: Script::new(ADD_BATCH),
            add_quantum: Script::new(ADD_QUANTUM),
            pop_item: Script::new(POP_ITEM),
        }
    }

    pub fn script_sources() -> [&'static str; 3] {
        [ADD_BATCH, ADD_QUANTUM, POP_ITEM]
    }

    fn envs_key(&self) -> String {
        self.store.key("drr:envs")
    }

    fn deficit_key(&self) -> String {
        self.store.key("drr:deficit")
    }

    fn env_batches_key(&self, env_id: &str) -> String {
        self.store.key(&format!("drr:env:{}:batches", env_id))
    }

    fn batch_key_prefix(&self) -> String {
        self.store.key("drr:batch:")
    }

    fn batch_items_key(&self, batch_id: &str) -> String {
        format!("{}{}:items", self.batch_key_prefix(), batch_id)
    }

    async fn push_items(
        &self,
        env_id: &str,
        batch_id: &str,
        items: &[BatchItem],
        created_at_ms: i64,
        end: &str,
    ) -> Result<()> {
        let mut invocation = self.add_batch.prepare_invoke();
        invocation
            .key(self.envs_key())
            .key(self.env_batches_key(env_id))
            .key(self.batch_items_key(batch_id))
            .arg(env_id)
            .arg(batch_id)
            .arg(created_at_ms)
            .arg(end);
        for item in items {
            invocation.arg(serde_json::to_string(item)?);
        }
        let mut conn = self.store.conn().await?;
        let _: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(())
    }
}

#[async_trait]
impl DrrBackend for RedisDrrBackend {
    async fn add_batch(
        &self,
        env_id: &str,
        batch_id: &str,
        items: Vec<BatchItem>,
        created_at_ms: i64,
    ) -> Result<()> {
        self.push_items(env_id, batch_id, &items, created_at_ms, "tail")
            .await
    }

    async fn requeue_item(&self, item: ScheduledItem, created_at_ms: i64) -> Result<()> {
        self.push_items(
            &item.env_id,
            &item.batch_id,
            std::slice::from_ref(&item.item),
            created_at_ms,
            "head",
        )
        .await
    }

    async fn active_envs(&self) -> Result<Vec<String>> {
        let mut conn = self.store.conn().await?;
        Ok(conn.zrange(self.envs_key(), 0, -1).await?)
    }

    async fn add_quantum(&self, env_id: &str, quantum: f64, max_deficit: f64) -> Result<f64> {
        let mut invocation = self.add_quantum.prepare_invoke();
        invocation
            .key(self.deficit_key())
            .arg(env_id)
            .arg(quantum)
            .arg(max_deficit);
        let mut conn = self.store.conn().await?;
        let raw: String = invocation.invoke_async(&mut *conn).await?;
        parse_deficit(&raw)
    }

    async fn pop_item(&self, env_id: &str) -> Result<PopResult> {
        let mut invocation = self.pop_item.prepare_invoke();
        invocation
            .key(self.envs_key())
            .key(self.deficit_key())
            .key(self.env_batches_key(env_id))
            .arg(env_id)
            .arg(self.batch_key_prefix())
            .arg(":items");
        let mut conn = self.store.conn().await?;
        let reply: Vec<String> = invocation.invoke_async(&mut *conn).await?;
        parse_pop_reply(env_id, reply)
    }

    async fn deficit(&self, env_id: &str) -> Result<f64> {
        let mut conn = self.store.conn().await?;
        let raw: Option<String> = conn.hget(self.deficit_key(), env_id).await?;
        match raw {
            Some(raw) => parse_deficit(&raw),
            None => Ok(0.0),
        }
    }
}

fn parse_deficit(raw: &str) -> Result<f64> {
    raw.parse()
        .map_err(|_| QueueError::Internal(format!("unparseable deficit: {}", raw)))
}

fn parse_pop_reply(env_id: &str, reply: Vec<String>) -> Result<PopResult> {
    let mut parts = reply.into_iter();
    match parts.next().as_deref() {
        Some("no_credit") => Ok(PopResult::NoCredit),
        Some("empty") => Ok(PopResult::Empty),
        Some("item") => {
            let (Some(batch_id), Some(raw)) = (parts.next(), parts.next()) else {
                return Err(QueueError::Internal("truncated drr pop reply".into()));
            };
            Ok(PopResult::Item(ScheduledItem {
                batch_id,
                env_id: env_id.to_string(),
                item: serde_json::from_str(&raw)?,
            }))
        }
        other => Err(QueueError::Internal(format!(
            "unexpected drr pop status: {:?}",
            other
        ))),
    }
}
