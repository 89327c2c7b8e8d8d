//! Lua scripts behind [`SimpleQueue`](super::SimpleQueue).
//!
//! Key order is the same for every script so the Rust side can build one
//! invocation helper:
//!
//! 1. queue (zset: id -> visible-at ms)
//! 2. items (hash: id -> item json)
//! 3. attempts (hash: id -> previous deliveries)
//! 4. dlq (zset: id -> dead-lettered-at ms)
//! 5. dlq items (hash)
//! 6. dlq errors (hash)

use redis::Script;

/// ARGV: id, available_at_ms, item_json, attempt
const ENQUEUE: &str = r#"
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[4])
return 1
"#;

/// ARGV: now_ms, limit
///
/// Returns `{orphans_removed, dead_lettered, id, score, item_json, attempt, ...}`.
/// An item whose JSON does not decode is moved to the dead-letter queue
/// instead of being handed out.
const DEQUEUE: &str = r#"
local now = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local result = { '0', '0' }
local orphans = 0
local dead = 0

local entries = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'WITHSCORES', 'LIMIT', 0, limit)
for i = 1, #entries, 2 do
    local id = entries[i]
    local score = entries[i + 1]
    local raw = redis.call('HGET', KEYS[2], id)
    if not raw then
        redis.call('ZREM', KEYS[1], id)
        redis.call('HDEL', KEYS[3], id)
        orphans = orphans + 1
    else
        local ok, item = pcall(cjson.decode, raw)
        if ok and type(item) == 'table' then
            local timeout = tonumber(item['visibilityTimeoutMs']) or 0
            local attempt = tonumber(redis.call('HGET', KEYS[3], id) or '0') or 0
            redis.call('ZADD', KEYS[1], now + timeout, id)
            redis.call('HSET', KEYS[3], id, attempt + 1)
            table.insert(result, id)
            table.insert(result, score)
            table.insert(result, raw)
            table.insert(result, tostring(attempt))
        else
            redis.call('ZREM', KEYS[1], id)
            redis.call('HDEL', KEYS[2], id)
            redis.call('HDEL', KEYS[3], id)
            redis.call('ZADD', KEYS[4], now, id)
            redis.call('HSET', KEYS[5], id, raw)
            redis.call('HSET', KEYS[6], id, 'undecodable item')
            dead = dead + 1
        end
    end
end

result[1] = tostring(orphans)
result[2] = tostring(dead)
return result
"#;

/// ARGV: id
const ACK: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return removed
"#;

/// ARGV: id, now_ms, error
const MOVE_TO_DLQ: &str = r#"
local raw = redis.call('HGET', KEYS[2], ARGV[1])
if not raw then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[4], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[5], ARGV[1], raw)
redis.call('HSET', KEYS[6], ARGV[1], ARGV[3])
return 1
"#;

/// ARGV: id, now_ms
const REDRIVE: &str = r#"
local raw = redis.call('HGET', KEYS[5], ARGV[1])
if not raw then
    return 0
end
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('HDEL', KEYS[5], ARGV[1])
redis.call('HDEL', KEYS[6], ARGV[1])
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], raw)
redis.call('HSET', KEYS[3], ARGV[1], 0)
return 1
"#;

pub(crate) struct SimpleQueueScripts {
    pub enqueue: Script,
    pub dequeue: Script,
    pub ack: Script,
    pub move_to_dlq: Script,
    pub redrive: Script,
}

impl SimpleQueueScripts {
    pub fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            dequeue: Script::new(DEQUEUE),
            ack: Script::new(ACK),
            move_to_dlq: Script::new(MOVE_TO_DLQ),
            redrive: Script::new(REDRIVE),
        }
    }

    /// Raw sources, for `SCRIPT LOAD` checks.
    pub fn sources() -> [&'static str; 5] {
        [ENQUEUE, DEQUEUE, ACK, MOVE_TO_DLQ, REDRIVE]
    }
}
