//! Lua scripts behind the run queue.
//!
//! Every multi-key invariant (check-and-increment across concurrency scopes,
//! token consumption, parent queue bookkeeping) lives in one of these
//! scripts. The client never does read-modify-write on the same keys.
//!
//! Messages are stored as hashes: `data` (message JSON), `state`
//! (`queued` | `inflight` | `released`) and `attempt`.

use redis::Script;

/// Helpers prepended to every script.
const PRELUDE: &str = r#"
local function rebalance_parent(queue_key, parent_key)
    local earliest = redis.call('ZRANGE', queue_key, 0, 0, 'WITHSCORES')
    if #earliest == 0 then
        redis.call('ZREM', parent_key, queue_key)
    else
        redis.call('ZADD', parent_key, earliest[2], queue_key)
    end
end

local function current_of(key)
    return tonumber(redis.call('GET', key) or '0') or 0
end

local function limit_of(key, default)
    local value = redis.call('GET', key)
    if value then
        return tonumber(value)
    end
    return default
end

local function decr_floored(key)
    local value = redis.call('DECR', key)
    if value <= 0 then
        redis.call('DEL', key)
    end
end

local function field_or_empty(msg, field)
    local value = msg[field]
    if value == nil or value == cjson.null then
        return ''
    end
    return tostring(value)
end
"#;

/// KEYS: queue, parent queue, message, env limit
/// ARGV: run_id, message_json, score, env_limit
///
/// Returns `{status, held_json}`. Status is `created`, `updated` or `held`.
/// A queued run that moves to another queue or parent is taken out of the
/// old one first. An in-flight or released run is left untouched and its
/// stored JSON is returned so the caller can rewrite it in place.
const ENQUEUE: &str = r#"
local state = redis.call('HGET', KEYS[3], 'state')
if state == 'inflight' or state == 'released' then
    return { 'held', redis.call('HGET', KEYS[3], 'data') or '' }
end

local previous = redis.call('HGET', KEYS[3], 'data')
if previous then
    local old = cjson.decode(previous)
    local old_queue = field_or_empty(old, 'queue')
    local old_parent = field_or_empty(old, 'parentQueue')
    if old_queue ~= '' and (old_queue ~= KEYS[1] or old_parent ~= KEYS[2]) then
        redis.call('ZREM', old_queue, ARGV[1])
        if old_parent ~= '' then
            rebalance_parent(old_queue, old_parent)
        end
    end
end

redis.call('HSET', KEYS[3], 'data', ARGV[2])
if not state then
    redis.call('HSET', KEYS[3], 'state', 'queued', 'attempt', 0)
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
rebalance_parent(KEYS[1], KEYS[2])
redis.call('SET', KEYS[4], ARGV[4])
if state then
    return { 'updated', '' }
end
return { 'created', '' }
"#;

/// KEYS: message
/// ARGV: expected_json, message_json
///
/// Swaps the data of a held run if nobody touched it since it was read.
const OVERWRITE_HELD: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state ~= 'inflight' and state ~= 'released' then
    return 0
end
if redis.call('HGET', KEYS[1], 'data') ~= ARGV[1] then
    return 0
end
redis.call('HSET', KEYS[1], 'data', ARGV[2])
return 1
"#;

/// KEYS:
///   1 queue, 2 parent queue, 3 queue current, 4 queue limit,
///   5 env current, 6 env limit, 7 project current, 8 org disabled flag,
///   9 rate limit config
/// ARGV:
///   1 now_ms, 2 default env limit, 3 message key prefix, 4 task key prefix,
///   5 current suffix, 6 limit suffix, 7 bucket prefix,
///   8 rate limits enabled, 9 max candidates, 10 reschedule rate limited
///
/// Returns `{status, message_json, remaining, attempt}`.
const DEQUEUE: &str = r#"
local now = tonumber(ARGV[1])

local function reply(status, raw, attempt)
    return { status, raw or '', tostring(redis.call('ZCARD', KEYS[1])), tostring(attempt or 0) }
end

if redis.call('EXISTS', KEYS[8]) == 1 then
    return reply('org_disabled')
end

local env_limit = limit_of(KEYS[6], tonumber(ARGV[2]))
if current_of(KEYS[5]) >= env_limit then
    return reply('env_at_capacity')
end

local queue_limit = limit_of(KEYS[4], env_limit)
if current_of(KEYS[3]) >= queue_limit then
    return reply('queue_at_capacity')
end

local candidates = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, tonumber(ARGV[9]))
if #candidates == 0 then
    rebalance_parent(KEYS[1], KEYS[2])
    return reply('empty')
end

local rate_limit = nil
if ARGV[8] == '1' then
    local config = redis.call('HMGET', KEYS[9], 'limit', 'periodMs', 'burst')
    if config[1] and config[2] and config[3] then
        rate_limit = {
            rate = tonumber(config[1]) / tonumber(config[2]),
            burst = tonumber(config[3]),
            ttl = math.ceil(tonumber(config[3]) * tonumber(config[2]) / tonumber(config[1])) + 1000,
        }
    end
end

local rate_limited = 0
local task_blocked = 0

for _, run_id in ipairs(candidates) do
    local message_key = ARGV[3] .. run_id
    local raw = redis.call('HGET', message_key, 'data')
    local held = redis.call('HGET', message_key, 'state')
    if not raw or held == 'inflight' or held == 'released' then
        redis.call('ZREM', KEYS[1], run_id)
    else
        local msg = cjson.decode(raw)
        local task = field_or_empty(msg, 'taskIdentifier')
        local task_current_key = ARGV[4] .. task .. ARGV[5]
        local task_limit = limit_of(ARGV[4] .. task .. ARGV[6], nil)

        if task_limit ~= nil and current_of(task_current_key) >= task_limit then
            task_blocked = task_blocked + 1
        else
            local allowed = true
            if rate_limit then
                local bucket_key = ARGV[7] .. field_or_empty(msg, 'rateLimitKey')
                local state = redis.call('HMGET', bucket_key, 'tokens', 'ts')
                local tokens = tonumber(state[1]) or rate_limit.burst
                local ts = tonumber(state[2]) or now
                tokens = math.min(rate_limit.burst, tokens + math.max(0, now - ts) * rate_limit.rate)
                if tokens < 1 then
                    allowed = false
                    rate_limited = rate_limited + 1
                    if ARGV[10] == '1' then
                        local wait_ms = math.ceil((1 - tokens) / rate_limit.rate)
                        redis.call('ZADD', KEYS[1], now + wait_ms, run_id)
                    end
                else
                    redis.call('HSET', bucket_key, 'tokens', tokens - 1, 'ts', now)
                    redis.call('PEXPIRE', bucket_key, rate_limit.ttl)
                end
            end

            if allowed then
                redis.call('ZREM', KEYS[1], run_id)
                redis.call('INCR', KEYS[3])
                redis.call('INCR', KEYS[5])
                redis.call('INCR', KEYS[7])
                redis.call('INCR', task_current_key)
                redis.call('HSET', message_key, 'state', 'inflight')
                local attempt = redis.call('HGET', message_key, 'attempt') or '0'
                rebalance_parent(KEYS[1], KEYS[2])
                return reply('dequeued', raw, attempt)
            end
        end
    end
end

rebalance_parent(KEYS[1], KEYS[2])
if rate_limited > 0 then
    return reply('rate_limited')
end
if task_blocked > 0 then
    return reply('task_at_capacity')
end
return reply('empty')
"#;

/// KEYS: message, queue, parent queue, queue current, env current,
///       project current, task current
/// ARGV: run_id
const ACK: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
    return 0
end
if state == 'inflight' then
    decr_floored(KEYS[4])
    decr_floored(KEYS[5])
    decr_floored(KEYS[6])
    decr_floored(KEYS[7])
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
rebalance_parent(KEYS[2], KEYS[3])
return 1
"#;

/// Same keys as ACK. ARGV: run_id, retry_at_ms
const NACK: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state ~= 'inflight' and state ~= 'released' then
    return 0
end
if state == 'inflight' then
    decr_floored(KEYS[4])
    decr_floored(KEYS[5])
    decr_floored(KEYS[6])
    decr_floored(KEYS[7])
end
redis.call('HSET', KEYS[1], 'state', 'queued')
redis.call('HINCRBY', KEYS[1], 'attempt', 1)
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
rebalance_parent(KEYS[2], KEYS[3])
return 1
"#;

/// Same keys as ACK. Releases the run's concurrency while it stays out of
/// the queue (e.g. while it waits on something external).
const RELEASE: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state ~= 'inflight' then
    return 0
end
decr_floored(KEYS[4])
decr_floored(KEYS[5])
decr_floored(KEYS[6])
decr_floored(KEYS[7])
redis.call('HSET', KEYS[1], 'state', 'released')
return 1
"#;

/// KEYS: current_1, limit_1, ..., current_n, limit_n, flag_1, ..., flag_m
/// ARGV: n, has_limit_1, default_1, ..., has_limit_n, default_n
///
/// A negative default means unlimited. When `has_limit_i` is `0` the limit
/// key slot is a placeholder and is not read.
const TRY_RESERVE: &str = r#"
local n = tonumber(ARGV[1])
for i = 2 * n + 1, #KEYS do
    if redis.call('EXISTS', KEYS[i]) == 1 then
        return 0
    end
end
for i = 1, n do
    local limit = tonumber(ARGV[2 * i + 1])
    if ARGV[2 * i] == '1' then
        limit = limit_of(KEYS[2 * i], limit)
    end
    if limit >= 0 and current_of(KEYS[2 * i - 1]) >= limit then
        return 0
    end
end
for i = 1, n do
    redis.call('INCR', KEYS[2 * i - 1])
end
return 1
"#;

/// KEYS: current_1, ..., current_n
const RELEASE_SCOPES: &str = r#"
for i = 1, #KEYS do
    if redis.call('EXISTS', KEYS[i]) == 1 then
        decr_floored(KEYS[i])
    end
end
return 1
"#;

fn with_prelude(body: &str) -> String {
    format!("{}\n{}", PRELUDE, body)
}

pub(crate) struct RunQueueScripts {
    pub enqueue: Script,
    pub overwrite_held: Script,
    pub dequeue: Script,
    pub ack: Script,
    pub nack: Script,
    pub release: Script,
}

impl RunQueueScripts {
    pub fn new() -> Self {
        Self {
            enqueue: Script::new(&with_prelude(ENQUEUE)),
            overwrite_held: Script::new(&with_prelude(OVERWRITE_HELD)),
            dequeue: Script::new(&with_prelude(DEQUEUE)),
            ack: Script::new(&with_prelude(ACK)),
            nack: Script::new(&with_prelude(NACK)),
            release: Script::new(&with_prelude(RELEASE)),
        }
    }

    pub fn sources() -> Vec<String> {
        [ENQUEUE, OVERWRITE_HELD, DEQUEUE, ACK, NACK, RELEASE, TRY_RESERVE, RELEASE_SCOPES]
            .into_iter()
            .map(with_prelude)
            .collect()
    }
}

pub(crate) struct LimiterScripts {
    pub try_reserve: Script,
    pub release: Script,
}

impl LimiterScripts {
    pub fn new() -> Self {
        Self {
            try_reserve: Script::new(&with_prelude(TRY_RESERVE)),
            release: Script::new(&with_prelude(RELEASE_SCOPES)),
        }
    }
}
