//! All-or-nothing reservation across a set of concurrency scopes.
//!
//! The run queue's dequeue script does its own check-and-increment inline
//! because it has to pick the message first; this limiter is the same
//! primitive exposed on its own, for callers that hold capacity outside
//! the queue.

use redis::AsyncCommands;
use tracing::debug;

use super::scripts::LimiterScripts;
use crate::error::Result;
use crate::store::RedisStore;

/// One level of the scope hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcurrencyScope {
    /// A counter checked against the integer stored at `limit_key`, or
    /// against `default_limit` when that key is absent. `None` everywhere
    /// means the scope is tracked but unlimited.
    Counter {
        current_key: String,
        limit_key: Option<String>,
        default_limit: Option<u32>,
    },
    /// Blocks every reservation while `flag_key` exists.
    Disabled { flag_key: String },
}

impl ConcurrencyScope {
    pub fn limited(
        current_key: impl Into<String>,
        limit_key: impl Into<String>,
        default_limit: Option<u32>,
    ) -> Self {
        ConcurrencyScope::Counter {
            current_key: current_key.into(),
            limit_key: Some(limit_key.into()),
            default_limit,
        }
    }

    pub fn fixed(current_key: impl Into<String>, limit: u32) -> Self {
        ConcurrencyScope::Counter {
            current_key: current_key.into(),
            limit_key: None,
            default_limit: Some(limit),
        }
    }

    pub fn unlimited(current_key: impl Into<String>) -> Self {
        ConcurrencyScope::Counter {
            current_key: current_key.into(),
            limit_key: None,
            default_limit: None,
        }
    }

    pub fn disabled_flag(flag_key: impl Into<String>) -> Self {
        ConcurrencyScope::Disabled {
            flag_key: flag_key.into(),
        }
    }

    pub fn current_key(&self) -> Option<&str> {
        match self {
            ConcurrencyScope::Counter { current_key, .. } => Some(current_key),
            ConcurrencyScope::Disabled { .. } => None,
        }
    }
}

pub struct ConcurrencyLimiter {
    store: RedisStore,
    scripts: LimiterScripts,
}

impl ConcurrencyLimiter {
    pub fn new(store: RedisStore) -> Self {
        Self {
            store,
            scripts: LimiterScripts::new(),
        }
    }

    /// Increment every counter scope if and only if none of them is at its
    /// limit and no disabled flag is set. Returns whether the reservation
    /// was granted; a rejection leaves every counter untouched.
    pub async fn try_reserve(&self, scopes: &[ConcurrencyScope]) -> Result<bool> {
        let mut counters = Vec::new();
        let mut flags = Vec::new();
        for scope in scopes {
            match scope {
                ConcurrencyScope::Counter {
                    current_key,
                    limit_key,
                    default_limit,
                } => counters.push((current_key, limit_key, default_limit)),
                ConcurrencyScope::Disabled { flag_key } => flags.push(flag_key),
            }
        }

        let mut invocation = self.scripts.try_reserve.prepare_invoke();
        for (current_key, limit_key, _) in &counters {
            invocation.key(current_key.as_str());
            invocation.key(limit_key.as_deref().unwrap_or(current_key.as_str()));
        }
        for flag in &flags {
            invocation.key(flag.as_str());
        }
        invocation.arg(counters.len());
        for (_, limit_key, default_limit) in &counters {
            invocation
                .arg(if limit_key.is_some() { "1" } else { "0" })
                .arg(default_limit.map(i64::from).unwrap_or(-1));
        }

        let mut conn = self.store.conn().await?;
        let granted: i64 = invocation.invoke_async(&mut *conn).await?;
        debug!(scopes = scopes.len(), granted = granted == 1, "concurrency reservation");
        Ok(granted == 1)
    }

    /// Decrement every counter scope, floored at zero.
    pub async fn release(&self, scopes: &[ConcurrencyScope]) -> Result<()> {
        let mut invocation = self.scripts.release.prepare_invoke();
        let mut any = false;
        for key in scopes.iter().filter_map(ConcurrencyScope::current_key) {
            invocation.key(key);
            any = true;
        }
        if !any {
            return Ok(());
        }
        let mut conn = self.store.conn().await?;
        let _: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(())
    }

    pub async fn current(&self, scope: &ConcurrencyScope) -> Result<u64> {
        let Some(key) = scope.current_key() else {
            return Ok(0);
        };
        let mut conn = self.store.conn().await?;
        let value: Option<u64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_scope_has_no_counter() {
        assert_eq!(ConcurrencyScope::disabled_flag("x").current_key(), None);
        assert_eq!(ConcurrencyScope::fixed("c", 2).current_key(), Some("c"));
    }
}
