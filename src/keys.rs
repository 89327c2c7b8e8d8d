//! Redis key layout for the run queue.
//!
//! Every key that belongs to an organisation starts with a hash tag
//! (`{org:<id>}` in the long style, `{o:<id>}` in the short style) so a Redis
//! cluster places all of an organisation's keys in one slot and the Lua
//! scripts can touch them atomically.
//!
//! ```text
//! {org:O}:proj:P:env:E:queue:Q[:ck:C][:priority:N]     queue (zset of run ids)
//! {org:O}:proj:P:env:E:queue:Q[:ck:C]:currentConcurrency
//! {org:O}:proj:P:env:E:queue:Q:concurrency              queue limit
//! {org:O}:proj:P:env:E:queue:Q:rateLimit                token bucket config
//! {org:O}:proj:P:env:E:queue:Q:rateLimit:bucket:<key>   token bucket state
//! {org:O}:proj:P:env:E:task:T:currentConcurrency
//! {org:O}:proj:P:env:E:task:T:concurrency
//! {org:O}:proj:P:env:E:currentConcurrency
//! {org:O}:proj:P:env:E:concurrency
//! {org:O}:proj:P:currentConcurrency
//! {org:O}:disabledConcurrency
//! {org:O}:message:<run id>
//! ```
//!
//! The layout is part of the public contract: admin tooling scans it with the
//! patterns produced here, so the formatter, the parser and the patterns are
//! all derived from the same [`Labels`] table.

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// A tenant environment. Queues, concurrency counters and messages are all
/// scoped to one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEnvironment {
    pub id: String,
    pub project_id: String,
    pub organization_id: String,
    /// Default concurrency limit of the environment, used until an explicit
    /// limit is written with `update_env_concurrency_limit`.
    pub maximum_concurrency_limit: u32,
}

impl RuntimeEnvironment {
    pub fn new(
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
        id: impl Into<String>,
        maximum_concurrency_limit: u32,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            organization_id: organization_id.into(),
            maximum_concurrency_limit,
        }
    }
}

/// The parsed form of a queue key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub org_id: String,
    pub project_id: String,
    pub env_id: String,
    pub queue: String,
    pub concurrency_key: Option<String>,
    pub priority: Option<u32>,
}

/// Long keys are readable in `redis-cli`; short keys save memory when there
/// are millions of them. Both parse back to the same [`QueueDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStyle {
    #[default]
    Long,
    Short,
}

struct Labels {
    org: &'static str,
    project: &'static str,
    env: &'static str,
    queue: &'static str,
    concurrency_key: &'static str,
    priority: &'static str,
    task: &'static str,
    message: &'static str,
    current_concurrency: &'static str,
    concurrency_limit: &'static str,
    disabled_concurrency: &'static str,
    rate_limit: &'static str,
}

const LONG: Labels = Labels {
    org: "org",
    project: "proj",
    env: "env",
    queue: "queue",
    concurrency_key: "ck",
    priority: "priority",
    task: "task",
    message: "message",
    current_concurrency: "currentConcurrency",
    concurrency_limit: "concurrency",
    disabled_concurrency: "disabledConcurrency",
    rate_limit: "rateLimit",
};

const SHORT: Labels = Labels {
    org: "o",
    project: "p",
    env: "e",
    queue: "q",
    concurrency_key: "c",
    priority: "pri",
    task: "t",
    message: "m",
    current_concurrency: "cc",
    concurrency_limit: "cl",
    disabled_concurrency: "dc",
    rate_limit: "rl",
};

const SHARED_QUEUE: &str = "sharedQueue";
const WORKER_QUEUE: &str = "workerQueue";

/// Produces and parses every run-queue key.
#[derive(Debug, Clone, Default)]
pub struct KeyProducer {
    prefix: String,
    style: KeyStyle,
}

impl KeyProducer {
    /// `prefix` is prepended verbatim to every key (e.g. `"runqueue:"`).
    pub fn new(prefix: impl Into<String>, style: KeyStyle) -> Self {
        Self {
            prefix: prefix.into(),
            style,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn style(&self) -> KeyStyle {
        self.style
    }

    fn labels(&self) -> &'static Labels {
        match self.style {
            KeyStyle::Long => &LONG,
            KeyStyle::Short => &SHORT,
        }
    }

    fn org_section(&self, org_id: &str) -> String {
        format!("{}{{{}:{}}}", self.prefix, self.labels().org, org_id)
    }

    fn project_section(&self, org_id: &str, project_id: &str) -> String {
        format!(
            "{}:{}:{}",
            self.org_section(org_id),
            self.labels().project,
            project_id
        )
    }

    fn env_section(&self, org_id: &str, project_id: &str, env_id: &str) -> String {
        format!(
            "{}:{}:{}",
            self.project_section(org_id, project_id),
            self.labels().env,
            env_id
        )
    }

    fn base_queue_section(&self, org_id: &str, project_id: &str, env_id: &str, queue: &str) -> String {
        format!(
            "{}:{}:{}",
            self.env_section(org_id, project_id, env_id),
            self.labels().queue,
            queue
        )
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    /// Key of the queue that holds the runs of `queue` in `env`.
    pub fn queue_key(
        &self,
        env: &RuntimeEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> String {
        self.queue_key_with_priority(env, queue, concurrency_key, None)
    }

    pub fn queue_key_with_priority(
        &self,
        env: &RuntimeEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
        priority: Option<u32>,
    ) -> String {
        self.queue_key_from_descriptor(&QueueDescriptor {
            org_id: env.organization_id.clone(),
            project_id: env.project_id.clone(),
            env_id: env.id.clone(),
            queue: queue.to_string(),
            concurrency_key: concurrency_key.map(str::to_string),
            priority,
        })
    }

    pub fn queue_key_from_descriptor(&self, d: &QueueDescriptor) -> String {
        let labels = self.labels();
        let mut key = self.base_queue_section(&d.org_id, &d.project_id, &d.env_id, &d.queue);
        if let Some(ck) = &d.concurrency_key {
            key.push_str(&format!(":{}:{}", labels.concurrency_key, ck));
        }
        if let Some(priority) = d.priority {
            key.push_str(&format!(":{}:{}", labels.priority, priority));
        }
        key
    }

    /// Inverse of [`queue_key_with_priority`](Self::queue_key_with_priority).
    pub fn extract_components_from_queue(&self, key: &str) -> Result<QueueDescriptor> {
        let labels = self.labels();
        let invalid = || QueueError::InvalidKey(key.to_string());

        let rest = key.strip_prefix(self.prefix.as_str()).ok_or_else(invalid)?;
        let rest = rest
            .strip_prefix('{')
            .and_then(|r| r.strip_prefix(labels.org))
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(invalid)?;
        let (org_id, rest) = rest.split_once("}:").ok_or_else(invalid)?;
        let (project_id, rest) = take_segment(rest, labels.project).ok_or_else(invalid)?;
        let (env_id, rest) = take_segment(rest, labels.env).ok_or_else(invalid)?;
        let mut queue_part = rest
            .strip_prefix(labels.queue)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(invalid)?;

        if queue_part.is_empty() || org_id.is_empty() || project_id.is_empty() || env_id.is_empty()
        {
            return Err(invalid());
        }

        let mut priority = None;
        let priority_marker = format!(":{}:", labels.priority);
        if let Some(idx) = queue_part.rfind(&priority_marker) {
            let digits = &queue_part[idx + priority_marker.len()..];
            if let Ok(value) = digits.parse::<u32>() {
                priority = Some(value);
                queue_part = &queue_part[..idx];
            }
        }

        let ck_marker = self.concurrency_key_marker();
        let (queue, concurrency_key) = match queue_part.find(&ck_marker) {
            Some(idx) => (
                &queue_part[..idx],
                Some(queue_part[idx + ck_marker.len()..].to_string()),
            ),
            None => (queue_part, None),
        };

        if queue.is_empty() {
            return Err(invalid());
        }

        Ok(QueueDescriptor {
            org_id: org_id.to_string(),
            project_id: project_id.to_string(),
            env_id: env_id.to_string(),
            queue: queue.to_string(),
            concurrency_key,
            priority,
        })
    }

    /// Rejects descriptors whose key would not parse back to the same
    /// descriptor.
    ///
    /// Ids must be non-empty and free of `:` (the org id also of braces, it
    /// sits inside the hash tag). The queue name and the concurrency key must
    /// not contain a `ck` or `priority` segment of this key style, nor start
    /// or end with one.
    pub fn validate_descriptor(&self, d: &QueueDescriptor) -> Result<()> {
        let labels = self.labels();
        let reject = |what: &str, value: &str| {
            Err(QueueError::InvalidKey(format!("{} {:?}", what, value)))
        };

        for (what, id) in [
            ("organization id", &d.org_id),
            ("project id", &d.project_id),
            ("environment id", &d.env_id),
        ] {
            if id.is_empty() || id.contains(':') {
                return reject(what, id);
            }
        }
        if d.org_id.contains(['{', '}']) {
            return reject("organization id", &d.org_id);
        }

        let markers = [
            self.concurrency_key_marker(),
            format!(":{}:", labels.priority),
        ];
        let carries_marker =
            |segment: &str| markers.iter().any(|m| format!(":{}:", segment).contains(m.as_str()));

        if d.queue.is_empty() || carries_marker(&d.queue) {
            return reject("queue name", &d.queue);
        }
        if let Some(ck) = &d.concurrency_key {
            if ck.is_empty() || carries_marker(ck) {
                return reject("concurrency key", ck);
            }
        }
        Ok(())
    }

    /// The `:ck:` separator.
    pub fn concurrency_key_marker(&self) -> String {
        format!(":{}:", self.labels().concurrency_key)
    }

    /// True if `key` is a queue zset rather than one of the auxiliary keys
    /// that share the `...:queue:Q` prefix (counters, limits, buckets).
    pub fn is_queue_key(&self, key: &str) -> bool {
        let labels = self.labels();
        let auxiliary = [
            labels.current_concurrency,
            labels.concurrency_limit,
            labels.rate_limit,
        ];
        if key.contains(&format!(":{}:", labels.rate_limit)) {
            return false;
        }
        if auxiliary
            .iter()
            .any(|suffix| key.ends_with(&format!(":{}", suffix)))
        {
            return false;
        }
        self.extract_components_from_queue(key).is_ok()
    }

    /// The queue key with any priority segment removed.
    pub fn base_queue_key(&self, key: &str) -> Result<String> {
        let mut d = self.extract_components_from_queue(key)?;
        d.priority = None;
        Ok(self.queue_key_from_descriptor(&d))
    }

    // ------------------------------------------------------------------
    // Concurrency scopes
    // ------------------------------------------------------------------

    /// Counter for the queue (per concurrency key when one is present).
    pub fn queue_current_concurrency_key(&self, d: &QueueDescriptor) -> String {
        let mut d = d.clone();
        d.priority = None;
        format!(
            "{}:{}",
            self.queue_key_from_descriptor(&d),
            self.labels().current_concurrency
        )
    }

    /// Limit of the queue. Concurrency-key sub-queues share the base
    /// queue's limit, each with its own counter.
    pub fn queue_concurrency_limit_key(&self, d: &QueueDescriptor) -> String {
        format!(
            "{}:{}",
            self.base_queue_section(&d.org_id, &d.project_id, &d.env_id, &d.queue),
            self.labels().concurrency_limit
        )
    }

    pub fn queue_concurrency_limit_key_for(&self, env: &RuntimeEnvironment, queue: &str) -> String {
        format!(
            "{}:{}",
            self.base_queue_section(&env.organization_id, &env.project_id, &env.id, queue),
            self.labels().concurrency_limit
        )
    }

    pub fn env_current_concurrency_key(&self, org_id: &str, project_id: &str, env_id: &str) -> String {
        format!(
            "{}:{}",
            self.env_section(org_id, project_id, env_id),
            self.labels().current_concurrency
        )
    }

    pub fn env_concurrency_limit_key(&self, org_id: &str, project_id: &str, env_id: &str) -> String {
        format!(
            "{}:{}",
            self.env_section(org_id, project_id, env_id),
            self.labels().concurrency_limit
        )
    }

    pub fn project_current_concurrency_key(&self, org_id: &str, project_id: &str) -> String {
        format!(
            "{}:{}",
            self.project_section(org_id, project_id),
            self.labels().current_concurrency
        )
    }

    /// Prefix of the task counters of an environment; the dequeue script
    /// appends `<task>:<suffix>` once it knows which run it picked.
    pub fn task_key_prefix(&self, org_id: &str, project_id: &str, env_id: &str) -> String {
        format!(
            "{}:{}:",
            self.env_section(org_id, project_id, env_id),
            self.labels().task
        )
    }

    pub fn task_current_concurrency_key(
        &self,
        org_id: &str,
        project_id: &str,
        env_id: &str,
        task: &str,
    ) -> String {
        format!(
            "{}{}{}",
            self.task_key_prefix(org_id, project_id, env_id),
            task,
            self.current_concurrency_suffix()
        )
    }

    pub fn task_concurrency_limit_key(
        &self,
        org_id: &str,
        project_id: &str,
        env_id: &str,
        task: &str,
    ) -> String {
        format!(
            "{}{}{}",
            self.task_key_prefix(org_id, project_id, env_id),
            task,
            self.concurrency_limit_suffix()
        )
    }

    pub fn current_concurrency_suffix(&self) -> String {
        format!(":{}", self.labels().current_concurrency)
    }

    pub fn concurrency_limit_suffix(&self) -> String {
        format!(":{}", self.labels().concurrency_limit)
    }

    pub fn org_disabled_concurrency_key(&self, org_id: &str) -> String {
        format!(
            "{}:{}",
            self.org_section(org_id),
            self.labels().disabled_concurrency
        )
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub fn message_key_prefix(&self, org_id: &str) -> String {
        format!("{}:{}:", self.org_section(org_id), self.labels().message)
    }

    pub fn message_key(&self, org_id: &str, run_id: &str) -> String {
        format!("{}{}", self.message_key_prefix(org_id), run_id)
    }

    // ------------------------------------------------------------------
    // Rate limits
    // ------------------------------------------------------------------

    pub fn queue_rate_limit_key(&self, d: &QueueDescriptor) -> String {
        format!(
            "{}:{}",
            self.base_queue_section(&d.org_id, &d.project_id, &d.env_id, &d.queue),
            self.labels().rate_limit
        )
    }

    /// Buckets are keyed by `(queue, rate_limit_key)`; runs without a key
    /// share the bucket with the empty suffix.
    pub fn rate_limit_bucket_prefix(&self, d: &QueueDescriptor) -> String {
        format!("{}:bucket:", self.queue_rate_limit_key(d))
    }

    pub fn rate_limit_bucket_key(&self, d: &QueueDescriptor, rate_limit_key: Option<&str>) -> String {
        format!(
            "{}{}",
            self.rate_limit_bucket_prefix(d),
            rate_limit_key.unwrap_or_default()
        )
    }

    // ------------------------------------------------------------------
    // Parent queues
    // ------------------------------------------------------------------

    /// The cross-tenant parent queue every run is registered in by default.
    pub fn shared_queue_key(&self) -> String {
        format!("{}{}", self.prefix, SHARED_QUEUE)
    }

    pub fn worker_queue_key(&self, worker_queue: &str) -> String {
        if worker_queue == SHARED_QUEUE {
            return self.shared_queue_key();
        }
        format!("{}{}:{}", self.prefix, WORKER_QUEUE, worker_queue)
    }

    // ------------------------------------------------------------------
    // Scan patterns
    // ------------------------------------------------------------------

    pub fn queue_pattern_for_env(&self, env: &RuntimeEnvironment) -> String {
        format!(
            "{}:{}:*",
            self.env_section(&env.organization_id, &env.project_id, &env.id),
            self.labels().queue
        )
    }

    pub fn queue_pattern_for_project(&self, org_id: &str, project_id: &str) -> String {
        format!(
            "{}:{}:*:{}:*",
            self.project_section(org_id, project_id),
            self.labels().env,
            self.labels().queue
        )
    }

    pub fn message_pattern_for_org(&self, org_id: &str) -> String {
        format!("{}*", self.message_key_prefix(org_id))
    }

    pub fn current_concurrency_pattern_for_env(&self, env: &RuntimeEnvironment) -> String {
        format!(
            "{}:*{}",
            self.env_section(&env.organization_id, &env.project_id, &env.id),
            self.current_concurrency_suffix()
        )
    }
}

fn take_segment<'a>(input: &'a str, label: &str) -> Option<(&'a str, &'a str)> {
    let rest = input.strip_prefix(label)?.strip_prefix(':')?;
    rest.split_once(':')
}
