//! Per-queue reliability policy.
//!
//! Every task type has exactly one queue, named after the task. The registry
//! is built once at startup (defaults, then configuration overrides) and is a
//! pure lookup afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::config::{QueueOverride, QueueSettings};
use crate::ratelimit::RateLimit;

use super::error::QueueError;
use super::job::{BackoffPolicy, Priority, RetentionPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    BulkMessage,
    ContactImport,
    TemplateProcessing,
    EmailNotification,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::BulkMessage,
        TaskType::ContactImport,
        TaskType::TemplateProcessing,
        TaskType::EmailNotification,
    ];

    /// Task name, which is also the name of its queue
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::BulkMessage => "bulk-message",
            TaskType::ContactImport => "contact-import",
            TaskType::TemplateProcessing => "template-processing",
            TaskType::EmailNotification => "email-notification",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| QueueError::UnknownQueue(s.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuePolicy {
    pub name: String,
    pub task_type: TaskType,
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    #[serde(serialize_with = "serialize_duration_ms")]
    pub timeout: Duration,
    pub retention: RetentionPolicy,
    pub concurrency: usize,
    /// Optional dequeue budget on top of the concurrency limit
    #[serde(skip)]
    pub rate_limit: Option<RateLimit>,
    pub default_priority: Priority,
}

fn serialize_duration_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl QueuePolicy {
    /// Built-in policy. Backoff and timeout scale with how slow and how
    /// rate-bound each task is.
    pub fn default_for(task_type: TaskType) -> Self {
        let (backoff_ms, timeout, concurrency, retention) = match task_type {
            TaskType::BulkMessage => (5_000, Duration::from_secs(10 * 60), 2, (100, 1_000)),
            TaskType::ContactImport => (2_000, Duration::from_secs(30 * 60), 1, (50, 500)),
            TaskType::TemplateProcessing => (1_000, Duration::from_secs(5 * 60), 5, (100, 500)),
            TaskType::EmailNotification => (2_000, Duration::from_secs(60), 5, (500, 1_000)),
        };

        Self {
            name: task_type.as_str().to_string(),
            task_type,
            attempts: 3,
            backoff: BackoffPolicy::exponential(backoff_ms),
            timeout,
            retention: RetentionPolicy {
                completed_count: retention.0,
                failed_count: retention.1,
            },
            concurrency,
            rate_limit: None,
            default_priority: Priority::Normal,
        }
    }

    fn apply(&mut self, ov: &QueueOverride) -> Result<(), QueueError> {
        if let Some(attempts) = ov.attempts {
            if attempts == 0 {
                return Err(self.invalid("attempts must be at least 1"));
            }
            self.attempts = attempts;
        }
        if let Some(concurrency) = ov.concurrency {
            if concurrency == 0 {
                return Err(self.invalid("concurrency must be greater than 0"));
            }
            self.concurrency = concurrency;
        }
        if let Some(timeout_ms) = ov.timeout_ms {
            if timeout_ms == 0 {
                return Err(self.invalid("timeout_ms must be greater than 0"));
            }
            self.timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(delay) = ov.backoff_delay_ms {
            self.backoff.base_delay_ms = delay;
        }
        if let Some(keep) = ov.keep_completed {
            self.retention.completed_count = keep;
        }
        if let Some(keep) = ov.keep_failed {
            self.retention.failed_count = keep;
        }
        match (ov.rate_limit_max, ov.rate_limit_window_ms) {
            (None, None) => {}
            (Some(max), window) => {
                let window = Duration::from_millis(window.unwrap_or(1_000));
                self.rate_limit = Some(
                    RateLimit::new(max, window)
                        .ok_or_else(|| self.invalid("rate limit needs max > 0 and a window"))?,
                );
            }
            (None, Some(_)) => {
                return Err(self.invalid("rate_limit_window_ms requires rate_limit_max"));
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> QueueError {
        QueueError::Config(format!("queue '{}': {}", self.name, reason))
    }
}

#[derive(Debug, Clone)]
pub struct QueueRegistry {
    policies: BTreeMap<String, QueuePolicy>,
}

impl QueueRegistry {
    pub fn with_defaults() -> Self {
        let policies = TaskType::ALL
            .into_iter()
            .map(|t| (t.as_str().to_string(), QueuePolicy::default_for(t)))
            .collect();
        Self { policies }
    }

    /// Defaults with configured overrides applied. An override for a queue
    /// that does not exist is a configuration error.
    pub fn from_settings(settings: &QueueSettings) -> Result<Self, QueueError> {
        let mut registry = Self::with_defaults();
        for (name, ov) in &settings.overrides {
            let policy = registry
                .policies
                .get_mut(name)
                .ok_or_else(|| QueueError::UnknownQueue(name.clone()))?;
            policy.apply(ov)?;
        }
        Ok(registry)
    }

    /// Register or replace a queue policy.
    pub fn register(&mut self, policy: QueuePolicy) {
        self.policies.insert(policy.name.clone(), policy);
    }

    pub fn get_queue_config(&self, queue: &str) -> Result<&QueuePolicy, QueueError> {
        self.policies
            .get(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    pub fn policies(&self) -> impl Iterator<Item = &QueuePolicy> {
        self.policies.values()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
