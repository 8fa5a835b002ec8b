//! Job record and its state machine.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::payload::TaskPayload;
use super::registry::QueuePolicy;

pub type JobId = String;

/// Dequeue order within a queue. Lower rank runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Paused is a queue-level gate, not a job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "delayed" => Ok(JobState::Delayed),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub base_delay_ms: u64,
}

impl BackoffPolicy {
    pub fn exponential(base_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms,
        }
    }

    pub fn fixed(base_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay_ms,
        }
    }

    /// Delay before the next attempt once `attempts_made` attempts have run.
    /// Exponential: base * 2^(attempts_made - 1). Saturates instead of
    /// overflowing, so the sequence never decreases.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.base_delay_ms,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(63);
                self.base_delay_ms.saturating_mul(1u64 << exponent)
            }
        };
        Duration::from_millis(ms)
    }
}

/// Progress reported by a processor: a percentage or any structured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Progress {
    Percent(f64),
    Detail(Value),
}

/// Per-enqueue overrides of the queue defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: Option<Priority>,
    pub delay_ms: Option<u64>,
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    pub timeout_ms: Option<u64>,
    /// Caller-chosen id; enqueueing an id that already exists is a no-op.
    pub job_id: Option<JobId>,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// How many terminal jobs a queue keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetentionPolicy {
    pub completed_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Retryable,
    Terminal,
    Timeout,
    Stalled,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Retryable => "retryable",
            FailureKind::Terminal => "terminal",
            FailureKind::Timeout => "timeout",
            FailureKind::Stalled => "stalled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: String,
    /// Context lines, outermost first
    pub stack: Vec<String>,
    pub kind: FailureKind,
    pub failed_at: DateTime<Utc>,
}

/// Where a failed attempt sent the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Retry { delay: Duration },
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: TaskPayload,
    pub priority: Priority,
    pub state: JobState,
    pub attempts_made: u32,
    pub attempts_max: u32,
    pub backoff: BackoffPolicy,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest time a delayed job becomes eligible
    pub delay_until: Option<DateTime<Utc>>,
    pub progress: Option<Progress>,
    pub result: Option<Value>,
    pub failure: Option<JobFailure>,
    /// Deadline after which an active job counts as stalled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_until: Option<DateTime<Utc>>,
    /// Identifies the dequeue that owns an active job
    #[serde(skip)]
    pub lock_token: Option<String>,
}

impl Job {
    /// Build a new job from queue defaults merged with per-enqueue options.
    pub fn new(
        policy: &QueuePolicy,
        payload: TaskPayload,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let delay_until = options
            .delay_ms
            .filter(|ms| *ms > 0)
            .map(|ms| now + chrono::Duration::milliseconds(ms.min(i64::MAX as u64) as i64));

        Self {
            id: options
                .job_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            queue: policy.name.clone(),
            payload,
            priority: options.priority.unwrap_or(policy.default_priority),
            state: if delay_until.is_some() {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            attempts_made: 0,
            attempts_max: options.attempts.unwrap_or(policy.attempts).max(1),
            backoff: options.backoff.unwrap_or(policy.backoff),
            timeout_ms: options
                .timeout_ms
                .unwrap_or(policy.timeout.as_millis() as u64)
                .max(1),
            created_at: now,
            processed_at: None,
            finished_at: None,
            delay_until,
            progress: None,
            result: None,
            failure: None,
            lock_until: None,
            lock_token: None,
        }
    }

    pub fn task(&self) -> &'static str {
        self.payload.task_type().as_str()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The attempt currently running (or about to run), starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempts_made + 1
    }

    pub fn failed_reason(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.reason.as_str())
    }

    /// waiting -> active
    pub fn activate(&mut self, now: DateTime<Utc>, lock_grace: Duration, token: String) {
        let lock_ms = self.timeout_ms.saturating_add(lock_grace.as_millis() as u64);
        self.state = JobState::Active;
        self.processed_at = Some(now);
        self.delay_until = None;
        self.lock_until = Some(now + chrono::Duration::milliseconds(lock_ms.min(i64::MAX as u64) as i64));
        self.lock_token = Some(token);
    }

    /// active -> completed
    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) {
        self.attempts_made = self.attempts_made.saturating_add(1);
        self.state = JobState::Completed;
        self.finished_at = Some(now);
        self.result = Some(result);
        self.failure = None;
    }

    /// Record a failed attempt. Retries while attempts remain unless the
    /// failure is terminal; otherwise parks the job in `failed`.
    pub fn fail_attempt(&mut self, failure: JobFailure, now: DateTime<Utc>) -> AttemptOutcome {
        self.attempts_made = self.attempts_made.saturating_add(1);
        let terminal = failure.kind == FailureKind::Terminal;
        self.failure = Some(failure);

        if terminal || self.attempts_made >= self.attempts_max {
            self.state = JobState::Failed;
            self.finished_at = Some(now);
            return AttemptOutcome::Failed;
        }

        let delay = self.backoff.delay_for(self.attempts_made);
        if delay.is_zero() {
            self.state = JobState::Waiting;
            self.delay_until = None;
        } else {
            self.state = JobState::Delayed;
            self.delay_until =
                Some(now + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64));
        }
        AttemptOutcome::Retry { delay }
    }

    /// failed -> waiting, as an explicit operator retry
    pub fn reset_for_retry(&mut self) {
        self.state = JobState::Waiting;
        self.attempts_made = 0;
        self.failure = None;
        self.finished_at = None;
        self.delay_until = None;
        self.lock_until = None;
        self.lock_token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::payload::tests::sample_bulk_payload;
    use crate::queue::registry::{QueueRegistry, TaskType};

    fn new_job(options: JobOptions) -> Job {
        let registry = QueueRegistry::with_defaults();
        let policy = registry.get_queue_config(TaskType::BulkMessage.as_str()).unwrap();
        Job::new(policy, sample_bulk_payload(2), &options, Utc::now())
    }

    fn failure(kind: FailureKind) -> JobFailure {
        JobFailure {
            reason: "boom".to_string(),
            stack: vec![],
            kind,
            failed_at: Utc::now(),
        }
    }

    #[test]
    fn test_exponential_backoff_sequence() {
        let backoff = BackoffPolicy::exponential(1_000);
        assert_eq!(backoff.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(4_000));
    }

    #[test]
    fn test_backoff_is_monotone_and_saturates() {
        let backoff = BackoffPolicy::exponential(u64::MAX / 4);
        let mut previous = Duration::ZERO;
        for attempt in 0..100 {
            let delay = backoff.delay_for(attempt);
            assert!(delay >= previous);
            previous = delay;
        }
        assert_eq!(BackoffPolicy::fixed(250).delay_for(7), Duration::from_millis(250));
    }

    #[test]
    fn test_options_override_queue_defaults() {
        let job = new_job(
            JobOptions::default()
                .with_priority(Priority::Critical)
                .with_attempts(5)
                .with_job_id("campaign-42"),
        );
        assert_eq!(job.id, "campaign-42");
        assert_eq!(job.priority, Priority::Critical);
        assert_eq!(job.attempts_max, 5);
        assert_eq!(job.state, JobState::Waiting);

        let delayed = new_job(JobOptions::default().with_delay(Duration::from_secs(60)));
        assert_eq!(delayed.state, JobState::Delayed);
        assert!(delayed.delay_until.is_some());
    }

    #[test]
    fn test_retry_until_attempts_exhausted() {
        let mut job = new_job(JobOptions::default().with_attempts(3));

        for _ in 0..2 {
            let outcome = job.fail_attempt(failure(FailureKind::Retryable), Utc::now());
            assert!(matches!(outcome, AttemptOutcome::Retry { .. }));
            assert_eq!(job.state, JobState::Delayed);
        }

        let outcome = job.fail_attempt(failure(FailureKind::Retryable), Utc::now());
        assert_eq!(outcome, AttemptOutcome::Failed);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 3);
        assert_eq!(job.failed_reason(), Some("boom"));
        assert!(job.attempts_made <= job.attempts_max + 1);
    }

    #[test]
    fn test_terminal_failure_skips_retries() {
        let mut job = new_job(JobOptions::default().with_attempts(5));
        let outcome = job.fail_attempt(failure(FailureKind::Terminal), Utc::now());
        assert_eq!(outcome, AttemptOutcome::Failed);
        assert_eq!(job.attempts_made, 1);
    }

    #[test]
    fn test_reset_for_retry() {
        let mut job = new_job(JobOptions::default().with_attempts(1));
        job.fail_attempt(failure(FailureKind::Timeout), Utc::now());
        assert_eq!(job.state, JobState::Failed);

        job.reset_for_retry();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert!(job.failure.is_none());
    }

    #[test]
    fn test_progress_deserializes_number_or_object() {
        let p: Progress = serde_json::from_str("42.5").unwrap();
        assert_eq!(p, Progress::Percent(42.5));

        let p: Progress = serde_json::from_str(r#"{"done":3,"total":10}"#).unwrap();
        assert!(matches!(p, Progress::Detail(_)));
    }
}
