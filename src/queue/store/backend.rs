//! Backend trait for job storage.
//!
//! The store is the single owner of job state. Every transition that more
//! than one worker could race on (dequeue, finish, cancel, retry) is a single
//! atomic store call, so many worker processes can share one store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::queue::error::StoreError;
use crate::queue::job::{Job, JobId, JobState, Progress};

/// Snapshot of per-state job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    /// Waiting jobs held back because the queue is paused
    pub paused: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// A job with this id already exists; nothing was written
    Duplicate,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// "memory" or "redis"
    fn backend_type(&self) -> &'static str;

    /// Persist a new job as waiting or delayed.
    async fn add(&self, job: &Job) -> Result<AddOutcome, StoreError>;

    async fn get(&self, queue: &str, id: &str) -> Result<Option<Job>, StoreError>;

    /// Remove a job that has not reached a terminal state. Returns the state
    /// it was removed from, or `None` when absent or already terminal.
    async fn remove(&self, queue: &str, id: &str) -> Result<Option<JobState>, StoreError>;

    /// Promote due delayed jobs, then atomically move the highest-priority
    /// waiting job to active under a fresh lock. Returns `None` when the
    /// queue is paused or empty.
    async fn dequeue(&self, queue: &str, lock_grace: Duration) -> Result<Option<Job>, StoreError>;

    /// Write the outcome of an attempt. `job` carries its new state
    /// (completed, failed, waiting or delayed) and the lock token it was
    /// dequeued with. Returns false, writing nothing, when the store no
    /// longer holds the job as active under that token. Terminal sets are
    /// trimmed to `keep` entries.
    async fn finish(&self, job: &Job, keep: usize) -> Result<bool, StoreError>;

    /// Store progress on an active job. Returns false if it is not active.
    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: &Progress,
    ) -> Result<bool, StoreError>;

    /// failed -> waiting with attempts reset. False for any other state.
    async fn retry_failed(&self, queue: &str, id: &str) -> Result<bool, StoreError>;

    async fn counts(&self, queue: &str) -> Result<JobCounts, StoreError>;

    /// Failed jobs, most recent first, positions `start..=end`.
    async fn list_failed(&self, queue: &str, start: usize, end: usize)
        -> Result<Vec<Job>, StoreError>;

    /// Delete up to `limit` jobs in a terminal `state` that finished before
    /// `older_than`.
    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, StoreError>;

    async fn pause(&self, queue: &str) -> Result<(), StoreError>;

    async fn resume(&self, queue: &str) -> Result<(), StoreError>;

    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError>;

    /// Active jobs whose lock deadline is before `now`.
    async fn stalled(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Release backing connections.
    async fn close(&self);
}
