//! In-memory job store.
//!
//! Single-process only. Used in tests and when `queues.store = "memory"`.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::queue::error::StoreError;
use crate::queue::job::{Job, JobId, JobState, Progress};

use super::backend::{AddOutcome, JobCounts, JobStore};

#[derive(Default)]
struct QueueData {
    jobs: HashMap<JobId, Job>,
    /// (priority rank, insertion sequence, id)
    waiting: BTreeSet<(u8, u64, JobId)>,
    /// (due time in ms, insertion sequence, id)
    delayed: BTreeSet<(i64, u64, JobId)>,
    active: HashSet<JobId>,
    /// Oldest first
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    paused: bool,
    seq: u64,
}

impl QueueData {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push_waiting(&mut self, job: &Job) {
        let seq = self.next_seq();
        self.waiting
            .insert((job.priority.rank(), seq, job.id.clone()));
    }

    fn push_delayed(&mut self, job: &Job) {
        let seq = self.next_seq();
        let due = job
            .delay_until
            .map(|d| d.timestamp_millis())
            .unwrap_or_default();
        self.delayed.insert((due, seq, job.id.clone()));
    }

    fn promote_due(&mut self, now_ms: i64) {
        while let Some(first) = self.delayed.first().cloned() {
            if first.0 > now_ms {
                break;
            }
            self.delayed.remove(&first);
            let id = first.2;
            let rank = match self.jobs.get_mut(&id) {
                Some(job) => {
                    job.state = JobState::Waiting;
                    job.delay_until = None;
                    job.priority.rank()
                }
                None => continue,
            };
            let seq = self.next_seq();
            self.waiting.insert((rank, seq, id));
        }
    }

    fn trim(&mut self, state: JobState, keep: usize) {
        let list = match state {
            JobState::Completed => &mut self.completed,
            _ => &mut self.failed,
        };
        while list.len() > keep {
            if let Some(id) = list.pop_front() {
                self.jobs.remove(&id);
            }
        }
    }

    fn counts(&self) -> JobCounts {
        let waiting = self.waiting.len() as u64;
        JobCounts {
            waiting,
            active: self.active.len() as u64,
            completed: self.completed.len() as u64,
            failed: self.failed.len() as u64,
            delayed: self.delayed.len() as u64,
            paused: if self.paused { waiting } else { 0 },
        }
    }
}

pub struct MemoryJobStore {
    queues: DashMap<String, QueueData>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    async fn add(&self, job: &Job) -> Result<AddOutcome, StoreError> {
        let mut data = self.queues.entry(job.queue.clone()).or_default();
        if data.jobs.contains_key(&job.id) {
            return Ok(AddOutcome::Duplicate);
        }

        match job.state {
            JobState::Delayed => data.push_delayed(job),
            _ => data.push_waiting(job),
        }
        data.jobs.insert(job.id.clone(), job.clone());
        Ok(AddOutcome::Added)
    }

    async fn get(&self, queue: &str, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self
            .queues
            .get(queue)
            .and_then(|data| data.jobs.get(id).cloned()))
    }

    async fn remove(&self, queue: &str, id: &str) -> Result<Option<JobState>, StoreError> {
        let Some(mut data) = self.queues.get_mut(queue) else {
            return Ok(None);
        };
        let state = match data.jobs.get(id) {
            Some(job) if !job.state.is_terminal() => job.state,
            _ => return Ok(None),
        };

        data.waiting.retain(|(_, _, j)| j != id);
        data.delayed.retain(|(_, _, j)| j != id);
        data.active.remove(id);
        data.jobs.remove(id);
        Ok(Some(state))
    }

    async fn dequeue(&self, queue: &str, lock_grace: Duration) -> Result<Option<Job>, StoreError> {
        let mut data = self.queues.entry(queue.to_string()).or_default();
        let now = Utc::now();
        data.promote_due(now.timestamp_millis());

        if data.paused {
            return Ok(None);
        }

        let Some(entry) = data.waiting.pop_first() else {
            return Ok(None);
        };
        let id = entry.2;
        let Some(job) = data.jobs.get_mut(&id) else {
            return Ok(None);
        };

        job.activate(now, lock_grace, uuid::Uuid::new_v4().to_string());
        let job = job.clone();
        data.active.insert(id);
        Ok(Some(job))
    }

    async fn finish(&self, job: &Job, keep: usize) -> Result<bool, StoreError> {
        let Some(mut data) = self.queues.get_mut(&job.queue) else {
            return Ok(false);
        };

        let owned = data.active.contains(&job.id)
            && data
                .jobs
                .get(&job.id)
                .is_some_and(|stored| stored.lock_token == job.lock_token);
        if !owned {
            return Ok(false);
        }

        data.active.remove(&job.id);
        let mut stored = job.clone();
        if stored.state != JobState::Active {
            stored.lock_until = None;
            stored.lock_token = None;
        }
        data.jobs.insert(job.id.clone(), stored);

        match job.state {
            JobState::Completed => {
                data.completed.push_back(job.id.clone());
                data.trim(JobState::Completed, keep);
            }
            JobState::Failed => {
                data.failed.push_back(job.id.clone());
                data.trim(JobState::Failed, keep);
            }
            JobState::Delayed => data.push_delayed(job),
            JobState::Waiting | JobState::Active => data.push_waiting(job),
        }
        Ok(true)
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: &Progress,
    ) -> Result<bool, StoreError> {
        let Some(mut data) = self.queues.get_mut(queue) else {
            return Ok(false);
        };
        match data.jobs.get_mut(id) {
            Some(job) if job.state == JobState::Active => {
                job.progress = Some(progress.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn retry_failed(&self, queue: &str, id: &str) -> Result<bool, StoreError> {
        let Some(mut data) = self.queues.get_mut(queue) else {
            return Ok(false);
        };
        let job = match data.jobs.get_mut(id) {
            Some(job) if job.state == JobState::Failed => {
                job.reset_for_retry();
                job.clone()
            }
            _ => return Ok(false),
        };

        data.failed.retain(|j| j != id);
        data.push_waiting(&job);
        Ok(true)
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, StoreError> {
        Ok(self
            .queues
            .get(queue)
            .map(|data| data.counts())
            .unwrap_or_default())
    }

    async fn list_failed(
        &self,
        queue: &str,
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, StoreError> {
        if end < start {
            return Ok(vec![]);
        }
        let Some(data) = self.queues.get(queue) else {
            return Ok(vec![]);
        };
        Ok(data
            .failed
            .iter()
            .rev()
            .skip(start)
            .take((end - start).saturating_add(1))
            .filter_map(|id| data.jobs.get(id).cloned())
            .collect())
    }

    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, StoreError> {
        let Some(mut data) = self.queues.get_mut(queue) else {
            return Ok(vec![]);
        };
        let data = &mut *data;
        let list = match state {
            JobState::Completed => &mut data.completed,
            JobState::Failed => &mut data.failed,
            _ => return Ok(vec![]),
        };

        let mut removed = Vec::new();
        while removed.len() < limit {
            let Some(id) = list.front() else { break };
            let expired = data
                .jobs
                .get(id)
                .and_then(|job| job.finished_at)
                .map_or(true, |finished| finished < older_than);
            if !expired {
                break;
            }
            if let Some(id) = list.pop_front() {
                data.jobs.remove(&id);
                removed.push(id);
            }
        }
        Ok(removed)
    }

    async fn pause(&self, queue: &str) -> Result<(), StoreError> {
        self.queues.entry(queue.to_string()).or_default().paused = true;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> Result<(), StoreError> {
        self.queues.entry(queue.to_string()).or_default().paused = false;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError> {
        Ok(self.queues.get(queue).is_some_and(|data| data.paused))
    }

    async fn stalled(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let Some(data) = self.queues.get(queue) else {
            return Ok(vec![]);
        };
        Ok(data
            .active
            .iter()
            .filter_map(|id| data.jobs.get(id))
            .filter(|job| job.lock_until.is_some_and(|deadline| deadline < now))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::{FailureKind, JobFailure, JobOptions, Priority};
    use crate::queue::payload::tests::sample_bulk_payload;
    use crate::queue::registry::QueueRegistry;

    const QUEUE: &str = "bulk-message";

    fn job(options: JobOptions) -> Job {
        let registry = QueueRegistry::with_defaults();
        let policy = registry.get_queue_config(QUEUE).unwrap();
        Job::new(policy, sample_bulk_payload(1), &options, Utc::now())
    }

    fn grace() -> Duration {
        Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_add_is_visible_immediately() {
        let store = MemoryJobStore::new();
        let job = job(JobOptions::default());
        assert_eq!(store.add(&job).await.unwrap(), AddOutcome::Added);

        let stored = store.get(QUEUE, &job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(store.counts(QUEUE).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_not_added_twice() {
        let store = MemoryJobStore::new();
        let first = job(JobOptions::default().with_job_id("dup"));
        let second = job(JobOptions::default().with_job_id("dup"));

        store.add(&first).await.unwrap();
        assert_eq!(store.add(&second).await.unwrap(), AddOutcome::Duplicate);
        assert_eq!(store.counts(QUEUE).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_dequeue_follows_priority_then_fifo() {
        let store = MemoryJobStore::new();
        let low = job(JobOptions::default().with_priority(Priority::Low));
        let normal_a = job(JobOptions::default());
        let normal_b = job(JobOptions::default());
        let critical = job(JobOptions::default().with_priority(Priority::Critical));

        for j in [&low, &normal_a, &normal_b, &critical] {
            store.add(j).await.unwrap();
        }

        let order: Vec<String> = {
            let mut ids = Vec::new();
            while let Some(j) = store.dequeue(QUEUE, grace()).await.unwrap() {
                ids.push(j.id);
            }
            ids
        };
        assert_eq!(order, vec![critical.id, normal_a.id, normal_b.id, low.id]);
    }

    #[tokio::test]
    async fn test_paused_queue_does_not_dequeue() {
        let store = MemoryJobStore::new();
        store.add(&job(JobOptions::default())).await.unwrap();

        store.pause(QUEUE).await.unwrap();
        assert!(store.dequeue(QUEUE, grace()).await.unwrap().is_none());
        assert_eq!(store.counts(QUEUE).await.unwrap().paused, 1);

        store.resume(QUEUE).await.unwrap();
        assert!(store.dequeue(QUEUE, grace()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delayed_job_not_eligible_early() {
        let store = MemoryJobStore::new();
        store
            .add(&job(JobOptions::default().with_delay(Duration::from_secs(60))))
            .await
            .unwrap();

        assert!(store.dequeue(QUEUE, grace()).await.unwrap().is_none());
        assert_eq!(store.counts(QUEUE).await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_promoted_job_drops_delay() {
        let store = MemoryJobStore::new();
        let delayed = job(JobOptions::default().with_delay(Duration::from_millis(1)));
        store.add(&delayed).await.unwrap();
        store.pause(QUEUE).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Promotion still runs while paused; only activation is gated
        assert!(store.dequeue(QUEUE, grace()).await.unwrap().is_none());
        let stored = store.get(QUEUE, &delayed.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert!(stored.delay_until.is_none());
    }

    #[tokio::test]
    async fn test_finish_requires_matching_lock() {
        let store = MemoryJobStore::new();
        store.add(&job(JobOptions::default())).await.unwrap();
        let mut active = store.dequeue(QUEUE, grace()).await.unwrap().unwrap();

        let mut stale = active.clone();
        stale.lock_token = Some("someone-else".to_string());
        stale.complete(serde_json::json!({}), Utc::now());
        assert!(!store.finish(&stale, 10).await.unwrap());

        active.complete(serde_json::json!({ "sent": 1 }), Utc::now());
        assert!(store.finish(&active, 10).await.unwrap());
        // Already terminal: a second finish is rejected
        assert!(!store.finish(&active, 10).await.unwrap());

        let stored = store.get(QUEUE, &active.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_retention_trims_oldest() {
        let store = MemoryJobStore::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let j = job(JobOptions::default());
            store.add(&j).await.unwrap();
            let mut active = store.dequeue(QUEUE, grace()).await.unwrap().unwrap();
            active.complete(serde_json::Value::Null, Utc::now());
            store.finish(&active, 2).await.unwrap();
            ids.push(active.id);
        }

        assert_eq!(store.counts(QUEUE).await.unwrap().completed, 2);
        assert!(store.get(QUEUE, &ids[0]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_failed_resets_job() {
        let store = MemoryJobStore::new();
        store
            .add(&job(JobOptions::default().with_attempts(1)))
            .await
            .unwrap();
        let mut active = store.dequeue(QUEUE, grace()).await.unwrap().unwrap();
        active.fail_attempt(
            JobFailure {
                reason: "nope".into(),
                stack: vec![],
                kind: FailureKind::Retryable,
                failed_at: Utc::now(),
            },
            Utc::now(),
        );
        store.finish(&active, 10).await.unwrap();

        let failed = store.list_failed(QUEUE, 0, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        let unbounded = store.list_failed(QUEUE, 0, usize::MAX).await.unwrap();
        assert_eq!(unbounded.len(), 1);
        assert!(store.list_failed(QUEUE, usize::MAX, usize::MAX).await.unwrap().is_empty());

        assert!(store.retry_failed(QUEUE, &active.id).await.unwrap());
        assert!(!store.retry_failed(QUEUE, &active.id).await.unwrap());

        let stored = store.get(QUEUE, &active.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.attempts_made, 0);
        assert!(stored.failure.is_none());
    }

    #[tokio::test]
    async fn test_remove_skips_terminal_jobs() {
        let store = MemoryJobStore::new();
        let waiting = job(JobOptions::default());
        store.add(&waiting).await.unwrap();
        assert_eq!(
            store.remove(QUEUE, &waiting.id).await.unwrap(),
            Some(JobState::Waiting)
        );
        assert_eq!(store.remove(QUEUE, &waiting.id).await.unwrap(), None);
        assert!(store.dequeue(QUEUE, grace()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stalled_reports_lapsed_locks() {
        let store = MemoryJobStore::new();
        store
            .add(&job(JobOptions::default().with_timeout(Duration::from_millis(1))))
            .await
            .unwrap();
        let active = store.dequeue(QUEUE, Duration::ZERO).await.unwrap().unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let stalled = store.stalled(QUEUE, later).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, active.id);
    }

    #[tokio::test]
    async fn test_clean_respects_grace_and_limit() {
        let store = MemoryJobStore::new();
        for _ in 0..3 {
            store.add(&job(JobOptions::default())).await.unwrap();
            let mut active = store.dequeue(QUEUE, grace()).await.unwrap().unwrap();
            active.complete(serde_json::Value::Null, Utc::now());
            store.finish(&active, 100).await.unwrap();
        }

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(store
            .clean(QUEUE, JobState::Completed, past, 10)
            .await
            .unwrap()
            .is_empty());

        let future = Utc::now() + chrono::Duration::seconds(1);
        let removed = store
            .clean(QUEUE, JobState::Completed, future, 2)
            .await
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(store.counts(QUEUE).await.unwrap().completed, 1);
    }
}
