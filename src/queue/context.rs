//! Per-attempt handle given to processors.

use std::sync::{Arc, Mutex};

use super::events::{QueueEvent, QueueEvents};
use super::job::{Job, Progress};
use super::payload::{TaskPayload, TenantId};
use super::store::JobStore;

pub struct JobContext {
    job: Job,
    store: Arc<dyn JobStore>,
    events: Arc<QueueEvents>,
    progress: Mutex<Option<Progress>>,
}

impl JobContext {
    pub fn new(job: Job, store: Arc<dyn JobStore>, events: Arc<QueueEvents>) -> Self {
        let progress = Mutex::new(job.progress.clone());
        Self {
            job,
            store,
            events,
            progress,
        }
    }

    /// Snapshot taken at dequeue
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn payload(&self) -> &TaskPayload {
        &self.job.payload
    }

    pub fn tenant_id(&self) -> &TenantId {
        self.job.payload.tenant_id()
    }

    /// Current attempt, starting at 1
    pub fn attempt(&self) -> u32 {
        self.job.attempt()
    }

    /// Persist progress and publish it. Store errors are logged, not raised:
    /// losing a progress update never fails the job.
    pub async fn update_progress(&self, progress: Progress) {
        if let Ok(mut current) = self.progress.lock() {
            *current = Some(progress.clone());
        }

        match self
            .store
            .update_progress(&self.job.queue, &self.job.id, &progress)
            .await
        {
            Ok(true) => {
                self.events.emit(QueueEvent::Progress {
                    queue: self.job.queue.clone(),
                    job_id: self.job.id.clone(),
                    progress,
                });
            }
            Ok(false) => {
                tracing::debug!(
                    queue = %self.job.queue,
                    job_id = %self.job.id,
                    "Progress dropped, job no longer active"
                );
            }
            Err(e) => {
                tracing::warn!(
                    queue = %self.job.queue,
                    job_id = %self.job.id,
                    error = %e,
                    "Failed to persist job progress"
                );
            }
        }
    }

    /// The job with the latest reported progress, for writing the outcome.
    pub(crate) fn into_job(self) -> Job {
        let mut job = self.job;
        if let Ok(mut progress) = self.progress.lock() {
            job.progress = progress.take();
        }
        job
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::{JobOptions, JobState};
    use crate::queue::payload::tests::sample_bulk_payload;
    use crate::queue::registry::QueueRegistry;
    use crate::queue::store::MemoryJobStore;
    use chrono::Utc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_progress_persisted_and_published() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let events = Arc::new(QueueEvents::new());
        let registry = QueueRegistry::with_defaults();
        let policy = registry.get_queue_config("bulk-message").unwrap();

        let job = Job::new(policy, sample_bulk_payload(1), &JobOptions::default(), Utc::now());
        store.add(&job).await.unwrap();
        let active = store
            .dequeue("bulk-message", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.state, JobState::Active);

        let mut rx = events.subscribe("bulk-message");
        let ctx = JobContext::new(active, store.clone(), events);
        ctx.update_progress(Progress::Percent(40.0)).await;

        let stored = store.get("bulk-message", &job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, Some(Progress::Percent(40.0)));
        assert_eq!(rx.recv().await.unwrap().name(), "progress");
        assert_eq!(ctx.into_job().progress, Some(Progress::Percent(40.0)));
    }
}
