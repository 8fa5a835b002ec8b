//! Per-queue worker pool.
//!
//! One dispatch loop per queue takes a concurrency slot, then a rate-limit
//! permit when the queue has one, then asks the store for the next job. Each
//! dequeued job runs on its own task holding the slot until its outcome is
//! written. A second loop periodically reclaims jobs whose lock lapsed.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashSet;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::QueueSettings;
use crate::metrics::JobMetrics;
use crate::ratelimit::RateLimiter;
use crate::redis::ExponentialBackoff;

use super::context::JobContext;
use super::events::{QueueEvent, QueueEvents};
use super::job::{AttemptOutcome, FailureKind, Job, JobFailure, JobId, JobState};
use super::processor::{ProcessError, Processor};
use super::registry::QueuePolicy;
use super::store::JobStore;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Idle wait between empty dequeues
    pub poll_interval: Duration,
    pub stalled_interval: Duration,
    /// Added to a job's timeout to form its lock deadline
    pub lock_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for WorkerConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            stalled_interval: Duration::from_millis(settings.stalled_interval_ms),
            lock_grace: Duration::from_millis(settings.lock_grace_ms),
        }
    }
}

/// What a pool left behind when it closed.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub queue: String,
    /// Jobs running when the drain started
    pub in_flight: usize,
    /// Jobs still running when the drain timeout hit
    pub stragglers: Vec<JobId>,
}

impl DrainReport {
    pub fn drained(&self) -> bool {
        self.stragglers.is_empty()
    }
}

struct PoolInner {
    queue: String,
    policy: QueuePolicy,
    store: Arc<dyn JobStore>,
    processor: Arc<dyn Processor>,
    events: Arc<QueueEvents>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    config: WorkerConfig,
    slots: Arc<Semaphore>,
    in_flight: DashSet<JobId>,
    wake: Notify,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
    shutdown_tx: broadcast::Sender<()>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    jobs: Arc<tokio::sync::Mutex<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(
        policy: QueuePolicy,
        store: Arc<dyn JobStore>,
        processor: Arc<dyn Processor>,
        events: Arc<QueueEvents>,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let slots = Arc::new(Semaphore::new(policy.concurrency.max(1)));

        Self {
            inner: Arc::new(PoolInner {
                queue: policy.name.clone(),
                policy,
                store,
                processor,
                events,
                rate_limiter,
                config,
                slots,
                in_flight: DashSet::new(),
                wake: Notify::new(),
            }),
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
            jobs: Arc::new(tokio::sync::Mutex::new(JoinSet::new())),
        }
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// Spawn the dispatch and stalled-sweep loops.
    pub fn start(&self) {
        let dispatch = tokio::spawn(dispatch_loop(
            self.inner.clone(),
            self.jobs.clone(),
            self.shutdown_tx.subscribe(),
        ));
        let sweeper = tokio::spawn(stalled_loop(self.inner.clone(), self.shutdown_tx.subscribe()));

        if let Ok(mut loops) = self.loops.lock() {
            loops.push(dispatch);
            loops.push(sweeper);
        }

        tracing::info!(
            queue = %self.inner.queue,
            concurrency = self.inner.policy.concurrency,
            rate_limited = self.inner.rate_limiter.is_some(),
            "Worker pool started"
        );
    }

    /// Skip the idle wait; new work may be available.
    pub fn notify(&self) {
        self.inner.wake.notify_one();
    }

    /// Jobs currently running in this process
    pub fn active_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub async fn recover_stalled(&self) -> usize {
        self.inner.recover_stalled().await
    }

    /// Stop dequeuing, then wait up to `drain_timeout` for running jobs.
    /// Jobs still running after that are logged and aborted; their locks
    /// lapse and the stalled sweep of a surviving process picks them up.
    pub async fn close(&self, drain_timeout: Duration) -> DrainReport {
        let _ = self.shutdown_tx.send(());

        let loops = self
            .loops
            .lock()
            .map(|mut loops| std::mem::take(&mut *loops))
            .unwrap_or_default();
        for mut handle in loops {
            if tokio::time::timeout(drain_timeout, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        let in_flight = self.inner.in_flight.len();
        let mut jobs = self.jobs.lock().await;
        let finished = tokio::time::timeout(drain_timeout, async {
            while jobs.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        let mut stragglers = Vec::new();
        if !finished {
            stragglers = self.inner.in_flight.iter().map(|id| id.clone()).collect();
            for job_id in &stragglers {
                tracing::warn!(
                    queue = %self.inner.queue,
                    job_id = %job_id,
                    timeout_secs = drain_timeout.as_secs_f64(),
                    "Job still running after drain timeout, abandoning"
                );
            }
            jobs.abort_all();
        }

        tracing::info!(
            queue = %self.inner.queue,
            in_flight,
            stragglers = stragglers.len(),
            "Worker pool closed"
        );

        DrainReport {
            queue: self.inner.queue.clone(),
            in_flight,
            stragglers,
        }
    }
}

async fn dispatch_loop(
    inner: Arc<PoolInner>,
    jobs: Arc<tokio::sync::Mutex<JoinSet<()>>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut backoff = ExponentialBackoff::new();

    loop {
        let slot = tokio::select! {
            _ = shutdown.recv() => break,
            slot = inner.slots.clone().acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => break,
            },
        };

        let rate_permit = match &inner.rate_limiter {
            Some(limiter) => tokio::select! {
                _ = shutdown.recv() => break,
                permit = limiter.acquire() => match permit {
                    Ok(permit) => Some(permit),
                    Err(e) => {
                        drop(slot);
                        let delay = backoff.next_delay();
                        tracing::warn!(
                            queue = %inner.queue,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Queue rate limiter unavailable"
                        );
                        if sleep_or_shutdown(delay, &mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                },
            },
            None => None,
        };

        match inner.store.dequeue(&inner.queue, inner.config.lock_grace).await {
            Ok(Some(job)) => {
                backoff.reset();
                // The gate counts activations
                if let (Some(limiter), Some(permit)) = (&inner.rate_limiter, rate_permit) {
                    limiter.settle_quietly(permit).await;
                }
                let task = inner.clone();
                let mut set = jobs.lock().await;
                while set.try_join_next().is_some() {}
                set.spawn(async move {
                    task.run_job(job).await;
                    drop(slot);
                });
            }
            Ok(None) => {
                backoff.reset();
                drop(slot);
                inner.release_rate_permit(rate_permit).await;

                let idle = tokio::select! {
                    _ = shutdown.recv() => true,
                    _ = inner.wake.notified() => false,
                    _ = tokio::time::sleep(inner.config.poll_interval) => false,
                };
                if idle {
                    break;
                }
            }
            Err(e) => {
                drop(slot);
                inner.release_rate_permit(rate_permit).await;

                let delay = backoff.next_delay();
                tracing::warn!(
                    queue = %inner.queue,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Dequeue failed, backing off"
                );
                if sleep_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
            }
        }
    }

    tracing::info!(queue = %inner.queue, "Dispatch loop stopped");
}

async fn stalled_loop(inner: Arc<PoolInner>, mut shutdown: broadcast::Receiver<()>) {
    let mut timer = tokio::time::interval(inner.config.stalled_interval);
    // Skip immediate first tick
    timer.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = timer.tick() => {
                inner.recover_stalled().await;
            }
        }
    }
}

/// True when shutdown arrived first.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = shutdown.recv() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl PoolInner {
    async fn release_rate_permit(&self, permit: Option<crate::ratelimit::RatePermit>) {
        if let (Some(limiter), Some(permit)) = (&self.rate_limiter, permit) {
            if let Err(e) = limiter.release(permit).await {
                tracing::debug!(queue = %self.queue, error = %e, "Failed to release rate permit");
            }
        }
    }

    fn keep_for(&self, state: JobState) -> usize {
        match state {
            JobState::Completed => self.policy.retention.completed_count,
            JobState::Failed => self.policy.retention.failed_count,
            _ => usize::MAX,
        }
    }

    #[tracing::instrument(
        name = "worker.run_job",
        skip_all,
        fields(queue = %self.queue, job_id = %job.id, attempt = job.attempt())
    )]
    async fn run_job(&self, job: Job) {
        let started = Instant::now();
        let job_id = job.id.clone();
        let timeout = job.timeout();
        self.in_flight.insert(job_id.clone());

        JobMetrics::record_started(&self.queue);
        self.events.emit(QueueEvent::Active {
            queue: self.queue.clone(),
            job_id: job_id.clone(),
            attempt: job.attempt(),
        });
        tracing::info!(
            queue = %self.queue,
            job_id = %job_id,
            task = job.task(),
            tenant_id = %job.payload.tenant_id(),
            attempt = job.attempt(),
            "Job started"
        );

        let ctx = JobContext::new(job, self.store.clone(), self.events.clone());
        let outcome = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(self.processor.process(&ctx)).catch_unwind(),
        )
        .await;
        let mut job = ctx.into_job();

        let now = Utc::now();
        let failure = match outcome {
            Ok(Ok(Ok(result))) => {
                job.complete(result, now);
                None
            }
            Ok(Ok(Err(e))) => Some(e.into_failure(now)),
            Ok(Err(panic)) => Some(
                ProcessError::retryable(format!("processor panicked: {}", panic_message(&*panic)))
                    .into_failure(now),
            ),
            Err(_) => Some(JobFailure {
                reason: format!("job timed out after {}ms", timeout.as_millis()),
                stack: Vec::new(),
                kind: FailureKind::Timeout,
                failed_at: now,
            }),
        };
        let attempt = failure.map(|f| job.fail_attempt(f, now));

        self.write_outcome(&job, attempt, started.elapsed()).await;
        self.in_flight.remove(&job_id);
    }

    async fn write_outcome(&self, job: &Job, attempt: Option<AttemptOutcome>, elapsed: Duration) {
        match self.store.finish(job, self.keep_for(job.state)).await {
            Ok(true) => {}
            Ok(false) => {
                JobMetrics::record_abandoned(&self.queue);
                tracing::warn!(
                    queue = %self.queue,
                    job_id = %job.id,
                    "Job no longer held by this worker, outcome discarded"
                );
                return;
            }
            Err(e) => {
                JobMetrics::record_abandoned(&self.queue);
                tracing::error!(
                    queue = %self.queue,
                    job_id = %job.id,
                    error = %e,
                    "Failed to record job outcome, job left for stalled recovery"
                );
                return;
            }
        }

        let secs = elapsed.as_secs_f64();
        match attempt {
            None => {
                JobMetrics::record_completed(&self.queue, secs);
                self.events.emit(QueueEvent::Completed {
                    queue: self.queue.clone(),
                    job_id: job.id.clone(),
                    result: job.result.clone().unwrap_or(Value::Null),
                });
                tracing::info!(
                    queue = %self.queue,
                    job_id = %job.id,
                    attempts_made = job.attempts_made,
                    duration_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
            }
            Some(AttemptOutcome::Retry { delay }) => {
                JobMetrics::record_retried(&self.queue, secs);
                self.announce_retry(job, delay);
            }
            Some(AttemptOutcome::Failed) => {
                let kind = job.failure.as_ref().map(|f| f.kind.as_str()).unwrap_or("unknown");
                JobMetrics::record_failed(&self.queue, kind, secs);
                self.announce_failure(job);
            }
        }
    }

    fn announce_retry(&self, job: &Job, delay: Duration) {
        let reason = job.failed_reason().unwrap_or_default().to_string();
        tracing::warn!(
            queue = %self.queue,
            job_id = %job.id,
            attempt = job.attempts_made,
            attempts_max = job.attempts_max,
            retry_in_ms = delay.as_millis() as u64,
            reason = %reason,
            "Job attempt failed, retrying"
        );
        self.events.emit(QueueEvent::Retrying {
            queue: self.queue.clone(),
            job_id: job.id.clone(),
            attempt: job.attempts_made,
            reason,
            delay_ms: delay.as_millis() as u64,
        });
        if delay.is_zero() {
            self.wake.notify_one();
        }
    }

    fn announce_failure(&self, job: &Job) {
        let reason = job.failed_reason().unwrap_or_default().to_string();
        tracing::error!(
            queue = %self.queue,
            job_id = %job.id,
            attempts_made = job.attempts_made,
            reason = %reason,
            "Job failed"
        );
        self.events.emit(QueueEvent::Failed {
            queue: self.queue.clone(),
            job_id: job.id.clone(),
            attempts_made: job.attempts_made,
            reason,
        });
    }

    /// Fail one attempt of every job whose lock lapsed, skipping jobs this
    /// process is still running.
    async fn recover_stalled(&self) -> usize {
        let now = Utc::now();
        let stalled = match self.store.stalled(&self.queue, now).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(queue = %self.queue, error = %e, "Stalled job scan failed");
                return 0;
            }
        };

        let mut recovered = 0;
        for mut job in stalled {
            if self.in_flight.contains(&job.id) {
                continue;
            }

            let outcome = job.fail_attempt(
                JobFailure {
                    reason: "job lock expired before the attempt finished".to_string(),
                    stack: Vec::new(),
                    kind: FailureKind::Stalled,
                    failed_at: now,
                },
                now,
            );

            // Another process may have reclaimed it first
            if !matches!(self.store.finish(&job, self.keep_for(job.state)).await, Ok(true)) {
                continue;
            }
            recovered += 1;

            self.events.emit(QueueEvent::Stalled {
                queue: self.queue.clone(),
                job_id: job.id.clone(),
            });
            match outcome {
                AttemptOutcome::Retry { delay } => self.announce_retry(&job, delay),
                AttemptOutcome::Failed => {
                    JobMetrics::record_stalled_failed(&self.queue);
                    self.announce_failure(&job);
                }
            }
        }

        if recovered > 0 {
            JobMetrics::record_stalled(&self.queue, recovered as u64);
            tracing::warn!(queue = %self.queue, recovered, "Recovered stalled jobs");
        }
        recovered
    }
}
