//! Queue manager: the single entry point for enqueueing, inspecting and
//! controlling jobs, and the owner of every worker pool.
//!
//! Built once at startup and shared behind an `Arc`. Enqueue and the query
//! operations work before `initialize()`; only job execution needs it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, OnceCell, RwLock};
use tokio::task::JoinHandle;

use crate::config::{QueueSettings, ShutdownSettings};
use crate::metrics::{JobMetrics, QueueDepthMetrics};
use crate::ratelimit::create_rate_limiter;
use crate::redis::RedisPool;

use super::error::QueueError;
use super::events::{QueueEvent, QueueEvents};
use super::job::{Job, JobId, JobOptions, JobState};
use super::payload::TaskPayload;
use super::processor::Processor;
use super::registry::{QueueRegistry, TaskType};
use super::store::{AddOutcome, JobCounts, JobStore};
use super::worker::{DrainReport, WorkerConfig, WorkerPool};

#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    pub worker: WorkerConfig,
    /// Upper bound on waiting for in-flight jobs at shutdown
    pub drain_timeout: Duration,
    /// Upper bound on jobs removed by one clean call
    pub clean_batch_limit: usize,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self::new(&QueueSettings::default(), &ShutdownSettings::default())
    }
}

impl QueueManagerConfig {
    pub fn new(queues: &QueueSettings, shutdown: &ShutdownSettings) -> Self {
        Self {
            worker: WorkerConfig::from(queues),
            drain_timeout: Duration::from_secs(shutdown.drain_timeout_seconds),
            clean_batch_limit: queues.clean_batch_limit.max(1),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub duration: Duration,
    pub pools: Vec<DrainReport>,
}

impl ShutdownReport {
    pub fn drained(&self) -> bool {
        self.pools.iter().all(DrainReport::drained)
    }

    pub fn stragglers(&self) -> usize {
        self.pools.iter().map(|p| p.stragglers.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<JobCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store: &'static str,
    pub initialized: bool,
    pub shutting_down: bool,
    pub queues: BTreeMap<String, QueueHealth>,
}

pub struct QueueManagerBuilder {
    registry: QueueRegistry,
    store: Arc<dyn JobStore>,
    processors: HashMap<TaskType, Arc<dyn Processor>>,
    redis_pool: Option<Arc<RedisPool>>,
    config: QueueManagerConfig,
}

impl QueueManagerBuilder {
    /// Register the processor for its task type, replacing any earlier one.
    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.insert(processor.task_type(), processor);
        self
    }

    /// Share queue rate limits across processes through Redis.
    pub fn redis_pool(mut self, pool: Arc<RedisPool>) -> Self {
        self.redis_pool = Some(pool);
        self
    }

    pub fn config(mut self, config: QueueManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> QueueManager {
        let (shutdown_tx, _) = broadcast::channel(1);
        QueueManager {
            registry: self.registry,
            store: self.store,
            events: Arc::new(QueueEvents::new()),
            processors: self.processors,
            redis_pool: self.redis_pool,
            config: self.config,
            pools: RwLock::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            init_lock: tokio::sync::Mutex::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            shutdown_report: OnceCell::new(),
        }
    }
}

pub struct QueueManager {
    registry: QueueRegistry,
    store: Arc<dyn JobStore>,
    events: Arc<QueueEvents>,
    processors: HashMap<TaskType, Arc<dyn Processor>>,
    redis_pool: Option<Arc<RedisPool>>,
    config: QueueManagerConfig,
    pools: RwLock<HashMap<String, Arc<WorkerPool>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    /// true once initialized
    init_lock: tokio::sync::Mutex<bool>,
    shutting_down: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_report: OnceCell<ShutdownReport>,
}

impl QueueManager {
    pub fn builder(registry: QueueRegistry, store: Arc<dyn JobStore>) -> QueueManagerBuilder {
        QueueManagerBuilder {
            registry,
            store,
            processors: HashMap::new(),
            redis_pool: None,
            config: QueueManagerConfig::default(),
        }
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    pub async fn is_initialized(&self) -> bool {
        *self.init_lock.lock().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), QueueError> {
        if self.is_shutting_down() {
            return Err(QueueError::ShuttingDown);
        }
        Ok(())
    }

    /// Start one worker pool and one event listener per registered queue.
    ///
    /// Calling it again on an initialized manager is a no-op. Fails without
    /// starting anything when a queue has no processor.
    #[tracing::instrument(name = "queue_manager.initialize", skip(self))]
    pub async fn initialize(&self) -> Result<(), QueueError> {
        self.ensure_running()?;

        let mut initialized = self.init_lock.lock().await;
        if *initialized {
            tracing::info!("Queue manager already initialized, ignoring");
            return Ok(());
        }

        let mut planned = Vec::with_capacity(self.registry.len());
        for policy in self.registry.policies() {
            let processor = self
                .processors
                .get(&policy.task_type)
                .cloned()
                .ok_or_else(|| QueueError::MissingProcessor(policy.name.clone()))?;
            planned.push((policy.clone(), processor));
        }

        let mut pools = self.pools.write().await;
        for (policy, processor) in planned {
            let limiter = policy.rate_limit.map(|limit| {
                create_rate_limiter(
                    &format!("queue:{}", policy.name),
                    limit,
                    self.redis_pool.clone(),
                )
            });
            let queue = policy.name.clone();

            let pool = Arc::new(WorkerPool::new(
                policy,
                self.store.clone(),
                processor,
                self.events.clone(),
                limiter,
                self.config.worker.clone(),
            ));
            pool.start();

            let listener = tokio::spawn(listen(
                queue.clone(),
                self.events.subscribe(&queue),
                self.shutdown_tx.subscribe(),
            ));
            if let Ok(mut listeners) = self.listeners.lock() {
                listeners.push(listener);
            }

            pools.insert(queue, pool);
        }

        *initialized = true;
        tracing::info!(
            queues = pools.len(),
            store = self.store.backend_type(),
            "Queue manager initialized"
        );
        Ok(())
    }

    async fn wake(&self, queue: &str) {
        if let Some(pool) = self.pools.read().await.get(queue) {
            pool.notify();
        }
    }

    /// Persist a job and return its id without waiting for execution.
    ///
    /// The queue must be registered and must handle the payload's task.
    /// Store failures propagate; nothing is retried here.
    #[tracing::instrument(
        name = "queue_manager.enqueue",
        skip(self, payload, options),
        fields(task = payload.task_type().as_str(), tenant_id = %payload.tenant_id())
    )]
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: TaskPayload,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        self.ensure_running()?;
        let policy = self.registry.get_queue_config(queue)?;

        let task = payload.task_type();
        if task != policy.task_type {
            return Err(QueueError::UnknownTask {
                queue: queue.to_string(),
                task: task.as_str().to_string(),
            });
        }
        payload.validate().map_err(QueueError::InvalidPayload)?;

        let job = Job::new(policy, payload, &options, Utc::now());
        match self.store.add(&job).await? {
            AddOutcome::Added => {
                JobMetrics::record_enqueued(queue);
                tracing::info!(
                    queue = %queue,
                    job_id = %job.id,
                    priority = job.priority.as_str(),
                    state = %job.state,
                    items = job.payload.item_count(),
                    "Job enqueued"
                );
                if job.state == JobState::Waiting {
                    self.events.emit(QueueEvent::Waiting {
                        queue: queue.to_string(),
                        job_id: job.id.clone(),
                    });
                    self.wake(queue).await;
                }
            }
            AddOutcome::Duplicate => {
                tracing::debug!(queue = %queue, job_id = %job.id, "Job id already exists, not enqueued again");
            }
        }
        Ok(job.id)
    }

    #[tracing::instrument(name = "queue_manager.get_job", skip(self))]
    pub async fn get_job(&self, queue: &str, job_id: &str) -> Result<Option<Job>, QueueError> {
        self.registry.get_queue_config(queue)?;
        Ok(self.store.get(queue, job_id).await?)
    }

    /// Remove a job that has not finished. Removing an active job only drops
    /// its record; the running attempt is not interrupted and its outcome is
    /// discarded when it ends.
    #[tracing::instrument(name = "queue_manager.cancel_job", skip(self))]
    pub async fn cancel_job(&self, queue: &str, job_id: &str) -> Result<bool, QueueError> {
        self.registry.get_queue_config(queue)?;

        let Some(previous_state) = self.store.remove(queue, job_id).await? else {
            return Ok(false);
        };
        if previous_state == JobState::Active {
            tracing::warn!(
                queue = %queue,
                job_id = %job_id,
                "Cancelled an active job; the running attempt continues until it ends"
            );
        } else {
            tracing::info!(queue = %queue, job_id = %job_id, state = %previous_state, "Job cancelled");
        }

        self.events.emit(QueueEvent::Removed {
            queue: queue.to_string(),
            job_id: job_id.to_string(),
            previous_state,
        });
        Ok(true)
    }

    /// Move a failed job back to waiting with a fresh attempt budget.
    #[tracing::instrument(name = "queue_manager.retry_job", skip(self))]
    pub async fn retry_job(&self, queue: &str, job_id: &str) -> Result<bool, QueueError> {
        self.registry.get_queue_config(queue)?;

        if !self.store.retry_failed(queue, job_id).await? {
            return Ok(false);
        }
        tracing::info!(queue = %queue, job_id = %job_id, "Failed job requeued");
        self.events.emit(QueueEvent::Waiting {
            queue: queue.to_string(),
            job_id: job_id.to_string(),
        });
        self.wake(queue).await;
        Ok(true)
    }

    /// Point-in-time counts; not transactional under concurrent mutation.
    pub async fn get_queue_statistics(&self, queue: &str) -> Result<JobCounts, QueueError> {
        self.registry.get_queue_config(queue)?;
        let counts = self.store.counts(queue).await?;

        QueueDepthMetrics::set(queue, "waiting", counts.waiting);
        QueueDepthMetrics::set(queue, "active", counts.active);
        QueueDepthMetrics::set(queue, "completed", counts.completed);
        QueueDepthMetrics::set(queue, "failed", counts.failed);
        QueueDepthMetrics::set(queue, "delayed", counts.delayed);
        QueueDepthMetrics::set(queue, "paused", counts.paused);
        Ok(counts)
    }

    #[tracing::instrument(name = "queue_manager.pause_queue", skip(self))]
    pub async fn pause_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.registry.get_queue_config(queue)?;
        self.store.pause(queue).await?;
        tracing::info!(queue = %queue, "Queue paused");
        self.events.emit(QueueEvent::Paused {
            queue: queue.to_string(),
        });
        Ok(())
    }

    #[tracing::instrument(name = "queue_manager.resume_queue", skip(self))]
    pub async fn resume_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.registry.get_queue_config(queue)?;
        self.store.resume(queue).await?;
        tracing::info!(queue = %queue, "Queue resumed");
        self.events.emit(QueueEvent::Resumed {
            queue: queue.to_string(),
        });
        self.wake(queue).await;
        Ok(())
    }

    pub async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        self.registry.get_queue_config(queue)?;
        Ok(self.store.is_paused(queue).await?)
    }

    /// Failed jobs, most recent first, positions `start..=end`.
    pub async fn get_failed_jobs(
        &self,
        queue: &str,
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, QueueError> {
        self.registry.get_queue_config(queue)?;
        Ok(self.store.list_failed(queue, start, end).await?)
    }

    pub async fn clean_completed_jobs(
        &self,
        queue: &str,
        grace: Duration,
    ) -> Result<Vec<JobId>, QueueError> {
        self.clean(queue, JobState::Completed, grace).await
    }

    pub async fn clean_failed_jobs(
        &self,
        queue: &str,
        grace: Duration,
    ) -> Result<Vec<JobId>, QueueError> {
        self.clean(queue, JobState::Failed, grace).await
    }

    #[tracing::instrument(name = "queue_manager.clean", skip(self))]
    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        grace: Duration,
    ) -> Result<Vec<JobId>, QueueError> {
        self.registry.get_queue_config(queue)?;

        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let cutoff = now.checked_sub_signed(grace).unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let removed = self
            .store
            .clean(queue, state, cutoff, self.config.clean_batch_limit)
            .await?;

        if !removed.is_empty() {
            tracing::info!(queue = %queue, state = %state, removed = removed.len(), "Cleaned jobs");
            self.events.emit(QueueEvent::Cleaned {
                queue: queue.to_string(),
                state,
                count: removed.len(),
                at: now,
            });
        }
        Ok(removed)
    }

    /// Lifecycle events of one queue.
    pub fn subscribe(&self, queue: &str) -> Result<broadcast::Receiver<QueueEvent>, QueueError> {
        self.registry.get_queue_config(queue)?;
        Ok(self.events.subscribe(queue))
    }

    /// Jobs running in this process for `queue`
    pub async fn active_jobs(&self, queue: &str) -> usize {
        self.pools
            .read()
            .await
            .get(queue)
            .map(|pool| pool.active_count())
            .unwrap_or(0)
    }

    /// Per-queue statistics and store reachability. Never fails: a queue whose
    /// statistics cannot be read is reported unhealthy on its own.
    pub async fn health_check(&self) -> HealthReport {
        let store_ok = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Job store ping failed");
                false
            }
        };

        let checks = self.registry.queue_names().map(|queue| async move {
            let health = match self.store.counts(queue).await {
                Ok(counts) => QueueHealth {
                    healthy: true,
                    counts: Some(counts),
                    error: None,
                },
                Err(e) => QueueHealth {
                    healthy: false,
                    counts: None,
                    error: Some(e.to_string()),
                },
            };
            (queue.to_string(), health)
        });
        let queues: BTreeMap<String, QueueHealth> = join_all(checks).await.into_iter().collect();

        HealthReport {
            healthy: store_ok && queues.values().all(|q| q.healthy),
            store: self.store.backend_type(),
            initialized: self.is_initialized().await,
            shutting_down: self.is_shutting_down(),
            queues,
        }
    }

    /// Stop dequeuing, drain in-flight jobs up to the drain timeout, then
    /// release the store. Safe to call any number of times, concurrently:
    /// every caller waits for, and receives, the same report.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown_report
            .get_or_init(|| self.run_shutdown())
            .await
            .clone()
    }

    async fn run_shutdown(&self) -> ShutdownReport {
        let start = Instant::now();
        tracing::info!(
            drain_timeout_secs = self.config.drain_timeout.as_secs_f64(),
            "Queue manager shutting down"
        );

        let pools: Vec<Arc<WorkerPool>> = self.pools.write().await.drain().map(|(_, p)| p).collect();
        let drain_timeout = self.config.drain_timeout;
        let reports = join_all(pools.iter().map(|pool| pool.close(drain_timeout))).await;

        let _ = self.shutdown_tx.send(());
        let listeners = self
            .listeners
            .lock()
            .map(|mut l| std::mem::take(&mut *l))
            .unwrap_or_default();
        for listener in listeners {
            let _ = listener.await;
        }

        self.store.close().await;

        let report = ShutdownReport {
            duration: start.elapsed(),
            pools: reports,
        };
        tracing::info!(
            duration_ms = report.duration.as_millis() as u64,
            drained = report.drained(),
            stragglers = report.stragglers(),
            "Queue manager shut down"
        );
        report
    }
}

async fn listen(
    queue: String,
    mut events: broadcast::Receiver<QueueEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    tracing::debug!(
                        queue = %queue,
                        event = event.name(),
                        detail = %serde_json::to_string(&event).unwrap_or_default(),
                        "Queue event"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(queue = %queue, skipped, "Event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
