//! End-to-end queue tests
//!
//! The full manager runs against the in-memory job store, with stub
//! providers standing in for the external messaging and email APIs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use ara_task_queue::config::{QueueOverride, QueueSettings, ShutdownSettings, StoreKind};
use ara_task_queue::processors::{
    BulkMessageProcessor, MessageReceipt, MessageSender, OutboundMessage, ProviderError,
};
use ara_task_queue::queue::{
    BulkMessagePayload, Job, JobContext, JobOptions, JobState, MessageRecipient, MemoryJobStore,
    ProcessError, Processor, QueueError, QueueManager, QueueManagerConfig, QueueRegistry,
    TaskPayload, TaskType, TemplateProcessingPayload, TemplateRecipient, TemplateSource, TenantId,
};
use ara_task_queue::ratelimit::{LocalRateLimiter, RateLimit, RateLimiter};

const BULK: &str = "bulk-message";
const TEMPLATES: &str = "template-processing";

// ============================================================================
// Stubs
// ============================================================================

/// Fails the sends whose 1-based position is listed; records call times.
struct StubSender {
    fail_on: Vec<usize>,
    calls: AtomicUsize,
    sent_at: Mutex<Vec<Instant>>,
}

impl StubSender {
    fn new(fail_on: Vec<usize>) -> Self {
        Self {
            fail_on,
            calls: AtomicUsize::new(0),
            sent_at: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MessageSender for StubSender {
    fn name(&self) -> &str {
        "stub"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<MessageReceipt, ProviderError> {
        self.sent_at.lock().unwrap().push(Instant::now());
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.contains(&call) {
            return Err(ProviderError::Rejected(format!("{} is not reachable", message.to)));
        }
        Ok(MessageReceipt {
            message_id: Some(format!("m-{}", call)),
        })
    }
}

/// Sleeps, tracking how many invocations overlap; fails while `broken` is set.
struct StubProcessor {
    task: TaskType,
    work: Duration,
    broken: AtomicBool,
    running: AtomicUsize,
    peak: AtomicUsize,
    invocations: AtomicUsize,
}

impl StubProcessor {
    fn new(task: TaskType, work: Duration) -> Arc<Self> {
        Arc::new(Self {
            task,
            work,
            broken: AtomicBool::new(false),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            invocations: AtomicUsize::new(0),
        })
    }

    fn failing(task: TaskType) -> Arc<Self> {
        let processor = Self::new(task, Duration::ZERO);
        processor.broken.store(true, Ordering::SeqCst);
        processor
    }
}

#[async_trait]
impl Processor for StubProcessor {
    fn task_type(&self) -> TaskType {
        self.task
    }

    async fn process(&self, ctx: &JobContext) -> Result<Value, ProcessError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.work).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.broken.load(Ordering::SeqCst) {
            return Err(ProcessError::retryable(format!(
                "downstream unavailable (attempt {})",
                ctx.attempt()
            )));
        }
        Ok(json!({ "items": ctx.payload().item_count() }))
    }
}

// ============================================================================
// Harness
// ============================================================================

fn queue_settings(overrides: &[(&str, QueueOverride)]) -> QueueSettings {
    QueueSettings {
        store: StoreKind::Memory,
        poll_interval_ms: 20,
        stalled_interval_ms: 60_000,
        lock_grace_ms: 30_000,
        clean_batch_limit: 1_000,
        overrides: overrides
            .iter()
            .map(|(name, ov)| (name.to_string(), ov.clone()))
            .collect::<HashMap<_, _>>(),
    }
}

/// No backoff so retries run back to back.
fn immediate_retries(concurrency: usize) -> QueueOverride {
    QueueOverride {
        concurrency: Some(concurrency),
        backoff_delay_ms: Some(0),
        ..Default::default()
    }
}

/// Manager with every task type served; `overrides` replace the stub for
/// their task type.
async fn start_manager(
    settings: QueueSettings,
    drain_timeout: Duration,
    overrides: Vec<Arc<dyn Processor>>,
) -> Arc<QueueManager> {
    let registry = QueueRegistry::from_settings(&settings).unwrap();
    let mut config = QueueManagerConfig::new(&settings, &ShutdownSettings::default());
    config.drain_timeout = drain_timeout;

    let mut builder =
        QueueManager::builder(registry, Arc::new(MemoryJobStore::new())).config(config);
    for task in TaskType::ALL {
        let processor = overrides
            .iter()
            .find(|p| p.task_type() == task)
            .cloned()
            .unwrap_or_else(|| StubProcessor::new(task, Duration::ZERO) as Arc<dyn Processor>);
        builder = builder.processor(processor);
    }

    let manager = Arc::new(builder.build());
    manager.initialize().await.unwrap();
    manager
}

fn bulk_payload(recipients: usize) -> TaskPayload {
    TaskPayload::BulkMessage(BulkMessagePayload {
        tenant_id: TenantId::new("tenant-a"),
        campaign_id: Some("spring-sale".into()),
        body: "Hello {{first_name}}".into(),
        recipients: (0..recipients)
            .map(|i| MessageRecipient {
                to: format!("+4470000000{:02}", i),
                variables: json!({ "first_name": format!("Customer {}", i) })
                    .as_object()
                    .cloned()
                    .unwrap(),
            })
            .collect(),
    })
}

fn template_payload(tag: usize) -> TaskPayload {
    TaskPayload::TemplateProcessing(TemplateProcessingPayload {
        tenant_id: TenantId::new("tenant-a"),
        template: TemplateSource::Inline {
            content: json!({ "subject": "Order {{order}}" }),
        },
        defaults: Default::default(),
        recipients: vec![TemplateRecipient {
            recipient: format!("buyer{}@example.com", tag),
            variables: json!({ "order": tag }).as_object().cloned().unwrap(),
        }],
    })
}

async fn wait_for_state(manager: &QueueManager, queue: &str, id: &str, state: JobState) -> Job {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let job = manager.get_job(queue, id).await.unwrap().expect("job exists");
        if job.state == state {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job {} stuck in {} waiting for {}",
            id,
            job.state,
            state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn bulk_processor(sender: Arc<StubSender>, limiter: Arc<dyn RateLimiter>) -> Arc<dyn Processor> {
    Arc::new(BulkMessageProcessor::new(sender, limiter))
}

fn generous_limiter() -> Arc<dyn RateLimiter> {
    Arc::new(LocalRateLimiter::new(
        "provider:test",
        RateLimit::per_second(1_000).unwrap(),
    ))
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_bulk_message_all_sent() {
    let sender = Arc::new(StubSender::new(vec![]));
    let manager = start_manager(
        queue_settings(&[]),
        Duration::from_secs(5),
        vec![bulk_processor(sender.clone(), generous_limiter())],
    )
    .await;

    let id = manager
        .enqueue(BULK, bulk_payload(3), JobOptions::default())
        .await
        .unwrap();

    let job = wait_for_state(&manager, BULK, &id, JobState::Completed).await;
    assert_eq!(
        job.result,
        Some(json!({ "sent": 3, "failed": 0, "errors": [] }))
    );
    assert_eq!(job.attempts_made, 1);
    assert_eq!(sender.calls.load(Ordering::SeqCst), 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_bulk_message_partial_failure_completes() {
    let sender = Arc::new(StubSender::new(vec![2]));
    let manager = start_manager(
        queue_settings(&[]),
        Duration::from_secs(5),
        vec![bulk_processor(sender, generous_limiter())],
    )
    .await;

    let id = manager
        .enqueue(BULK, bulk_payload(2), JobOptions::default())
        .await
        .unwrap();

    let job = wait_for_state(&manager, BULK, &id, JobState::Completed).await;
    let result = job.result.unwrap();
    assert_eq!(result["sent"], 1);
    assert_eq!(result["failed"], 1);
    assert_eq!(result["errors"][0]["recipient"], "+447000000001");
    assert!(result["errors"][0]["reason"]
        .as_str()
        .unwrap()
        .contains("not reachable"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_queue_rejected() {
    let manager = start_manager(queue_settings(&[]), Duration::from_secs(5), vec![]).await;

    let err = assert_err!(
        manager
            .enqueue("sms-blast", bulk_payload(1), JobOptions::default())
            .await
    );
    assert!(matches!(err, QueueError::UnknownQueue(ref q) if q == "sms-blast"));

    // Distinct from "job not found"
    let err = manager.get_job("sms-blast", "any").await.unwrap_err();
    assert!(matches!(err, QueueError::UnknownQueue(_)));

    for queue in manager.registry().queue_names() {
        let counts = manager.get_queue_statistics(queue).await.unwrap();
        assert_eq!(counts.waiting + counts.active + counts.delayed, 0);
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_attempts_end_in_failed() {
    let processor = StubProcessor::failing(TaskType::TemplateProcessing);
    let manager = start_manager(
        queue_settings(&[(TEMPLATES, immediate_retries(1))]),
        Duration::from_secs(5),
        vec![processor.clone() as Arc<dyn Processor>],
    )
    .await;

    let id = manager
        .enqueue(TEMPLATES, template_payload(1), JobOptions::default().with_attempts(3))
        .await
        .unwrap();

    let job = wait_for_state(&manager, TEMPLATES, &id, JobState::Failed).await;
    assert_eq!(job.attempts_made, 3);
    assert!(job.attempts_made <= job.attempts_max + 1);
    let failure = job.failure.expect("failure recorded");
    assert!(failure.reason.contains("downstream unavailable"));

    // Terminal: no further attempts happen on their own
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(processor.invocations.load(Ordering::SeqCst), 3);

    let failed = manager.get_failed_jobs(TEMPLATES, 0, 9).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_retry_failed_job_resets_attempts() {
    let processor = StubProcessor::failing(TaskType::TemplateProcessing);
    let manager = start_manager(
        queue_settings(&[(TEMPLATES, immediate_retries(1))]),
        Duration::from_secs(5),
        vec![processor.clone() as Arc<dyn Processor>],
    )
    .await;

    let id = manager
        .enqueue(TEMPLATES, template_payload(7), JobOptions::default().with_attempts(2))
        .await
        .unwrap();
    wait_for_state(&manager, TEMPLATES, &id, JobState::Failed).await;

    // Only failed jobs can be retried
    let other = manager
        .enqueue(
            TEMPLATES,
            template_payload(8),
            JobOptions::default().with_delay(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    assert!(!manager.retry_job(TEMPLATES, &other).await.unwrap());

    processor.broken.store(false, Ordering::SeqCst);
    assert!(assert_ok!(manager.retry_job(TEMPLATES, &id).await));

    let job = wait_for_state(&manager, TEMPLATES, &id, JobState::Completed).await;
    assert_eq!(job.attempts_made, 1);
    assert!(job.failure.is_none());
    assert_eq!(job.result, Some(json!({ "items": 1 })));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrency_limit_respected() {
    let processor = StubProcessor::new(TaskType::TemplateProcessing, Duration::from_millis(100));
    let manager = start_manager(
        queue_settings(&[(TEMPLATES, immediate_retries(2))]),
        Duration::from_secs(5),
        vec![processor.clone() as Arc<dyn Processor>],
    )
    .await;

    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(
            manager
                .enqueue(TEMPLATES, template_payload(i), JobOptions::default())
                .await
                .unwrap(),
        );
    }

    for id in &ids {
        let state = manager.get_job(TEMPLATES, id).await.unwrap().unwrap().state;
        assert!(matches!(state, JobState::Waiting | JobState::Active | JobState::Completed));
    }
    for id in &ids {
        wait_for_state(&manager, TEMPLATES, id, JobState::Completed).await;
    }

    assert_eq!(processor.peak.load(Ordering::SeqCst), 2);
    let counts = manager.get_queue_statistics(TEMPLATES).await.unwrap();
    assert_eq!(counts.completed, 8);
    assert_eq!(counts.active, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_queue_rate_limit_gates_activation() {
    let processor = StubProcessor::new(TaskType::TemplateProcessing, Duration::from_millis(50));
    let gated = QueueOverride {
        concurrency: Some(5),
        rate_limit_max: Some(2),
        rate_limit_window_ms: Some(1_000),
        ..Default::default()
    };
    let manager = start_manager(
        queue_settings(&[(TEMPLATES, gated)]),
        Duration::from_secs(5),
        vec![processor.clone() as Arc<dyn Processor>],
    )
    .await;

    let started = Instant::now();
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            manager
                .enqueue(TEMPLATES, template_payload(i), JobOptions::default())
                .await
                .unwrap(),
        );
    }

    // Free slots do not matter once the window's budget is spent
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(processor.invocations.load(Ordering::SeqCst), 2);
    let counts = manager.get_queue_statistics(TEMPLATES).await.unwrap();
    assert_eq!(counts.waiting, 3);

    for id in &ids {
        wait_for_state(&manager, TEMPLATES, id, JobState::Completed).await;
    }
    // Two per window: the fifth activation waits for the third window
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(processor.invocations.load(Ordering::SeqCst), 5);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_provider_ceiling_holds_over_rolling_window() {
    let ceiling = 5;
    let sender = Arc::new(StubSender::new(vec![]));
    let limiter: Arc<dyn RateLimiter> = Arc::new(LocalRateLimiter::new(
        "provider:messaging",
        RateLimit::per_second(ceiling).unwrap(),
    ));
    let manager = start_manager(
        queue_settings(&[(BULK, immediate_retries(2))]),
        Duration::from_secs(5),
        vec![bulk_processor(sender.clone(), limiter)],
    )
    .await;

    // Two jobs in parallel share the one provider budget
    let a = manager.enqueue(BULK, bulk_payload(6), JobOptions::default()).await.unwrap();
    let b = manager.enqueue(BULK, bulk_payload(6), JobOptions::default()).await.unwrap();
    wait_for_state(&manager, BULK, &a, JobState::Completed).await;
    wait_for_state(&manager, BULK, &b, JobState::Completed).await;

    let mut sent_at = sender.sent_at.lock().unwrap().clone();
    sent_at.sort();
    assert_eq!(sent_at.len(), 12);
    let window = Duration::from_secs(1);
    for (i, start) in sent_at.iter().enumerate() {
        let in_window = sent_at[i..]
            .iter()
            .filter(|t| t.duration_since(*start) < window)
            .count();
        assert!(
            in_window <= ceiling as usize,
            "{} sends within one second of send {}",
            in_window,
            i
        );
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_returns_once_active_jobs_finish() {
    let processor = StubProcessor::new(TaskType::TemplateProcessing, Duration::from_secs(1));
    let manager = start_manager(
        queue_settings(&[(TEMPLATES, immediate_retries(2))]),
        Duration::from_secs(5),
        vec![processor.clone() as Arc<dyn Processor>],
    )
    .await;

    let a = manager.enqueue(TEMPLATES, template_payload(1), JobOptions::default()).await.unwrap();
    let b = manager.enqueue(TEMPLATES, template_payload(2), JobOptions::default()).await.unwrap();
    wait_for_state(&manager, TEMPLATES, &a, JobState::Active).await;
    wait_for_state(&manager, TEMPLATES, &b, JobState::Active).await;

    let started = Instant::now();
    let report = manager.shutdown().await;
    let elapsed = started.elapsed();

    assert!(report.drained());
    assert!(elapsed < Duration::from_secs(3), "shutdown took {:?}", elapsed);

    // Both finished during the drain
    for id in [&a, &b] {
        let job = manager.get_job(TEMPLATES, id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }
}

#[tokio::test]
async fn test_shutdown_abandons_straggler_at_timeout() {
    let processor = StubProcessor::new(TaskType::TemplateProcessing, Duration::from_secs(30));
    let manager = start_manager(
        queue_settings(&[(TEMPLATES, immediate_retries(1))]),
        Duration::from_millis(300),
        vec![processor as Arc<dyn Processor>],
    )
    .await;

    let id = manager.enqueue(TEMPLATES, template_payload(1), JobOptions::default()).await.unwrap();
    wait_for_state(&manager, TEMPLATES, &id, JobState::Active).await;

    let started = Instant::now();
    let report = manager.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!report.drained());
    assert_eq!(report.stragglers(), 1);
}

#[tokio::test]
async fn test_cancel_active_job_discards_its_outcome() {
    let processor = StubProcessor::new(TaskType::TemplateProcessing, Duration::from_millis(300));
    let manager = start_manager(
        queue_settings(&[]),
        Duration::from_secs(5),
        vec![processor.clone() as Arc<dyn Processor>],
    )
    .await;

    let id = manager.enqueue(TEMPLATES, template_payload(1), JobOptions::default()).await.unwrap();
    wait_for_state(&manager, TEMPLATES, &id, JobState::Active).await;

    assert!(assert_ok!(manager.cancel_job(TEMPLATES, &id).await));
    assert!(manager.get_job(TEMPLATES, &id).await.unwrap().is_none());

    // The attempt runs to its end but writes nothing back
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(processor.invocations.load(Ordering::SeqCst), 1);
    assert_eq!(processor.running.load(Ordering::SeqCst), 0);
    assert!(manager.get_job(TEMPLATES, &id).await.unwrap().is_none());
    let counts = manager.get_queue_statistics(TEMPLATES).await.unwrap();
    assert_eq!(counts.completed, 0);
    assert_eq!(counts.active, 0);
    assert!(!manager.cancel_job(TEMPLATES, &id).await.unwrap());

    // Finished jobs are not cancellable
    let done = manager.enqueue(TEMPLATES, template_payload(2), JobOptions::default()).await.unwrap();
    wait_for_state(&manager, TEMPLATES, &done, JobState::Completed).await;
    assert!(!manager.cancel_job(TEMPLATES, &done).await.unwrap());
    let job = manager.get_job(TEMPLATES, &done).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_paused_queue_holds_jobs() {
    let manager = start_manager(queue_settings(&[]), Duration::from_secs(5), vec![]).await;

    manager.pause_queue(TEMPLATES).await.unwrap();
    let id = manager.enqueue(TEMPLATES, template_payload(3), JobOptions::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let job = manager.get_job(TEMPLATES, &id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(manager.get_queue_statistics(TEMPLATES).await.unwrap().paused, 1);

    manager.resume_queue(TEMPLATES).await.unwrap();
    wait_for_state(&manager, TEMPLATES, &id, JobState::Completed).await;

    manager.shutdown().await;
}

#[tokio::test]
async fn test_clean_purges_terminal_jobs_past_grace() {
    let processor = StubProcessor::failing(TaskType::TemplateProcessing);
    let manager = start_manager(
        queue_settings(&[(TEMPLATES, immediate_retries(1))]),
        Duration::from_secs(5),
        vec![processor.clone() as Arc<dyn Processor>],
    )
    .await;

    let failed = manager
        .enqueue(TEMPLATES, template_payload(1), JobOptions::default().with_attempts(1))
        .await
        .unwrap();
    wait_for_state(&manager, TEMPLATES, &failed, JobState::Failed).await;

    processor.broken.store(false, Ordering::SeqCst);
    let done = manager
        .enqueue(TEMPLATES, template_payload(2), JobOptions::default())
        .await
        .unwrap();
    wait_for_state(&manager, TEMPLATES, &done, JobState::Completed).await;

    // Still inside the grace period
    let removed = manager
        .clean_completed_jobs(TEMPLATES, Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(removed.is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let removed = manager
        .clean_completed_jobs(TEMPLATES, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(removed, vec![done.clone()]);
    let removed = manager
        .clean_failed_jobs(TEMPLATES, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(removed, vec![failed.clone()]);

    assert!(manager.get_job(TEMPLATES, &done).await.unwrap().is_none());
    let counts = manager.get_queue_statistics(TEMPLATES).await.unwrap();
    assert_eq!(counts.completed + counts.failed, 0);

    manager.shutdown().await;
}
