//! Asynchronous job queues.
//!
//! One queue per task type. Callers enqueue through the [`QueueManager`];
//! each queue's [`WorkerPool`] dequeues from the shared [`JobStore`] and runs
//! the queue's [`Processor`], driving the job state machine in [`job`].

mod context;
mod error;
mod events;
pub mod job;
mod manager;
pub mod payload;
mod processor;
mod registry;
pub mod store;
mod worker;

pub use context::JobContext;
pub use error::{QueueError, StoreError};
pub use events::{QueueEvent, QueueEvents};
pub use job::{
    AttemptOutcome, BackoffKind, BackoffPolicy, FailureKind, Job, JobFailure, JobId, JobOptions,
    JobState, Priority, Progress, RetentionPolicy,
};
pub use manager::{
    HealthReport, QueueHealth, QueueManager, QueueManagerBuilder, QueueManagerConfig,
    ShutdownReport,
};
pub use payload::{
    BulkMessagePayload, ContactImportPayload, ContactRecord, EmailNotificationPayload,
    EmailRecipient, MessageRecipient, TaskPayload, TemplateProcessingPayload, TemplateRecipient,
    TemplateSource, TenantId, Variables,
};
pub use processor::{ProcessError, Processor};
pub use registry::{QueuePolicy, QueueRegistry, TaskType};
pub use store::{create_job_store, JobCounts, JobStore, MemoryJobStore, RedisJobStore};
pub use worker::{DrainReport, WorkerConfig, WorkerPool};
