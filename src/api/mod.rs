//! API layer - monitoring endpoints over the queue manager.
//!
//! Read-only: jobs are enqueued by the request-handling layer through
//! [`QueueManager`](crate::queue::QueueManager), never over HTTP.

mod health;
mod metrics;
mod queues;
mod routes;

pub use health::{health, HealthResponse};
pub use metrics::prometheus_metrics;
pub use queues::{failed_jobs, get_job, list_queues, queue_stats, FailedJobsQuery, QueueSummary};
pub use routes::api_routes;
