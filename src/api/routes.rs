use axum::{routing::get, Router};

use crate::server::AppState;

use super::health::health;
use super::metrics::prometheus_metrics;
use super::queues::{failed_jobs, get_job, list_queues, queue_stats};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/queues", get(list_queues))
        .route("/queues/{queue}/stats", get(queue_stats))
        .route("/queues/{queue}/failed", get(failed_jobs))
        .route("/queues/{queue}/jobs/{job_id}", get(get_job))
}
