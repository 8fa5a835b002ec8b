//! Prometheus metrics for the task queue service.
//!
//! - Job lifecycle counters per queue (enqueued, completed, failed, retried, stalled)
//! - Job duration and active gauges
//! - Queue depth by state, refreshed whenever statistics are read
//! - Rate limiter and provider call outcomes
//! - Job store latency, errors and Redis connection state

mod helpers;

pub use helpers::{
    encode_metrics, JobMetrics, ProviderMetrics, QueueDepthMetrics, RateLimitMetrics,
    RedisMetrics, StoreMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_tasks";

lazy_static! {
    // ============================================================================
    // Job Metrics
    // ============================================================================

    pub static ref JOBS_ENQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_jobs_enqueued_total", METRIC_PREFIX),
        "Total jobs accepted by a queue",
        &["queue"]
    ).unwrap();

    pub static ref JOBS_COMPLETED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_jobs_completed_total", METRIC_PREFIX),
        "Total jobs that finished successfully",
        &["queue"]
    ).unwrap();

    /// Terminal failures, labelled by what ended the job
    pub static ref JOBS_FAILED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_jobs_failed_total", METRIC_PREFIX),
        "Total jobs that reached the failed state",
        &["queue", "kind"]
    ).unwrap();

    pub static ref JOBS_RETRIED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_jobs_retried_total", METRIC_PREFIX),
        "Total failed attempts rescheduled with backoff",
        &["queue"]
    ).unwrap();

    pub static ref JOBS_STALLED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_jobs_stalled_total", METRIC_PREFIX),
        "Total active jobs recovered after their lock lapsed",
        &["queue"]
    ).unwrap();

    pub static ref JOBS_ACTIVE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_jobs_active", METRIC_PREFIX),
        "Jobs currently executing in this process",
        &["queue"]
    ).unwrap();

    pub static ref JOB_DURATION: HistogramVec = register_histogram_vec!(
        format!("{}_job_duration_seconds", METRIC_PREFIX),
        "Wall time of a single job attempt",
        &["queue", "outcome"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0]
    ).unwrap();

    // ============================================================================
    // Queue Depth
    // ============================================================================

    pub static ref QUEUE_JOBS: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_queue_jobs", METRIC_PREFIX),
        "Jobs held by a queue per state",
        &["queue", "state"]
    ).unwrap();

    // ============================================================================
    // Rate Limiting
    // ============================================================================

    pub static ref RATELIMIT_ALLOWED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_allowed_total", METRIC_PREFIX),
        "Total permits granted",
        &["limiter"]
    ).unwrap();

    pub static ref RATELIMIT_DENIED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_ratelimit_denied_total", METRIC_PREFIX),
        "Total acquisitions that had to wait for the window to slide",
        &["limiter"]
    ).unwrap();

    // ============================================================================
    // Provider Metrics
    // ============================================================================

    pub static ref PROVIDER_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_provider_requests_total", METRIC_PREFIX),
        "Outbound provider calls by outcome",
        &["provider", "outcome"]
    ).unwrap();

    // ============================================================================
    // Store Metrics
    // ============================================================================

    pub static ref STORE_OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_store_operation_latency_seconds", METRIC_PREFIX),
        "Job store operation latency",
        &["backend", "operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_store_errors_total", METRIC_PREFIX),
        "Job store operation errors",
        &["backend", "operation"]
    ).unwrap();

    /// Redis connection status (1 = connected, 0 = disconnected)
    pub static ref REDIS_CONNECTION_STATUS: IntGauge = register_int_gauge!(
        format!("{}_redis_connection_status", METRIC_PREFIX),
        "Redis connection status (1=connected, 0=disconnected)"
    ).unwrap();

    /// Redis circuit breaker state (0=closed, 1=open, 2=half-open)
    pub static ref REDIS_CIRCUIT_BREAKER_STATE: IntGauge = register_int_gauge!(
        format!("{}_redis_circuit_breaker_state", METRIC_PREFIX),
        "Redis circuit breaker state (0=closed, 1=open, 2=half-open)"
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        JOBS_ENQUEUED_TOTAL.with_label_values(&["metrics-test"]).inc();

        let output = encode_metrics().unwrap();
        assert!(output.contains("ara_tasks_jobs_enqueued_total"));
    }

    #[test]
    fn test_redis_metrics() {
        REDIS_CONNECTION_STATUS.set(1);
        REDIS_CIRCUIT_BREAKER_STATE.set(0);
        // Just verify no panics
    }
}
