//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use crate::redis::{CircuitState, RedisPool};

use super::{
    JOBS_ACTIVE, JOBS_COMPLETED_TOTAL, JOBS_ENQUEUED_TOTAL, JOBS_FAILED_TOTAL,
    JOBS_RETRIED_TOTAL, JOBS_STALLED_TOTAL, JOB_DURATION, PROVIDER_REQUESTS_TOTAL, QUEUE_JOBS,
    RATELIMIT_ALLOWED_TOTAL, RATELIMIT_DENIED_TOTAL, REDIS_CIRCUIT_BREAKER_STATE,
    REDIS_CONNECTION_STATUS, STORE_ERRORS_TOTAL, STORE_OPERATION_LATENCY,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Job lifecycle metrics
pub struct JobMetrics;

impl JobMetrics {
    pub fn record_enqueued(queue: &str) {
        JOBS_ENQUEUED_TOTAL.with_label_values(&[queue]).inc();
    }

    pub fn record_started(queue: &str) {
        JOBS_ACTIVE.with_label_values(&[queue]).inc();
    }

    pub fn record_completed(queue: &str, duration_secs: f64) {
        JOBS_ACTIVE.with_label_values(&[queue]).dec();
        JOBS_COMPLETED_TOTAL.with_label_values(&[queue]).inc();
        JOB_DURATION
            .with_label_values(&[queue, "completed"])
            .observe(duration_secs);
    }

    /// Attempt failed and the job was rescheduled
    pub fn record_retried(queue: &str, duration_secs: f64) {
        JOBS_ACTIVE.with_label_values(&[queue]).dec();
        JOBS_RETRIED_TOTAL.with_label_values(&[queue]).inc();
        JOB_DURATION
            .with_label_values(&[queue, "retried"])
            .observe(duration_secs);
    }

    pub fn record_failed(queue: &str, kind: &str, duration_secs: f64) {
        JOBS_ACTIVE.with_label_values(&[queue]).dec();
        JOBS_FAILED_TOTAL.with_label_values(&[queue, kind]).inc();
        JOB_DURATION
            .with_label_values(&[queue, "failed"])
            .observe(duration_secs);
    }

    /// Attempt ended but the store no longer held the job as active
    pub fn record_abandoned(queue: &str) {
        JOBS_ACTIVE.with_label_values(&[queue]).dec();
    }

    pub fn record_stalled(queue: &str, count: u64) {
        JOBS_STALLED_TOTAL.with_label_values(&[queue]).inc_by(count);
    }

    /// Stalled jobs that ran out of attempts
    pub fn record_stalled_failed(queue: &str) {
        JOBS_FAILED_TOTAL.with_label_values(&[queue, "stalled"]).inc();
    }
}

/// Queue depth gauges
pub struct QueueDepthMetrics;

impl QueueDepthMetrics {
    pub fn set(queue: &str, state: &str, count: u64) {
        QUEUE_JOBS
            .with_label_values(&[queue, state])
            .set(count as i64);
    }
}

/// Helper struct for recording rate limit metrics
pub struct RateLimitMetrics;

impl RateLimitMetrics {
    pub fn record_allowed(limiter: &str) {
        RATELIMIT_ALLOWED_TOTAL.with_label_values(&[limiter]).inc();
    }

    pub fn record_denied(limiter: &str) {
        RATELIMIT_DENIED_TOTAL.with_label_values(&[limiter]).inc();
    }
}

/// Outbound provider call outcomes
pub struct ProviderMetrics;

impl ProviderMetrics {
    pub fn record_success(provider: &str) {
        PROVIDER_REQUESTS_TOTAL
            .with_label_values(&[provider, "success"])
            .inc();
    }

    pub fn record_failure(provider: &str, outcome: &str) {
        PROVIDER_REQUESTS_TOTAL
            .with_label_values(&[provider, outcome])
            .inc();
    }
}

/// Helper struct for job store metrics
pub struct StoreMetrics;

impl StoreMetrics {
    pub fn record_latency(backend: &str, operation: &str, latency_secs: f64) {
        STORE_OPERATION_LATENCY
            .with_label_values(&[backend, operation])
            .observe(latency_secs);
    }

    pub fn record_error(backend: &str, operation: &str) {
        STORE_ERRORS_TOTAL
            .with_label_values(&[backend, operation])
            .inc();
    }
}

/// Redis connection gauges
pub struct RedisMetrics;

impl RedisMetrics {
    /// Refresh the connection gauges from the pool (called on scrape)
    pub fn update_from_pool(pool: &RedisPool) {
        REDIS_CONNECTION_STATUS.set(if pool.health().is_healthy() { 1 } else { 0 });
        let state = match pool.circuit_state() {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        REDIS_CIRCUIT_BREAKER_STATE.set(state);
    }
}
