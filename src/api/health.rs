//! Health check endpoint.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::queue::HealthReport;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisHealthResponse>,
    #[serde(flatten)]
    pub queues: HealthReport,
}

#[derive(Debug, Serialize)]
pub struct RedisHealthResponse {
    pub status: String,
    pub connected: bool,
    pub circuit_breaker_state: String,
    pub reconnection_attempts: u32,
}

/// GET /health - 200 when the store and every queue are healthy, 503 otherwise
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let report = state.manager.health_check().await;

    let redis = state.redis_pool.as_ref().map(|pool| {
        let stats = pool.health().stats();
        RedisHealthResponse {
            status: stats.status.as_str().to_string(),
            connected: pool.is_healthy(),
            circuit_breaker_state: pool.circuit_state().as_str().to_string(),
            reconnection_attempts: stats.reconnection_attempts,
        }
    });

    let healthy = report.healthy && !report.shutting_down;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            redis,
            queues: report,
        }),
    )
}
