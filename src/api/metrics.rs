//! Prometheus metrics endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::metrics::{self, RedisMetrics};
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    update_metrics_from_state(&state).await;

    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain")],
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Refresh gauges that are sampled rather than counted
async fn update_metrics_from_state(state: &AppState) {
    if let Some(pool) = &state.redis_pool {
        RedisMetrics::update_from_pool(pool);
    }

    // Reading statistics refreshes the queue depth gauges
    for queue in state.manager.registry().queue_names() {
        if let Err(e) = state.manager.get_queue_statistics(queue).await {
            tracing::warn!(queue = %queue, error = %e, "Failed to refresh queue depth");
        }
    }
}
