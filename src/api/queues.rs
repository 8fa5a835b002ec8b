//! Queue statistics and job lookup endpoints.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::queue::{Job, JobCounts};
use crate::server::AppState;

/// Largest page `GET /queues/{queue}/failed` returns
const MAX_FAILED_PAGE: usize = 500;
const DEFAULT_FAILED_PAGE: usize = 50;

#[derive(Debug, Serialize)]
pub struct QueueSummary {
    pub task_type: &'static str,
    pub concurrency: usize,
    pub attempts: u32,
    pub paused: bool,
    /// Jobs running in this process
    pub running: usize,
    pub counts: JobCounts,
}

#[derive(Debug, Deserialize)]
pub struct FailedJobsQuery {
    #[serde(default)]
    pub start: Option<usize>,
    #[serde(default)]
    pub end: Option<usize>,
}

impl FailedJobsQuery {
    /// Inclusive range, capped to one page.
    fn range(&self) -> Result<(usize, usize)> {
        let start = self.start.unwrap_or(0);
        let end = self
            .end
            .unwrap_or(start.saturating_add(DEFAULT_FAILED_PAGE - 1));
        if end < start {
            return Err(AppError::Validation(format!(
                "end ({}) must not be before start ({})",
                end, start
            )));
        }
        Ok((start, end.min(start.saturating_add(MAX_FAILED_PAGE - 1))))
    }
}

/// GET /queues
pub async fn list_queues(State(state): State<AppState>) -> Result<Json<BTreeMap<String, QueueSummary>>> {
    let manager = &state.manager;
    let mut summaries = BTreeMap::new();

    for policy in manager.registry().policies() {
        let counts = manager.get_queue_statistics(&policy.name).await?;
        summaries.insert(
            policy.name.clone(),
            QueueSummary {
                task_type: policy.task_type.as_str(),
                concurrency: policy.concurrency,
                attempts: policy.attempts,
                paused: manager.is_paused(&policy.name).await?,
                running: manager.active_jobs(&policy.name).await,
                counts,
            },
        );
    }

    Ok(Json(summaries))
}

/// GET /queues/{queue}/stats
pub async fn queue_stats(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<JobCounts>> {
    Ok(Json(state.manager.get_queue_statistics(&queue).await?))
}

/// GET /queues/{queue}/failed?start&end
pub async fn failed_jobs(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(query): Query<FailedJobsQuery>,
) -> Result<Json<Vec<Job>>> {
    let (start, end) = query.range()?;
    Ok(Json(state.manager.get_failed_jobs(&queue, start, end).await?))
}

/// GET /queues/{queue}/jobs/{job_id}
pub async fn get_job(
    State(state): State<AppState>,
    Path((queue, job_id)): Path<(String, String)>,
) -> Result<Json<Job>> {
    state
        .manager
        .get_job(&queue, &job_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {} in queue {}", job_id, queue)))
}
