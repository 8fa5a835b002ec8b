//! Graceful shutdown of the task queue service.
//!
//! Sequence:
//! 1. Stop accepting HTTP requests and signal background tasks
//! 2. Stop dequeuing and wait for in-flight jobs, up to the drain timeout
//! 3. Release the job store and database pool

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::broadcast;

use crate::postgres::PostgresPool;
use crate::queue::{QueueManager, ShutdownReport};

/// Resolves on Ctrl+C or SIGTERM with the name of the signal.
pub async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

/// Handles graceful shutdown of the task queue service
pub struct GracefulShutdown {
    manager: Arc<QueueManager>,
    postgres_pool: Option<Arc<PostgresPool>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GracefulShutdown {
    pub fn new(manager: Arc<QueueManager>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            manager,
            postgres_pool: None,
            shutdown_tx,
        }
    }

    pub fn with_postgres(mut self, pool: Arc<PostgresPool>) -> Self {
        self.postgres_pool = Some(pool);
        self
    }

    /// Execute the shutdown sequence. Safe to call more than once; the queue
    /// manager hands every caller the same drain report.
    #[tracing::instrument(name = "graceful_shutdown", skip(self))]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Signaling background tasks");
        // No receivers left is fine
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 2: Draining worker pools");
        let report = self.manager.shutdown().await;

        tracing::info!("Phase 3: Releasing connections");
        if let Some(pool) = &self.postgres_pool {
            pool.close().await;
        }

        let result = ShutdownResult::from_report(report, start.elapsed());
        if result.success {
            tracing::info!(
                jobs_drained = result.jobs_drained,
                duration_ms = result.duration.as_millis(),
                "Graceful shutdown completed"
            );
        } else {
            tracing::warn!(
                jobs_drained = result.jobs_drained,
                stragglers = result.stragglers,
                duration_ms = result.duration.as_millis(),
                "Graceful shutdown completed with abandoned jobs"
            );
        }
        result
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Every in-flight job finished before the drain timeout
    pub success: bool,
    /// Jobs that finished during the drain
    pub jobs_drained: usize,
    /// Jobs abandoned at the drain timeout; stalled recovery picks them up
    pub stragglers: usize,
    pub duration: Duration,
}

impl ShutdownResult {
    fn from_report(report: ShutdownReport, duration: Duration) -> Self {
        let stragglers = report.stragglers();
        let in_flight: usize = report.pools.iter().map(|p| p.in_flight).sum();
        Self {
            success: report.drained(),
            jobs_drained: in_flight.saturating_sub(stragglers),
            stragglers,
            duration,
        }
    }
}
