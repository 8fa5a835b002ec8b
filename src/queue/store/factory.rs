//! Job store factory

use std::sync::Arc;

use crate::config::{QueueSettings, StoreKind};
use crate::redis::RedisPool;

use super::backend::JobStore;
use super::memory::MemoryJobStore;
use super::redis_store::RedisJobStore;

/// Create the job store selected by `queues.store`.
///
/// - `redis` (default): a `RedisJobStore` on the shared pool. Falls back to
///   memory, with a warning, when no pool is available.
/// - `memory`: a `MemoryJobStore`, for single-process deployments and tests.
///
/// ```rust,ignore
/// let store = create_job_store(&settings.queues, Some(redis_pool.clone()));
/// ```
pub fn create_job_store(
    settings: &QueueSettings,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn JobStore> {
    match settings.store {
        StoreKind::Redis => {
            if let Some(pool) = redis_pool {
                tracing::info!(
                    backend = "redis",
                    namespace = %pool.namespace(),
                    addr = %pool.target(),
                    "Creating Redis job store"
                );
                Arc::new(RedisJobStore::new(pool))
            } else {
                tracing::warn!(
                    "Redis job store requested but no pool provided, falling back to memory"
                );
                Arc::new(MemoryJobStore::new())
            }
        }
        StoreKind::Memory => {
            tracing::info!(backend = "memory", "Creating in-memory job store");
            Arc::new(MemoryJobStore::new())
        }
    }
}
