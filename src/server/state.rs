use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::queue::QueueManager;
use crate::redis::RedisPool;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub manager: Arc<QueueManager>,
    /// Present when the Redis store is in use
    pub redis_pool: Option<Arc<RedisPool>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        settings: Settings,
        manager: Arc<QueueManager>,
        redis_pool: Option<Arc<RedisPool>>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            manager,
            redis_pool,
            start_time: Instant::now(),
        }
    }
}
