//! Redis-backed sliding-window limiter shared across processes

use std::sync::Arc;

use async_trait::async_trait;

use crate::redis::RedisPool;

use super::config::RateLimit;
use super::limiter::{
    LocalRateLimiter, RateLimitBackendType, RateLimitError, RateLimitResult, RateLimiter,
    RatePermit, IN_FLIGHT_LEASE,
};

// Timestamps come from the Redis clock so hosts with skewed clocks share one
// window. In-flight members are scored `now + lease`, settled ones at their
// settle time, so only settled members age out of the window.
// Returns {1, remaining} when admitted, {0, retry_after_ms} otherwise.
const ACQUIRE_SCRIPT: &str = r#"
if redis.replicate_commands then redis.replicate_commands() end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local window = tonumber(ARGV[1])
local max = tonumber(ARGV[2])
local lease = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
if count < max then
    redis.call('ZADD', KEYS[1], now + lease, ARGV[3])
    redis.call('PEXPIRE', KEYS[1], lease + window)
    return {1, max - count - 1}
end

local oldest = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'WITHSCORES', 'LIMIT', 0, 1)
local retry = window
if oldest[2] then
    retry = tonumber(oldest[2]) + window - now
end
if retry < 1 then retry = 1 end
return {0, retry}
"#;

const SETTLE_SCRIPT: &str = r#"
if redis.replicate_commands then redis.replicate_commands() end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('ZADD', KEYS[1], now, ARGV[1])
redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[2]) + tonumber(ARGV[3]))
return 1
"#;

pub struct RedisRateLimiter {
    pool: Arc<RedisPool>,
    name: String,
    key: String,
    limit: RateLimit,
    acquire_script: redis::Script,
    settle_script: redis::Script,
}

impl RedisRateLimiter {
    pub fn new(pool: Arc<RedisPool>, name: impl Into<String>, limit: RateLimit) -> Self {
        let name = name.into();
        let key = format!("{}:ratelimit:{}", pool.namespace(), name);
        Self {
            pool,
            name,
            key,
            limit,
            acquire_script: redis::Script::new(ACQUIRE_SCRIPT),
            settle_script: redis::Script::new(SETTLE_SCRIPT),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    fn backend_type(&self) -> RateLimitBackendType {
        RateLimitBackendType::Redis
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn limit(&self) -> RateLimit {
        self.limit
    }

    async fn try_acquire(&self) -> Result<RateLimitResult, RateLimitError> {
        let member = uuid::Uuid::new_v4().to_string();
        let mut invocation = self.acquire_script.key(&self.key);
        invocation
            .arg(self.limit.window_ms())
            .arg(self.limit.max)
            .arg(&member)
            .arg(IN_FLIGHT_LEASE.as_millis() as u64);

        let (allowed, value): (i64, i64) = self
            .pool
            .execute(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;

        tracing::trace!(
            limiter = %self.name,
            allowed = allowed == 1,
            value,
            "Distributed rate limit check"
        );

        if allowed == 1 {
            Ok(RateLimitResult::Allowed {
                permit: RatePermit { id: member },
                remaining: value.max(0) as u32,
            })
        } else {
            Ok(RateLimitResult::Denied {
                retry_after: std::time::Duration::from_millis(value.max(1) as u64),
            })
        }
    }

    async fn settle(&self, permit: RatePermit) -> Result<(), RateLimitError> {
        let mut invocation = self.settle_script.key(&self.key);
        invocation
            .arg(&permit.id)
            .arg(IN_FLIGHT_LEASE.as_millis() as u64)
            .arg(self.limit.window_ms());

        let _: i64 = self
            .pool
            .execute(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn release(&self, permit: RatePermit) -> Result<(), RateLimitError> {
        let key = self.key.clone();
        let _removed: i64 = self
            .pool
            .execute(|mut conn| async move {
                redis::cmd("ZREM")
                    .arg(&key)
                    .arg(&permit.id)
                    .query_async(&mut conn)
                    .await
            })
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        Ok(())
    }
}

/// Build a limiter for `name`: shared through Redis when a pool is available,
/// otherwise local to this process.
pub fn create_rate_limiter(
    name: &str,
    limit: RateLimit,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn RateLimiter> {
    match redis_pool {
        Some(pool) => {
            tracing::info!(
                limiter = %name,
                max = limit.max,
                window_ms = limit.window_ms(),
                "Using Redis rate limiter"
            );
            Arc::new(RedisRateLimiter::new(pool, name, limit))
        }
        None => {
            tracing::info!(
                limiter = %name,
                max = limit.max,
                window_ms = limit.window_ms(),
                "Using local rate limiter"
            );
            Arc::new(LocalRateLimiter::new(name, limit))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;

    #[test]
    fn test_create_local_rate_limiter() {
        let limiter = create_rate_limiter("email", RateLimit::per_second(10).unwrap(), None);
        assert_eq!(limiter.backend_type(), RateLimitBackendType::Local);
        assert_eq!(limiter.limit().max, 10);
    }

    #[test]
    fn test_redis_key_is_namespaced() {
        let pool = Arc::new(RedisPool::from_config(RedisConfig::default()).unwrap());
        let limiter = RedisRateLimiter::new(pool, "messaging", RateLimit::per_second(12).unwrap());
        assert_eq!(limiter.key(), "ara:tasks:ratelimit:messaging");
        assert_eq!(limiter.backend_type(), RateLimitBackendType::Redis);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_rate_limiter_ceiling() {
        let pool = Arc::new(RedisPool::from_config(RedisConfig::default()).unwrap());
        let name = format!("test-{}", uuid::Uuid::new_v4());
        let limiter = RedisRateLimiter::new(pool, name, RateLimit::per_second(2).unwrap());

        let first = match limiter.try_acquire().await.unwrap() {
            RateLimitResult::Allowed { permit, .. } => permit,
            other => panic!("expected permit, got {:?}", other),
        };
        assert!(limiter.try_acquire().await.unwrap().is_allowed());
        assert!(!limiter.try_acquire().await.unwrap().is_allowed());

        // Settled entries age out after one window
        limiter.settle(first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1_050)).await;
        assert!(limiter.try_acquire().await.unwrap().is_allowed());
    }
}
