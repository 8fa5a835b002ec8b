//! Redis connectivity
//!
//! - `RedisPool`: shared multiplexed connection used by the job store and the
//!   distributed rate limiter
//! - `CircuitBreaker`: fails store calls fast while Redis is unreachable
//! - `ExponentialBackoff`: delay schedule for workers waiting on the store
//! - `RedisHealth`: connection status surfaced by the health endpoint

mod backoff;
mod circuit_breaker;
mod health;
pub mod pool;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use health::{RedisHealth, RedisHealthStats, RedisHealthStatus};
pub use pool::{PoolError, RedisPool};

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
