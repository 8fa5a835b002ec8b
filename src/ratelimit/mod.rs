//! Rate limiting with a sliding-window log.
//!
//! Used in two places: queue-level dequeue budgets, and the per-provider
//! ceilings that bulk-message and email processors acquire before every
//! external call. Supports local (in-memory) and distributed (Redis) backends.

mod config;
mod distributed;
mod limiter;

pub use config::RateLimit;
pub use distributed::{create_rate_limiter, RedisRateLimiter};
pub use limiter::{
    LocalRateLimiter, RateLimitBackendType, RateLimitError, RateLimitResult, RateLimiter,
    RatePermit, IN_FLIGHT_LEASE,
};
