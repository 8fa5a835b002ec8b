//! Local sliding-window rate limiter

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::metrics::RateLimitMetrics;

use super::config::RateLimit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitBackendType {
    /// In-process log, one budget per process
    Local,
    /// Redis sorted set shared by every process
    Redis,
}

impl RateLimitBackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitBackendType::Local => "local",
            RateLimitBackendType::Redis => "redis",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit backend error: {0}")]
    Backend(String),
}

/// Longest an admitted operation may stay unsettled before its slot lapses.
/// Bounds the leak when a holder dies between acquire and settle.
pub const IN_FLIGHT_LEASE: Duration = Duration::from_secs(60);

/// Handle on one admitted operation. Hand it back with `settle` once the
/// operation ran, or with `release` if it never did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePermit {
    pub(crate) id: String,
}

#[derive(Debug, Clone)]
pub enum RateLimitResult {
    Allowed { permit: RatePermit, remaining: u32 },
    /// Budget spent; retry after `retry_after`
    Denied { retry_after: Duration },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

/// Sliding-log limiter.
///
/// An admitted operation counts against the budget while in flight, and
/// from `settle` on it counts for one more window stamped at the settle
/// instant. Callers settle right after the guarded call returns, so the
/// calls themselves (not just their admissions) never exceed `max` in any
/// rolling window.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    fn backend_type(&self) -> RateLimitBackendType;

    /// Label used in logs and metrics
    fn name(&self) -> &str;

    fn limit(&self) -> RateLimit;

    async fn try_acquire(&self) -> Result<RateLimitResult, RateLimitError>;

    /// Record that the admitted operation ran.
    async fn settle(&self, permit: RatePermit) -> Result<(), RateLimitError>;

    /// Remove an admitted operation that never happened.
    async fn release(&self, permit: RatePermit) -> Result<(), RateLimitError>;

    /// Wait until the budget admits one operation.
    async fn acquire(&self) -> Result<RatePermit, RateLimitError> {
        loop {
            match self.try_acquire().await? {
                RateLimitResult::Allowed { permit, .. } => {
                    RateLimitMetrics::record_allowed(self.name());
                    return Ok(permit);
                }
                RateLimitResult::Denied { retry_after } => {
                    RateLimitMetrics::record_denied(self.name());
                    tokio::time::sleep(retry_after.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// `settle`, logging instead of failing; the lease reclaims the slot.
    async fn settle_quietly(&self, permit: RatePermit) {
        if let Err(e) = self.settle(permit).await {
            tracing::debug!(limiter = %self.name(), error = %e, "Failed to settle rate permit");
        }
    }
}

struct Log {
    /// Admitted, not yet settled, by admission time
    in_flight: Vec<(Instant, u64)>,
    /// Settled, by settle time
    settled: VecDeque<(Instant, u64)>,
}

pub struct LocalRateLimiter {
    name: String,
    limit: RateLimit,
    log: Mutex<Log>,
    next_id: AtomicU64,
}

impl LocalRateLimiter {
    pub fn new(name: impl Into<String>, limit: RateLimit) -> Self {
        Self {
            name: name.into(),
            limit,
            log: Mutex::new(Log {
                in_flight: Vec::new(),
                settled: VecDeque::with_capacity(limit.max as usize),
            }),
            next_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, now: Instant) -> RateLimitResult {
        let mut log = self.lock();

        while let Some((at, _)) = log.settled.front() {
            if now.duration_since(*at) >= self.limit.window {
                log.settled.pop_front();
            } else {
                break;
            }
        }
        log.in_flight
            .retain(|(at, _)| now.duration_since(*at) < IN_FLIGHT_LEASE);

        let used = (log.settled.len() + log.in_flight.len()) as u32;
        if used < self.limit.max {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            log.in_flight.push((now, id));
            RateLimitResult::Allowed {
                permit: RatePermit { id: id.to_string() },
                remaining: self.limit.max - used - 1,
            }
        } else {
            // Only a settled entry ageing out frees a slot on its own
            let retry_after = match log.settled.front() {
                Some((oldest, _)) => self.limit.window.saturating_sub(now.duration_since(*oldest)),
                None => self.limit.window,
            };
            RateLimitResult::Denied { retry_after }
        }
    }

    fn take_in_flight(log: &mut Log, permit: &RatePermit) -> Option<u64> {
        let pos = log
            .in_flight
            .iter()
            .position(|(_, id)| id.to_string() == permit.id)?;
        Some(log.in_flight.swap_remove(pos).1)
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    fn backend_type(&self) -> RateLimitBackendType {
        RateLimitBackendType::Local
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn limit(&self) -> RateLimit {
        self.limit
    }

    async fn try_acquire(&self) -> Result<RateLimitResult, RateLimitError> {
        Ok(self.check(Instant::now()))
    }

    async fn settle(&self, permit: RatePermit) -> Result<(), RateLimitError> {
        let mut log = self.lock();
        // Stamped under the lock so the settled log stays ordered
        let now = Instant::now();
        // A lapsed lease still ran; count it from now either way
        let id = Self::take_in_flight(&mut log, &permit)
            .unwrap_or_else(|| self.next_id.fetch_add(1, Ordering::Relaxed));
        log.settled.push_back((now, id));
        Ok(())
    }

    async fn release(&self, permit: RatePermit) -> Result<(), RateLimitError> {
        let mut log = self.lock();
        if Self::take_in_flight(&mut log, &permit).is_none() {
            if let Some(pos) = log.settled.iter().position(|(_, id)| id.to_string() == permit.id) {
                log.settled.remove(pos);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: u64) -> LocalRateLimiter {
        LocalRateLimiter::new(
            "test",
            RateLimit::new(max, Duration::from_millis(window_ms)).unwrap(),
        )
    }

    async fn admit(limiter: &LocalRateLimiter) -> RatePermit {
        match limiter.try_acquire().await.unwrap() {
            RateLimitResult::Allowed { permit, .. } => permit,
            other => panic!("expected permit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_admits_up_to_max() {
        let limiter = limiter(3, 1_000);

        for _ in 0..3 {
            assert!(limiter.try_acquire().await.unwrap().is_allowed());
        }
        assert!(!limiter.try_acquire().await.unwrap().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = limiter(2, 1_000);

        let first = admit(&limiter).await;
        limiter.settle(first).await.unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        let second = admit(&limiter).await;
        limiter.settle(second).await.unwrap();

        match limiter.try_acquire().await.unwrap() {
            RateLimitResult::Denied { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(400))
            }
            other => panic!("expected denial, got {:?}", other),
        }

        // First entry leaves the window; second is still inside it
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(limiter.try_acquire().await.unwrap().is_allowed());
        assert!(!limiter.try_acquire().await.unwrap().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_counts_from_settle() {
        let limiter = limiter(1, 1_000);

        let permit = admit(&limiter).await;
        // A slow call holds its slot the whole time
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(!limiter.try_acquire().await.unwrap().is_allowed());

        limiter.settle(permit).await.unwrap();
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!limiter.try_acquire().await.unwrap().is_allowed());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(limiter.try_acquire().await.unwrap().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_permit_lapses_after_lease() {
        let limiter = limiter(1, 1_000);

        let _abandoned = admit(&limiter).await;
        tokio::time::advance(IN_FLIGHT_LEASE - Duration::from_millis(1)).await;
        assert!(!limiter.try_acquire().await.unwrap().is_allowed());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(limiter.try_acquire().await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_release_returns_slot() {
        let limiter = limiter(1, 60_000);

        let permit = admit(&limiter).await;
        assert!(!limiter.try_acquire().await.unwrap().is_allowed());

        limiter.release(permit).await.unwrap();
        let permit = admit(&limiter).await;

        // Settled operations can be handed back too
        limiter.settle(permit.clone()).await.unwrap();
        limiter.release(permit).await.unwrap();
        assert!(limiter.try_acquire().await.unwrap().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_window() {
        let limiter = limiter(1, 1_000);
        let start = Instant::now();

        let permit = limiter.acquire().await.unwrap();
        limiter.settle(permit).await.unwrap();
        limiter.acquire().await.unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1_000));
        assert!(elapsed < Duration::from_millis(1_100));
    }
}
