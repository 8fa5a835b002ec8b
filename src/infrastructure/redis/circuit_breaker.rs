//! Circuit breaker guarding calls into the backing stores.
//!
//! Both the Redis job store and the PostgreSQL repositories share this type.
//! While the circuit is open, store calls fail fast with an "unavailable"
//! error instead of piling up behind a dead connection; the worker pools then
//! back off and the health check reports the queue as unhealthy.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use crate::config::RedisConfig;

use super::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_raw(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Successful probes in half-open state needed to close it again
    pub success_threshold: u32,
    /// How long the circuit stays open before probing (ms)
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 30_000,
        }
    }
}

impl From<&RedisConfig> for CircuitBreakerConfig {
    fn from(config: &RedisConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_failure_threshold.max(1),
            success_threshold: config.circuit_breaker_success_threshold.max(1),
            reset_timeout_ms: config.circuit_breaker_reset_timeout_seconds * 1000,
        }
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    failures: AtomicU32,
    probes_succeeded: AtomicU32,
    opened_at: AtomicI64,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU32::new(0),
            probes_succeeded: AtomicU32::new(0),
            opened_at: AtomicI64::new(0),
            config,
        }
    }

    /// Current state. An open circuit whose reset timeout elapsed moves to
    /// half-open here, so every caller observes the transition.
    pub fn state(&self) -> CircuitState {
        let raw = self.state.load(Ordering::Acquire);
        if CircuitState::from_raw(raw) == CircuitState::Open {
            let elapsed = current_time_ms() - self.opened_at.load(Ordering::Acquire);
            if elapsed >= self.config.reset_timeout_ms as i64
                && self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                self.probes_succeeded.store(0, Ordering::Release);
                tracing::info!("Store circuit half-open, probing backend");
            }
        }
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        match CircuitState::from_raw(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => self.failures.store(0, Ordering::Release),
            CircuitState::HalfOpen => {
                let probes = self.probes_succeeded.fetch_add(1, Ordering::AcqRel) + 1;
                if probes >= self.config.success_threshold {
                    self.failures.store(0, Ordering::Release);
                    self.state
                        .store(CircuitState::Closed as u8, Ordering::Release);
                    tracing::info!("Store circuit closed, backend recovered");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match CircuitState::from_raw(self.state.load(Ordering::Acquire)) {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.open();
                    tracing::warn!(failures, "Store circuit opened");
                }
            }
            CircuitState::HalfOpen => {
                self.open();
                tracing::warn!("Store circuit reopened, probe failed");
            }
            CircuitState::Open => {
                self.opened_at.store(current_time_ms(), Ordering::Release);
            }
        }
    }

    fn open(&self) {
        self.opened_at.store(current_time_ms(), Ordering::Release);
        self.probes_succeeded.store(0, Ordering::Release);
        self.state.store(CircuitState::Open as u8, Ordering::Release);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            failure_count: self.failures.load(Ordering::Acquire),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(failure_threshold: u32, reset_timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 2,
            reset_timeout_ms,
        })
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, 1_000);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = breaker(3, 1_000);

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_cycle() {
        let cb = breaker(1, 10);

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let cb = breaker(1, 10);

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(
            CircuitState::from_raw(cb.state.load(Ordering::Acquire)),
            CircuitState::Open
        );
    }

    #[test]
    fn test_config_from_redis_settings() {
        let redis = RedisConfig {
            circuit_breaker_failure_threshold: 7,
            circuit_breaker_reset_timeout_seconds: 3,
            ..Default::default()
        };
        let config = CircuitBreakerConfig::from(&redis);
        assert_eq!(config.failure_threshold, 7);
        assert_eq!(config.reset_timeout_ms, 3_000);
    }
}
