//! Rate limit budgets

use std::time::Duration;

use crate::config::ProviderConfig;

/// At most `max` operations in any rolling window of `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

impl RateLimit {
    /// Returns `None` for a zero budget or an empty window.
    pub fn new(max: u32, window: Duration) -> Option<Self> {
        if max == 0 || window.is_zero() {
            return None;
        }
        Some(Self { max, window })
    }

    pub fn per_second(max: u32) -> Option<Self> {
        Self::new(max, Duration::from_secs(1))
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

impl ProviderConfig {
    /// Ceiling of the provider API as a one-second budget.
    pub fn rate_limit(&self) -> Option<RateLimit> {
        RateLimit::per_second(self.rate_per_second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_budgets() {
        assert!(RateLimit::new(0, Duration::from_secs(1)).is_none());
        assert!(RateLimit::new(5, Duration::ZERO).is_none());
    }

    #[test]
    fn test_per_second() {
        let limit = RateLimit::per_second(12).unwrap();
        assert_eq!(limit.max, 12);
        assert_eq!(limit.window_ms(), 1_000);
    }
}
