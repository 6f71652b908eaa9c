//! Per-node failure tracking.
//!
//! A node whose circuit is open is skipped by resolution until either a
//! success is reported for it or the retest delay has passed since its last
//! failure.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long an open circuit keeps the node out of rotation
    pub retest_delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            retest_delay: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set retest delay
    pub fn with_retest_delay(mut self, delay: Duration) -> Self {
        self.retest_delay = delay;
        self
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Node is in rotation
    Closed,
    /// Node failed too often and is skipped
    Open,
}

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    config: CircuitBreakerConfig,
    failures: u32,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub(crate) fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            failures: 0,
            last_failure: None,
        }
    }

    pub(crate) fn success(&mut self) {
        self.failures = 0;
        self.last_failure = None;
    }

    pub(crate) fn failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(Instant::now());
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn state(&self) -> CircuitState {
        if self.failures < self.config.failure_threshold.max(1) {
            return CircuitState::Closed;
        }
        match self.last_failure {
            Some(at) if at.elapsed() < self.config.retest_delay => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }

    pub(crate) fn available(&self) -> bool {
        self.state() == CircuitState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::default())
    }

    #[test]
    fn available_without_failures() {
        let breaker = breaker();
        for _ in 0..10 {
            assert!(breaker.available());
        }
    }

    #[tokio::test]
    async fn opens_at_the_threshold() {
        let mut breaker = breaker();
        let mut seen = Vec::new();
        for _ in 0..3 {
            breaker.failure();
            seen.push(breaker.available());
        }
        seen.push(breaker.available());
        assert_eq!(seen, vec![true, true, false, false]);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn closes_after_the_retest_delay() {
        let mut breaker = breaker();
        for _ in 0..3 {
            breaker.failure();
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breaker.available());
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(breaker.available());
    }

    #[tokio::test]
    async fn success_resets_the_count() {
        let mut breaker = breaker();
        for _ in 0..3 {
            breaker.failure();
        }
        breaker.success();
        let mut seen = vec![breaker.available()];
        for _ in 0..3 {
            breaker.failure();
            seen.push(breaker.available());
        }
        seen.push(breaker.available());
        assert_eq!(seen, vec![true, true, true, false, false]);
    }
}
