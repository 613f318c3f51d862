//! Circuit breaker guarding calls to a failing collaborator.

use std::time::{Duration, Instant};

/// Breaker state machine.
///
/// ```text
/// closed    -> open       (failure_threshold consecutive failures)
/// open      -> half_open  (open_duration elapsed; one probe allowed)
/// half_open -> closed     (probe succeeded)
/// half_open -> open       (probe failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

/// A circuit breaker with consecutive-failure tracking.
///
/// Not internally synchronized; the owner is expected to be a single task
/// (the index write queue) or to wrap it in its own lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CircuitBreaker {
    /// Breaker that opens after `failure_threshold` consecutive failures
    /// and stays open for `open_duration` before allowing a probe.
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            failure_threshold,
            open_duration,
        }
    }

    /// Whether a call may proceed right now. An expired `Open` hold
    /// transitions to `HalfOpen` and admits exactly one probe.
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call; closes the breaker and resets the count.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    /// Record a failed call. Opens the breaker when the threshold is
    /// reached, or re-opens immediately after a failed half-open probe.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let reopen = matches!(self.state, BreakerState::HalfOpen)
            || self.consecutive_failures >= self.failure_threshold;
        if reopen {
            self.state = BreakerState::Open {
                until: Instant::now() + self.open_duration,
            };
        }
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether the breaker currently suppresses calls.
    pub fn is_open(&self) -> bool {
        matches!(self.state, BreakerState::Open { until } if Instant::now() < until)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.allow_request());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(!breaker.allow_request());
    }

    #[test]
    fn success_resets_the_count() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        // Zero hold means the next request is the probe.
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_reopens_on_failure() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure();
        assert!(matches!(breaker.state(), BreakerState::Open { .. }));
    }
}
