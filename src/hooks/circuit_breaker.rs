//! Circuit breaker for auxiliary integrations

use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through
    Closed,
    /// Calls are rejected until the recovery timeout elapses
    Open,
    /// A single trial call is allowed
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_taken: bool,
}

/// Counts consecutive failures and stops calling once a threshold is hit
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: RwLock::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_taken: false,
            }),
        }
    }

    /// Whether a call may go through right now
    ///
    /// Once the recovery timeout has passed, an open breaker moves to
    /// half-open and hands out exactly one trial call. Further calls are
    /// refused until that trial is recorded.
    pub fn can_call(&self) -> bool {
        {
            let inner = self.read();
            match inner.state {
                BreakerState::Closed => return true,
                BreakerState::HalfOpen => {
                    if inner.trial_taken {
                        return false;
                    }
                }
                BreakerState::Open => {
                    if !self.recovery_elapsed(&inner) {
                        return false;
                    }
                }
            }
        }

        // Re-check under the write lock; another caller may have taken the trial
        let mut inner = self.write();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open if self.recovery_elapsed(&inner) => {
                debug!("Circuit breaker half-open, allowing trial call");
                inner.state = BreakerState::HalfOpen;
                inner.trial_taken = true;
                true
            }
            BreakerState::HalfOpen if !inner.trial_taken => {
                inner.trial_taken = true;
                true
            }
            _ => false,
        }
    }

    /// Reset to closed
    pub fn record_success(&self) {
        let mut inner = self.write();
        if inner.state != BreakerState::Closed {
            debug!("Circuit breaker closed after successful call");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.trial_taken = false;
    }

    /// Count a failure, opening the breaker at the threshold
    pub fn record_failure(&self) {
        let mut inner = self.write();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.trial_taken = false;

        let reopen = inner.state == BreakerState::HalfOpen;
        if reopen || inner.failure_count >= self.failure_threshold {
            if inner.state != BreakerState::Open {
                warn!(
                    "Circuit breaker opened after {} failures",
                    inner.failure_count
                );
            }
            inner.state = BreakerState::Open;
        }
    }

    pub fn state(&self) -> BreakerState {
        self.read().state
    }

    pub fn failure_count(&self) -> u32 {
        self.read().failure_count
    }

    fn recovery_elapsed(&self, inner: &Inner) -> bool {
        inner
            .last_failure
            .map(|t| t.elapsed() >= self.recovery_timeout)
            .unwrap_or(true)
    }

    // Counters stay consistent even if a holder panicked
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.can_call());
        assert!(cb.can_call());
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(60));

        cb.record_failure();
        assert!(cb.can_call());
        assert_eq!(cb.state(), BreakerState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.can_call());
        assert_eq!(cb.failure_count(), 2);
    }

    #[test]
    fn test_success_resets_count() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(60));

        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.failure_count(), 1);
    }

    #[test]
    fn test_half_open_allows_single_trial() {
        let cb = CircuitBreaker::new(2, Duration::from_millis(40));
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.can_call());

        std::thread::sleep(Duration::from_millis(60));

        assert!(cb.can_call());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(!cb.can_call());

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        for _ in 0..5 {
            assert!(cb.can_call());
        }
    }

    #[test]
    fn test_failed_trial_reopens() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(40));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(60));

        assert!(cb.can_call());
        cb.record_failure();

        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.can_call());
    }
}
