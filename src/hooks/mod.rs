//! Resilient execution of auxiliary hooks
//!
//! Hooks are side integrations (telemetry posts, progress helpers) that run
//! next to the agent. A failing hook must never fail a run, so every hook
//! call goes through [`execute_hook_with_resilience`], which logs the
//! failure, feeds the circuit breaker and hands back a [`HookOutcome`]
//! instead of an error.

mod circuit_breaker;
mod settings;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use settings::{hook_env, HookInstall, HookTelemetry};

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::Result;

/// Default time a single hook may take
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Circuit breaker plus per-call timeout shared by a family of hooks
#[derive(Debug)]
pub struct HookGuard {
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl HookGuard {
    pub fn new(breaker: CircuitBreaker, timeout: Duration) -> Self {
        Self { breaker, timeout }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for HookGuard {
    fn default() -> Self {
        Self::new(CircuitBreaker::default(), DEFAULT_HOOK_TIMEOUT)
    }
}

/// What happened to a guarded hook call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// Hook ran and succeeded
    Completed,
    /// Hook ran and returned an error
    Failed(String),
    /// Hook ran past the guard's timeout
    TimedOut,
    /// Breaker was open, hook not invoked
    Skipped,
}

/// Run `hook` behind the guard's breaker and timeout
///
/// Never returns an error. Failures and timeouts are logged here and counted
/// against the breaker; an open breaker skips the hook without calling it.
pub async fn execute_hook_with_resilience<F, Fut>(
    guard: &HookGuard,
    name: &str,
    hook: F,
) -> HookOutcome
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if !guard.breaker.can_call() {
        debug!("Skipping hook {}: circuit open", name);
        return HookOutcome::Skipped;
    }

    match tokio::time::timeout(guard.timeout, hook()).await {
        Ok(Ok(())) => {
            guard.breaker.record_success();
            HookOutcome::Completed
        }
        Ok(Err(e)) => {
            guard.breaker.record_failure();
            warn!("Hook {} failed: {}", name, e);
            HookOutcome::Failed(e.to_string())
        }
        Err(_) => {
            guard.breaker.record_failure();
            warn!("Hook {} timed out after {:?}", name, guard.timeout);
            HookOutcome::TimedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn guard(threshold: u32) -> HookGuard {
        HookGuard::new(
            CircuitBreaker::new(threshold, Duration::from_secs(60)),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let guard = guard(3);
        let outcome = execute_hook_with_resilience(&guard, "ok", || async { Ok(()) }).await;
        assert_eq!(outcome, HookOutcome::Completed);
        assert_eq!(guard.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_failing_hook_opens_circuit() {
        let guard = guard(3);
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let outcome = execute_hook_with_resilience(&guard, "broken", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Hook("boom".to_string()))
            })
            .await;
            assert_eq!(outcome, HookOutcome::Failed("Hook error: boom".to_string()));
        }
        assert_eq!(guard.breaker().state(), BreakerState::Open);

        let start = Instant::now();
        for _ in 0..10 {
            let outcome = execute_hook_with_resilience(&guard, "broken", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Hook("boom".to_string()))
            })
            .await;
            assert_eq!(outcome, HookOutcome::Skipped);
        }

        assert!(start.elapsed() < Duration::from_millis(10));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_slow_hook_times_out() {
        let guard = guard(1);
        let outcome = execute_hook_with_resilience(&guard, "slow", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert_eq!(outcome, HookOutcome::TimedOut);
        assert_eq!(guard.breaker().state(), BreakerState::Open);
    }
}
