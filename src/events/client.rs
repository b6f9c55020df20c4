//! HTTP delivery of run events
//!
//! Posts each lifecycle event as JSON to an external endpoint. Every post is
//! a hook: it runs behind the client's [`HookGuard`], so a dead endpoint
//! costs the run at most a logged warning. Posts are awaited on the run's
//! own path, so the guard's timeout is kept short.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Event, EventEmitter, EventKind, WorkflowEvent};
use crate::hooks::{execute_hook_with_resilience, CircuitBreaker, HookGuard};
use crate::workflow::WorkflowState;
use crate::{Error, Result};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_STEP: Duration = Duration::from_millis(100);

/// Longest a single lifecycle post, retries included, may hold up a run
pub const POST_TIMEOUT: Duration = Duration::from_secs(2);

/// Posts events to `endpoint`
#[derive(Debug, Clone)]
pub struct EventClient {
    endpoint: String,
    http: reqwest::Client,
    guard: Arc<HookGuard>,
}

impl EventClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(POST_TIMEOUT).build()?;

        Ok(Self {
            endpoint: endpoint.into(),
            http,
            guard: Arc::new(HookGuard::new(CircuitBreaker::default(), POST_TIMEOUT)),
        })
    }

    pub fn with_guard(mut self, guard: Arc<HookGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Post with retry, waiting 100ms, then 200ms, between attempts
    pub async fn post(&self, event: &WorkflowEvent) -> Result<()> {
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.post_once(event).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Posting {} failed (attempt {}): {}", event.event_type, attempt, e);
                    last_err = Some(e);
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(BACKOFF_STEP * attempt).await;
            }
        }

        Err(Error::Hook(format!(
            "failed after {} attempts: {}",
            MAX_ATTEMPTS,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn post_once(&self, event: &WorkflowEvent) -> Result<()> {
        let response = self.http.post(&self.endpoint).json(event).send().await?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(Error::Hook(format!("server returned status {}", status)));
        }
        Ok(())
    }

    async fn deliver(&self, event: Event) {
        let wire = event.to_wire();
        let name = format!("post {}", wire.event_type);
        // Outcome is logged by the wrapper; delivery is best-effort
        let _ = execute_hook_with_resilience(&self.guard, &name, || self.post(&wire)).await;
    }
}

#[async_trait]
impl EventEmitter for EventClient {
    async fn run_started(&self, run_id: &str, task: &str) {
        self.deliver(Event::new(run_id, EventKind::RunStarted { task: task.to_string() }))
            .await;
    }

    async fn run_finished(&self, run_id: &str, task: &str) {
        self.deliver(Event::new(run_id, EventKind::RunFinished { task: task.to_string() }))
            .await;
    }

    async fn run_error(&self, run_id: &str, task: &str, error: &str) {
        self.deliver(Event::new(
            run_id,
            EventKind::RunError {
                task: task.to_string(),
                error: error.to_string(),
            },
        ))
        .await;
    }

    async fn state_snapshot(&self, run_id: &str, state: &WorkflowState) {
        self.deliver(Event::new(run_id, EventKind::StateSnapshot { state: state.clone() }))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::BreakerState;
    use std::time::Instant;

    fn unreachable_client(threshold: u32) -> EventClient {
        // Port 9 on loopback refuses connections
        EventClient::new("http://127.0.0.1:9/events")
            .unwrap()
            .with_guard(Arc::new(HookGuard::new(
                CircuitBreaker::new(threshold, Duration::from_secs(60)),
                Duration::from_secs(5),
            )))
    }

    #[tokio::test]
    async fn test_post_to_dead_endpoint_fails_after_retries() {
        let client = unreachable_client(5);
        let event = Event::new("run", EventKind::RunStarted { task: "t".to_string() }).to_wire();

        let err = client.post(&event).await.unwrap_err();
        assert!(err.to_string().contains("failed after 3 attempts"));
    }

    #[tokio::test]
    async fn test_hanging_endpoint_is_bounded() {
        // accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = EventClient::new(format!("http://{}/events", addr)).unwrap();

        let start = Instant::now();
        client.run_started("run", "task").await;
        assert!(start.elapsed() < POST_TIMEOUT + Duration::from_secs(1));
        assert_eq!(client.guard.breaker().failure_count(), 1);
    }

    #[tokio::test]
    async fn test_dead_endpoint_never_fails_the_caller() {
        let client = unreachable_client(1);

        client.run_started("run", "task").await;
        assert_eq!(client.guard.breaker().state(), BreakerState::Open);

        // circuit is open, later events are skipped without network access
        let start = Instant::now();
        client.run_finished("run", "task").await;
        client.run_error("run", "task", "boom").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
