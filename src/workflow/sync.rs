//! Waiting for the agent to publish its next state
//!
//! After each invocation the agent is expected to have rewritten the state
//! file. A fast agent will already have done so, which the first check
//! catches; otherwise the file is polled. A tick only re-reads the file when
//! its modification time moved, and only a change in content ends the wait.

use std::time::{Duration, SystemTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::state::{StateStore, WorkflowState};
use crate::{Error, Result};

/// Default poll interval
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Shortest interval the poller will tick at
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Block until the state file differs from `previous`
///
/// Missing files and unreadable content are treated as a write in progress.
/// Other filesystem errors end the wait. `limit` bounds the whole wait.
pub async fn wait_for_state_update(
    store: &StateStore,
    previous: &WorkflowState,
    interval: Duration,
    limit: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<WorkflowState> {
    let poll = poll_for_change(store, previous, interval, cancel);

    match limit {
        Some(limit) => tokio::time::timeout(limit, poll)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        None => poll.await,
    }
}

async fn poll_for_change(
    store: &StateStore,
    previous: &WorkflowState,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<WorkflowState> {
    if let Some(current) = load_published(store) {
        if &current != previous {
            return Ok(current);
        }
    }

    let mut seen = modified(store)?;

    let mut ticker = tokio::time::interval(interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = ticker.tick() => {}
        }

        let Some(mtime) = modified(store)? else {
            continue;
        };
        if seen == Some(mtime) {
            continue;
        }

        match load_published(store) {
            Some(current) if &current != previous => {
                debug!("State file changed");
                return Ok(current);
            }
            Some(_) => {
                // touched, not rewritten
                seen = Some(mtime);
            }
            None => {}
        }
    }
}

/// The state on disk, or `None` while it is missing or half-written
fn load_published(store: &StateStore) -> Option<WorkflowState> {
    match store.load() {
        // a missing file loads as the empty state
        Ok(state) if state == WorkflowState::default() => None,
        Ok(state) => Some(state),
        Err(e) => {
            debug!("State file not readable yet: {}", e);
            None
        }
    }
}

/// Modification time, or `None` while the file is missing
fn modified(store: &StateStore) -> Result<Option<SystemTime>> {
    match store.modified() {
        Ok(t) => Ok(Some(t)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}
