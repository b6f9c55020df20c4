//! Progress monitor
//!
//! The agent's hooks write a one-line summary of the task in progress to a
//! side-channel file. The monitor polls that file and reports changes.

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::workflow::MIN_POLL_INTERVAL;

const UPDATE_CAPACITY: usize = 10;

/// Polls a progress file and emits its trimmed content when it changes
#[derive(Debug, Clone)]
pub struct ProgressMonitor {
    path: PathBuf,
    interval: Duration,
}

impl ProgressMonitor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interval: Duration::from_millis(500),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Start polling until `cancel` fires
    ///
    /// The receiver closes when the monitor stops.
    pub fn spawn(self, cancel: CancellationToken) -> (mpsc::Receiver<String>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(UPDATE_CAPACITY);
        let handle = tokio::spawn(self.run(tx, cancel));
        (rx, handle)
    }

    async fn run(self, tx: mpsc::Sender<String>, cancel: CancellationToken) {
        info!("Watching progress file {}", self.path.display());

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = String::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Progress monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let current = self.read_current().await;
                    if !publish(&tx, &mut last, current) {
                        return;
                    }
                }
            }
        }
    }

    async fn read_current(&self) -> String {
        tokio::fs::read_to_string(&self.path)
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }
}

/// Send `current` if it differs from the last update delivered
///
/// A full channel leaves `last` alone so the update is retried on the next
/// tick. Returns false once the receiver is gone.
fn publish(tx: &mpsc::Sender<String>, last: &mut String, current: String) -> bool {
    if current == *last {
        return true;
    }

    match tx.try_send(current.clone()) {
        Ok(()) => {
            *last = current;
            true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Progress update channel full, retrying next tick");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
