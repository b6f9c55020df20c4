//! Run records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::{Error, Result};

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Error,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// Terminal status for a run that stopped with `err`
    pub fn for_error(err: &Error) -> Self {
        if err.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Error
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::Error => write!(f, "error"),
        }
    }
}

/// One end-to-end orchestration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub agent_id: String,
    pub status: RunStatus,
    pub task: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_dir: Option<PathBuf>,
}

impl Run {
    pub fn new(task: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            status: RunStatus::Running,
            task: task.into(),
            created: now,
            updated: now,
            worktree_dir: None,
        }
    }

    /// Only a running run may move, and only to a terminal status
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        self.status == RunStatus::Running && next.is_terminal()
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "cannot move run {} from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated = Utc::now();
        Ok(())
    }
}
