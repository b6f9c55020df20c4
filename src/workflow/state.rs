//! Workflow state persistence
//!
//! The state file is the only channel between the engine and the agent:
//! - The engine writes a seed state before the first invocation
//! - The agent rewrites it at the end of every step
//! - The engine deletes it once the agent reports completion

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::debug;

use crate::{Error, Result};

/// Prompt that asks the agent to draft a plan; `{{TASK}}` is replaced
pub const PLAN_PROMPT: &str = include_str!("../../prompts/plan.md");

/// Prompt prefix for starting work directly
pub const START_PROMPT: &str = "/start";

/// Prompt for picking up where the agent left off
pub const CONTINUE_PROMPT: &str = "/continue";

/// Description written into the seed state
pub const SEED_DESCRIPTION: &str = "Initializing workflow for task";

/// Step status reported by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Completed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Running => "running",
            Status::Completed => "completed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Status::Running),
            "completed" => Ok(Status::Completed),
            _ => Err(Error::InvalidState(
                "status must be 'running' or 'completed'".to_string(),
            )),
        }
    }
}

/// Contents of the state file
///
/// `status` stays a plain string on the wire: the agent is an untrusted
/// writer, and a bad value has to surface through [`WorkflowState::validate`]
/// rather than as a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    #[serde(default)]
    pub current_step_description: String,
    #[serde(default)]
    pub next_step_prompt: String,
    #[serde(default)]
    pub status: String,
}

impl WorkflowState {
    /// Create a new state
    pub fn new(description: impl Into<String>, prompt: impl Into<String>, status: Status) -> Self {
        Self {
            current_step_description: description.into(),
            next_step_prompt: prompt.into(),
            status: status.as_str().to_string(),
        }
    }

    /// Seed state written before the first invocation
    pub fn seed(prompt: impl Into<String>) -> Self {
        Self::new(SEED_DESCRIPTION, prompt, Status::Running)
    }

    /// Seed prompt for a task, either the plan template or a direct start
    pub fn seed_prompt(task: &str, with_plan: bool) -> String {
        if with_plan {
            PLAN_PROMPT.replace("{{TASK}}", task)
        } else if task.is_empty() {
            START_PROMPT.to_string()
        } else {
            format!("{} {}", START_PROMPT, task)
        }
    }

    /// Check the state invariants
    pub fn validate(&self) -> Result<()> {
        if self.current_step_description.is_empty() {
            return Err(Error::InvalidState(
                "current_step_description cannot be empty".to_string(),
            ));
        }

        if self.status.is_empty() {
            return Err(Error::InvalidState("status cannot be empty".to_string()));
        }

        let status: Status = self.status.parse()?;

        if status == Status::Running && self.next_step_prompt.is_empty() {
            return Err(Error::InvalidState(
                "next_step_prompt cannot be empty when status is 'running'".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether the agent reported completion (case-insensitive)
    pub fn is_completed(&self) -> bool {
        self.status.eq_ignore_ascii_case(Status::Completed.as_str())
    }
}

/// Loads and saves one state file under a lock
///
/// Clones share the lock, so every handle onto the same file is serialized.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl StateStore {
    /// Create a store with its own lock
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_lock(path, Arc::new(Mutex::new(())))
    }

    /// Create a store that shares an existing lock
    pub fn with_lock(path: impl Into<PathBuf>, lock: Arc<Mutex<()>>) -> Self {
        Self {
            path: path.into(),
            lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A store for another file that shares this store's lock
    pub fn relocate(&self, path: impl Into<PathBuf>) -> Self {
        Self::with_lock(path, Arc::clone(&self.lock))
    }

    /// Load the state; a missing file yields an empty state
    pub fn load(&self) -> Result<WorkflowState> {
        let _guard = self.guard();

        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(WorkflowState::default());
            }
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(serde_json::from_str(&content)?)
    }

    /// Save the state as indented JSON with a trailing newline
    pub fn save(&self, state: &WorkflowState) -> Result<()> {
        let _guard = self.guard();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut content = serde_json::to_string_pretty(state)?;
        content.push('\n');
        std::fs::write(&self.path, content)?;

        debug!("Saved state to {}", self.path.display());
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Delete the state file; already gone is not an error
    pub fn remove(&self) -> Result<()> {
        let _guard = self.guard();

        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Modification time of the state file
    pub fn modified(&self) -> std::io::Result<SystemTime> {
        std::fs::metadata(&self.path)?.modified()
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // The lock protects no data, so a poisoned guard is still usable
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}
