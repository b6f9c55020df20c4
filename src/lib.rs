//! Cadence: step-by-step orchestration of an external coding agent
//!
//! The agent is invoked once per step with a prompt. Between invocations it
//! reports what it did, and what it wants to do next, by rewriting a small
//! JSON state file. Cadence watches that file, feeds the next prompt back in
//! and streams progress to any number of live observers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Workflow Engine              │
//! │  seed state → execute → await update    │
//! └──────┬──────────────┬───────────────┬───┘
//!        ▼              ▼               ▼
//! ┌────────────┐ ┌─────────────┐ ┌─────────────┐
//! │ State Store│ │ Agent       │ │ Event Hub   │
//! │ (JSON file)│ │ subprocess  │ │ subscribers │
//! └────────────┘ └──────┬──────┘ └─────────────┘
//!                       ▼
//!        progress monitor · resilient hooks
//! ```

use std::time::Duration;

pub mod config;
pub mod events;
pub mod harness;
pub mod hooks;
pub mod monitor;
pub mod signals;
pub mod workflow;
pub mod workspace;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use config::Config;
pub use events::{Event, EventEmitter, EventHub, Streamer, WorkflowEvent};
pub use harness::{ClaudeExecutor, ExecuteConfig, Executor, OutputMode};
pub use hooks::{execute_hook_with_resilience, CircuitBreaker, HookGuard};
pub use monitor::ProgressMonitor;
pub use workflow::{Engine, EngineOptions, Run, RunStatus, StateStore, WorkflowState};
pub use workspace::{GitWorktreeManager, Workspace, WorkspaceManager};

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Agent executable not found: {0}")]
    AgentNotFound(String),

    #[error("Agent exited with code {code}: {stderr}")]
    AgentExit { code: i32, stderr: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Exceeded maximum iterations ({0})")]
    MaxIterations(usize),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Hook error: {0}")]
    Hook(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// True when the caller stopped the operation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True when a deadline passed
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
