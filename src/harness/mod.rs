//! Agent process adapter
//!
//! Runs the external coding agent once per step. The adapter:
//! - Builds a reproducible argument list and environment ([`build_invocation`])
//! - Spawns the agent, draining stdout and stderr concurrently
//! - Races the process against a timeout and a cancellation token
//!
//! What happens to the output is fixed when the executor is built, see
//! [`OutputMode`].

mod claude_code;
mod invocation;
mod stream_writer;
mod tool_log;

pub use claude_code::ClaudeExecutor;
pub use invocation::{build_invocation, Invocation};
pub use stream_writer::StreamWriter;
pub use tool_log::ToolLog;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::events::Streamer;
use crate::Result;

/// Tools the agent may use when none are configured
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "mcp__context7__*",
    "Bash",
    "Read",
    "Write",
    "Edit",
    "Remove",
    "TodoWrite",
    "Task",
];

/// System prompt appended when none is configured
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert software engineer with deep knowledge of TDD, Python, Typescript. Execute the following tasks with surgical precision while taking care not to overengineer solutions.";

/// Invocation timeout when neither the call nor the executor sets one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Everything needed to run one step
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
    /// Prompt for this step (required)
    pub prompt: String,
    /// State file the agent is expected to update (required)
    pub state_file: PathBuf,
    /// Output format flag passed to the agent
    pub output_format: String,
    pub mcp_servers: Vec<String>,
    /// Empty means [`DEFAULT_ALLOWED_TOOLS`]
    pub allowed_tools: Vec<String>,
    pub system_prompt: Option<String>,
    pub timeout: Option<Duration>,
    pub additional_args: Vec<String>,
    /// Extra environment, merged over the inherited one
    pub env: BTreeMap<String, String>,
    /// Preferred working directory
    pub workdir: Option<PathBuf>,
    /// Run the output belongs to, for streamed events
    pub run_id: Option<String>,
}

impl ExecuteConfig {
    pub fn new(prompt: impl Into<String>, state_file: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            state_file: state_file.into(),
            output_format: "text".to_string(),
            mcp_servers: Vec::new(),
            allowed_tools: Vec::new(),
            system_prompt: None,
            timeout: None,
            additional_args: Vec::new(),
            env: BTreeMap::new(),
            workdir: None,
            run_id: None,
        }
    }
}

/// How agent output is handled
#[derive(Clone)]
pub enum OutputMode {
    /// Capture stdout and stderr, return them together
    Combined,
    /// Capture stdout; stderr lines go to the tool log as they arrive
    ToolLog(Arc<ToolLog>),
    /// Like `ToolLog`, and stdout is also streamed as text-message events
    Streaming {
        streamer: Arc<dyn Streamer>,
        tool_log: Arc<ToolLog>,
    },
}

impl OutputMode {
    pub fn tool_log(&self) -> Option<&Arc<ToolLog>> {
        match self {
            OutputMode::Combined => None,
            OutputMode::ToolLog(log) => Some(log),
            OutputMode::Streaming { tool_log, .. } => Some(tool_log),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, OutputMode::Streaming { .. })
    }
}

impl std::fmt::Debug for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputMode::Combined => write!(f, "Combined"),
            OutputMode::ToolLog(_) => write!(f, "ToolLog"),
            OutputMode::Streaming { .. } => write!(f, "Streaming"),
        }
    }
}

/// Runs the agent for one step and returns its captured output
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, config: &ExecuteConfig, cancel: &CancellationToken) -> Result<String>;
}
