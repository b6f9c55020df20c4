//! Configuration loading and management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Agent process settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Workflow loop settings
    #[serde(default)]
    pub workflow: WorkflowSettings,

    /// Git worktree isolation
    #[serde(default)]
    pub git: GitConfig,

    /// Event distribution
    #[serde(default)]
    pub events: EventsConfig,
}

impl Config {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            // Try .cadence/config.toml in current directory
            let local = PathBuf::from(".cadence/config.toml");
            if local.exists() {
                return Some(local);
            }

            // Try ~/.cadence/config.toml
            dirs::home_dir().map(|h| h.join(".cadence/config.toml"))
        });

        let mut config = match config_path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                toml::from_str(&content)?
            }
            _ => Config::default(),
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or break a run
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("agent.timeout", self.agent.timeout),
            ("workflow.poll_interval", self.workflow.poll_interval),
            ("events.tool_calls.flush_interval", self.events.tool_calls.flush_interval),
        ];
        for (key, value) in nonzero {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be greater than zero", key)));
            }
        }

        let tool_calls = &self.events.tool_calls;
        if tool_calls.batch_size == 0 {
            return Err(Error::Config(
                "events.tool_calls.batch_size must be greater than zero".to_string(),
            ));
        }
        if !(1..=100).contains(&tool_calls.sample_rate) {
            return Err(Error::Config(format!(
                "events.tool_calls.sample_rate must be between 1 and 100, got {}",
                tool_calls.sample_rate
            )));
        }
        if tool_calls.rate_limit == Some(0) {
            return Err(Error::Config(
                "events.tool_calls.rate_limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `CADENCE_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("CADENCE_WORKDIR") {
            let dir = PathBuf::from(expand(&dir)?);
            if !dir.is_absolute() {
                return Err(Error::Config(format!(
                    "CADENCE_WORKDIR must be an absolute path, got {}",
                    dir.display()
                )));
            }
            self.workflow.workdir = Some(dir);
        }

        if let Some(file) = lookup("CADENCE_STATE_FILE") {
            self.workflow.state_file = PathBuf::from(expand(&file)?);
        }

        if let Some(v) = lookup("CADENCE_SHOW_OUTPUT") {
            self.workflow.show_output = parse_bool("CADENCE_SHOW_OUTPUT", &v)?;
        }
        if let Some(v) = lookup("CADENCE_SHOW_TODO_UPDATES") {
            self.workflow.show_todo_updates = parse_bool("CADENCE_SHOW_TODO_UPDATES", &v)?;
        }
        if let Some(v) = lookup("CADENCE_SHOW_TOOL_UPDATES") {
            self.workflow.show_tool_updates = parse_bool("CADENCE_SHOW_TOOL_UPDATES", &v)?;
        }
        if let Some(v) = lookup("CADENCE_AUTO_CLEANUP") {
            self.workflow.auto_cleanup = parse_bool("CADENCE_AUTO_CLEANUP", &v)?;
        }
        if let Some(v) = lookup("CADENCE_MAX_ITERATIONS") {
            self.workflow.max_iterations = v.trim().parse().map_err(|_| {
                Error::Config(format!("CADENCE_MAX_ITERATIONS must be a number, got {:?}", v))
            })?;
        }

        if let Some(v) = lookup("CADENCE_GIT_ENABLED") {
            self.git.enabled = parse_bool("CADENCE_GIT_ENABLED", &v)?;
        }
        if let Some(v) = lookup("CADENCE_GIT_BASE_BRANCH") {
            if !v.trim().is_empty() {
                self.git.base_branch = v.trim().to_string();
            }
        }
        if let Some(v) = lookup("CADENCE_GIT_AUTO_CLEANUP") {
            self.git.auto_cleanup = parse_bool("CADENCE_GIT_AUTO_CLEANUP", &v)?;
        }

        let tool_calls = &mut self.events.tool_calls;
        if let Some(v) = lookup("CADENCE_TOOL_CALL_EVENTS_ENABLED") {
            tool_calls.enabled = parse_bool("CADENCE_TOOL_CALL_EVENTS_ENABLED", &v)?;
        }
        if let Some(v) = lookup("CADENCE_TOOL_CALL_BATCH_SIZE") {
            tool_calls.batch_size = match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(Error::Config(format!(
                        "CADENCE_TOOL_CALL_BATCH_SIZE must be a positive number, got {:?}",
                        v
                    )))
                }
            };
        }
        if let Some(v) = lookup("CADENCE_TOOL_CALL_RATE_LIMIT") {
            tool_calls.rate_limit = match v.trim().parse::<u32>() {
                Ok(n) if n > 0 => Some(n),
                _ => {
                    return Err(Error::Config(format!(
                        "CADENCE_TOOL_CALL_RATE_LIMIT must be a positive number, got {:?}",
                        v
                    )))
                }
            };
        }
        if let Some(v) = lookup("CADENCE_TOOL_CALL_SAMPLE_RATE") {
            tool_calls.sample_rate = match v.trim().parse::<u8>() {
                Ok(n) if (1..=100).contains(&n) => n,
                _ => {
                    return Err(Error::Config(format!(
                        "CADENCE_TOOL_CALL_SAMPLE_RATE must be between 1 and 100, got {:?}",
                        v
                    )))
                }
            };
        }

        Ok(())
    }
}

fn expand(raw: &str) -> Result<String> {
    shellexpand::full(raw)
        .map(|s| s.into_owned())
        .map_err(|e| Error::Config(format!("cannot expand {:?}: {}", raw, e)))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "{} must be a boolean, got {:?}",
            key, raw
        ))),
    }
}

/// Agent process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Path to the agent binary
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Hard limit for a single invocation
    #[serde(default = "default_timeout", with = "duration_str")]
    pub timeout: Duration,

    /// Override for the appended system prompt
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Tools the agent may use (empty = built-in list)
    #[serde(default)]
    pub allowed_tools: Vec<String>,

    /// Auxiliary MCP servers passed through to the agent
    #[serde(default)]
    pub mcp_servers: Vec<String>,

    /// Extra arguments appended before the prompt
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Command the agent runs around each tool use
    #[serde(default)]
    pub hook_command: Option<PathBuf>,
}

fn default_binary() -> String {
    "claude".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            timeout: default_timeout(),
            system_prompt: None,
            allowed_tools: Vec::new(),
            mcp_servers: Vec::new(),
            extra_args: Vec::new(),
            hook_command: None,
        }
    }
}

/// Workflow loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// State file shared with the agent
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Working directory for the agent (must be absolute)
    #[serde(default)]
    pub workdir: Option<PathBuf>,

    /// Side-channel file the agent's hooks write progress into
    #[serde(default)]
    pub progress_file: Option<PathBuf>,

    /// Iteration cap (0 = unbounded)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// State-file poll interval
    #[serde(default = "default_poll_interval", with = "duration_str")]
    pub poll_interval: Duration,

    /// Remove the state file once the run completes
    #[serde(default = "default_true")]
    pub auto_cleanup: bool,

    /// Forward agent stdout to the terminal
    #[serde(default = "default_true")]
    pub show_output: bool,

    /// Show progress monitor updates
    #[serde(default = "default_true")]
    pub show_todo_updates: bool,

    /// Show the rolling tool log
    #[serde(default = "default_true")]
    pub show_tool_updates: bool,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("agent_state/agent_state.json")
}

fn default_max_iterations() -> usize {
    50
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_true() -> bool {
    true
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            workdir: None,
            progress_file: None,
            max_iterations: default_max_iterations(),
            poll_interval: default_poll_interval(),
            auto_cleanup: true,
            show_output: true,
            show_todo_updates: true,
            show_tool_updates: true,
        }
    }
}

/// Git worktree configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Run each task in its own worktree
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Branch new worktrees start from
    #[serde(default = "default_base_branch")]
    pub base_branch: String,

    /// Remove the worktree when the run ends
    #[serde(default = "default_true")]
    pub auto_cleanup: bool,
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_branch: default_base_branch(),
            auto_cleanup: true,
        }
    }
}

/// Event hub and telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Per-subscriber channel capacity
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Subscriber limit for a single run
    #[serde(default = "default_max_clients")]
    pub max_clients_per_run: usize,

    /// Endpoint that receives lifecycle events over HTTP
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Tool-call telemetry
    #[serde(default)]
    pub tool_calls: ToolCallEventsConfig,
}

fn default_buffer_size() -> usize {
    100
}

fn default_max_clients() -> usize {
    100
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_clients_per_run: default_max_clients(),
            endpoint: None,
            tool_calls: ToolCallEventsConfig::default(),
        }
    }
}

/// Tool-call event batching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallEventsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Percentage of tool calls forwarded (1-100)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u8,

    /// Flush buffered events at least this often
    #[serde(default = "default_flush_interval", with = "duration_str")]
    pub flush_interval: Duration,

    /// Maximum batches delivered per second (unset = unlimited)
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

fn default_batch_size() -> usize {
    10
}

fn default_sample_rate() -> u8 {
    100
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for ToolCallEventsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: default_batch_size(),
            sample_rate: default_sample_rate(),
            flush_interval: default_flush_interval(),
            rate_limit: None,
        }
    }
}

/// Durations as human-readable strings ("30m", "500ms")
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Initialize .cadence directory
pub fn init() -> Result<PathBuf> {
    let cadence_dir = PathBuf::from(".cadence");

    if !cadence_dir.exists() {
        std::fs::create_dir_all(&cadence_dir)?;
    }

    // Create default config if it doesn't exist
    let config_path = cadence_dir.join("config.toml");
    if !config_path.exists() {
        let config_str = toml::to_string_pretty(&Config::default())
            .map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(&config_path, config_str)?;
    }

    Ok(config_path)
}
