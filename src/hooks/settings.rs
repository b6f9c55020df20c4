//! Agent-side hook wiring
//!
//! The agent runs its own hook commands around every tool use. We point
//! those hooks at a helper command through a local settings file and pass
//! telemetry coordinates through the environment.

use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::Result;

pub const ENV_EVENTS_ENDPOINT: &str = "CADENCE_EVENTS_ENDPOINT";
pub const ENV_RUN_ID: &str = "CADENCE_RUN_ID";
pub const ENV_BATCH_SIZE: &str = "CADENCE_TOOL_CALL_BATCH_SIZE";
pub const ENV_SAMPLE_RATE: &str = "CADENCE_TOOL_CALL_SAMPLE_RATE";
pub const ENV_TODO_FILE: &str = "CADENCE_TODO_FILE";

/// Where hook helpers should report tool calls
#[derive(Debug, Clone)]
pub struct HookTelemetry {
    pub endpoint: String,
    pub run_id: String,
    pub batch_size: usize,
    pub sample_rate: u8,
}

/// Environment variables handed to the agent for its hooks
pub fn hook_env(telemetry: Option<&HookTelemetry>, todo_file: Option<&Path>) -> Vec<(String, String)> {
    let mut env = Vec::new();

    if let Some(t) = telemetry {
        if !t.endpoint.is_empty() && !t.run_id.is_empty() {
            env.push((ENV_EVENTS_ENDPOINT.to_string(), t.endpoint.clone()));
            env.push((ENV_RUN_ID.to_string(), t.run_id.clone()));
            env.push((ENV_BATCH_SIZE.to_string(), t.batch_size.to_string()));
            env.push((ENV_SAMPLE_RATE.to_string(), t.sample_rate.to_string()));
        }
    }

    if let Some(path) = todo_file {
        env.push((ENV_TODO_FILE.to_string(), path.display().to_string()));
    }

    env
}

/// A settings file registering a hook command; removed on drop
#[derive(Debug)]
pub struct HookInstall {
    settings_path: PathBuf,
}

impl HookInstall {
    /// Write `.claude/settings.local.json` under `workdir`
    pub fn install(workdir: &Path, command: &Path) -> Result<Self> {
        let dir = workdir.join(".claude");
        std::fs::create_dir_all(&dir)?;

        let settings_path = dir.join("settings.local.json");
        let mut content = serde_json::to_string_pretty(&settings_json(command))?;
        content.push('\n');
        std::fs::write(&settings_path, content)?;

        debug!("Installed agent hooks at {}", settings_path.display());
        Ok(Self { settings_path })
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }
}

impl Drop for HookInstall {
    fn drop(&mut self) {
        // The .claude directory itself may hold user settings; leave it
        if let Err(e) = std::fs::remove_file(&self.settings_path) {
            debug!(
                "Could not remove hook settings {}: {}",
                self.settings_path.display(),
                e
            );
        }
    }
}

fn settings_json(command: &Path) -> serde_json::Value {
    let matcher = json!([{
        "matcher": ".*",
        "hooks": [{
            "type": "command",
            "command": command.display().to_string(),
        }],
    }]);

    json!({
        "hooks": {
            "PreToolUse": matcher.clone(),
            "PostToolUse": matcher,
        }
    })
}
