//! Argument and environment construction

use crate::harness::{ExecuteConfig, DEFAULT_ALLOWED_TOOLS, DEFAULT_SYSTEM_PROMPT};
use crate::{Error, Result};

/// A fully resolved agent command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Extra variables, sorted by name
    pub env: Vec<(String, String)>,
}

/// Map a step configuration to a command line
///
/// Same input, same output: nothing here reads the clock, the environment
/// or the filesystem.
pub fn build_invocation(program: &str, config: &ExecuteConfig) -> Result<Invocation> {
    if config.prompt.is_empty() {
        return Err(Error::Config("prompt is required".to_string()));
    }
    if config.state_file.as_os_str().is_empty() {
        return Err(Error::Config("state file is required".to_string()));
    }

    let mut args = vec!["--output-format".to_string(), config.output_format.clone()];

    for server in &config.mcp_servers {
        args.push("--mcp-server".to_string());
        args.push(server.clone());
    }

    args.push("--allowedTools".to_string());
    if config.allowed_tools.is_empty() {
        args.extend(DEFAULT_ALLOWED_TOOLS.iter().map(|t| t.to_string()));
    } else {
        args.extend(config.allowed_tools.iter().cloned());
    }

    args.push("--append-system-prompt".to_string());
    args.push(
        config
            .system_prompt
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
    );

    args.extend(config.additional_args.iter().cloned());

    // Prompt goes last
    args.push("-p".to_string());
    args.push(config.prompt.clone());

    let env = config
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(Invocation {
        program: program.to_string(),
        args,
        env,
    })
}
