//! The workflow engine
//!
//! One run goes through these phases:
//! 1. Create the workspace, if one was requested
//! 2. Seed the state file (or pick up an existing one)
//! 3. Iterate: load state, stop if completed, otherwise run the agent with
//!    the state's next prompt and wait for it to publish a new state
//! 4. Clean up and emit exactly one terminal event

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::run::{Run, RunStatus};
use super::state::{StateStore, WorkflowState, CONTINUE_PROMPT, START_PROMPT};
use super::sync::{wait_for_state_update, POLL_INTERVAL};
use crate::config::Config;
use crate::events::{EventEmitter, NoopEmitter};
use crate::harness::{ExecuteConfig, Executor};
use crate::hooks::{hook_env, HookInstall, HookTelemetry};
use crate::monitor::ProgressMonitor;
use crate::workspace::{self, Workspace, WorkspaceManager};
use crate::{Error, Result};

/// Agent identifier recorded on runs
pub const AGENT_ID: &str = "claude";

/// How long a cancelled step may take to stop its agent
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Per-run options
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Task description; empty selects bare mode when nothing else is asked for
    pub task: String,
    /// Seed with the plan prompt instead of a direct start
    pub with_plan: bool,
    /// Run inside a fresh workspace
    pub use_workspace: bool,
    /// Resume from the existing state file without seeding
    pub continue_run: bool,
    /// Agent invocations before giving up (0 = unbounded)
    pub max_iterations: usize,
    pub poll_interval: Duration,
    /// Bound on each wait for a new state
    pub state_wait_timeout: Option<Duration>,
    /// Delete the state file once the agent reports completion
    pub remove_state_on_completion: bool,
    pub cleanup_workspace: bool,
    /// Agent working directory when no workspace is used
    pub workdir: Option<PathBuf>,
    /// Side-channel progress file, relative paths resolve in the workspace
    pub progress_file: Option<PathBuf>,
    pub show_progress: bool,
    /// Hook command registered with the agent for the run
    pub hook_command: Option<PathBuf>,
    /// Where the agent's hooks should report tool calls
    pub events_endpoint: Option<String>,
    pub tool_call_batch_size: usize,
    pub tool_call_sample_rate: u8,
    pub mcp_servers: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub system_prompt: Option<String>,
    pub agent_timeout: Option<Duration>,
    pub extra_args: Vec<String>,
    /// Extra environment for every invocation
    pub env: BTreeMap<String, String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            task: String::new(),
            with_plan: false,
            use_workspace: false,
            continue_run: false,
            max_iterations: 50,
            poll_interval: POLL_INTERVAL,
            state_wait_timeout: None,
            remove_state_on_completion: true,
            cleanup_workspace: true,
            workdir: None,
            progress_file: None,
            show_progress: true,
            hook_command: None,
            events_endpoint: None,
            tool_call_batch_size: 10,
            tool_call_sample_rate: 100,
            mcp_servers: Vec::new(),
            allowed_tools: Vec::new(),
            system_prompt: None,
            agent_timeout: None,
            extra_args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &Config, task: impl Into<String>) -> Self {
        let tool_calls = &config.events.tool_calls;

        Self {
            task: task.into(),
            with_plan: true,
            use_workspace: config.git.enabled,
            continue_run: false,
            max_iterations: config.workflow.max_iterations,
            poll_interval: config.workflow.poll_interval,
            state_wait_timeout: None,
            remove_state_on_completion: config.workflow.auto_cleanup,
            cleanup_workspace: config.git.auto_cleanup,
            workdir: config.workflow.workdir.clone(),
            progress_file: config.workflow.progress_file.clone(),
            show_progress: config.workflow.show_todo_updates,
            hook_command: config.agent.hook_command.clone(),
            events_endpoint: config
                .events
                .endpoint
                .clone()
                .filter(|_| tool_calls.enabled),
            tool_call_batch_size: tool_calls.batch_size,
            tool_call_sample_rate: tool_calls.sample_rate,
            mcp_servers: config.agent.mcp_servers.clone(),
            allowed_tools: config.agent.allowed_tools.clone(),
            system_prompt: config.agent.system_prompt.clone(),
            agent_timeout: Some(config.agent.timeout),
            extra_args: config.agent.extra_args.clone(),
            env: BTreeMap::new(),
        }
    }

    /// No task, no plan, no workspace
    pub fn is_bare(&self) -> bool {
        self.task.trim().is_empty() && !self.with_plan && !self.use_workspace
    }
}

/// Drives runs of the agent against one state file
pub struct Engine {
    executor: Arc<dyn Executor>,
    store: StateStore,
    emitter: Arc<dyn EventEmitter>,
    workspaces: Option<Arc<dyn WorkspaceManager>>,
}

impl Engine {
    /// A relative state-file path is resolved inside the run's workspace
    pub fn new(executor: Arc<dyn Executor>, store: StateStore) -> Self {
        Self {
            executor,
            store,
            emitter: Arc::new(NoopEmitter),
            workspaces: None,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_workspaces(mut self, manager: Arc<dyn WorkspaceManager>) -> Self {
        self.workspaces = Some(manager);
        self
    }

    /// Start a new run and drive it to the end
    pub async fn run(&self, options: &EngineOptions, cancel: &CancellationToken) -> Result<Run> {
        let mut run = Run::new(options.task.clone(), AGENT_ID);
        self.run_with(&mut run, options, cancel).await?;
        Ok(run)
    }

    /// Drive a caller-owned run
    ///
    /// `run` is left in a terminal status whatever the outcome.
    pub async fn run_with(
        &self,
        run: &mut Run,
        options: &EngineOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!("Starting run {} for task: {}", run.id, display_task(&run.task));
        self.emitter.run_started(&run.id, &run.task).await;

        let result = self.execute_run(run, options, cancel).await;

        let status = match &result {
            Ok(()) => {
                info!("Run {} completed", run.id);
                self.emitter.run_finished(&run.id, &run.task).await;
                RunStatus::Completed
            }
            Err(e) => {
                if e.is_cancelled() {
                    warn!("Run {} cancelled", run.id);
                } else {
                    error!("Run {} failed: {}", run.id, e);
                }
                self.emitter.run_error(&run.id, &run.task, &e.to_string()).await;
                RunStatus::for_error(e)
            }
        };

        if run.can_transition_to(status) {
            run.transition(status)?;
        }
        result
    }

    async fn execute_run(
        &self,
        run: &mut Run,
        options: &EngineOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !options.is_bare() && !options.continue_run && options.task.trim().is_empty() {
            return Err(Error::Config("task description cannot be empty".to_string()));
        }

        let workspace = match (&self.workspaces, options.use_workspace && !options.is_bare()) {
            (Some(manager), true) => {
                let ws = manager.create(&options.task).await?;
                run.worktree_dir = Some(ws.path.clone());
                Some(ws)
            }
            (None, true) => {
                warn!("Workspace requested but none can be created, running in place");
                None
            }
            _ => None,
        };

        let result = self.iterate(run, options, workspace.as_ref(), cancel).await;

        if let (Some(ws), Some(manager)) = (&workspace, &self.workspaces) {
            if options.cleanup_workspace {
                match manager.cleanup(ws).await {
                    Ok(()) => info!("Cleaned up workspace {}", ws.path.display()),
                    Err(e) => warn!("Failed to clean up workspace {}: {}", ws.path.display(), e),
                }
            } else {
                info!("Workspace kept at {} on branch {}", ws.path.display(), ws.branch);
            }
        }

        result
    }

    async fn iterate(
        &self,
        run: &mut Run,
        options: &EngineOptions,
        workspace: Option<&Workspace>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let store = self
            .store
            .relocate(workspace::within(workspace, self.store.path()));
        let workdir = workspace
            .map(|ws| ws.path.clone())
            .or_else(|| options.workdir.clone());

        initialize(&store, options)?;

        let _hooks = options
            .hook_command
            .as_deref()
            .and_then(|command| install_hooks(workdir.as_deref(), command));

        let progress_file = options
            .progress_file
            .as_deref()
            .map(|p| workspace::within(workspace, p));

        let monitor_cancel = cancel.child_token();
        let _stop_monitor = monitor_cancel.clone().drop_guard();
        let mut progress = progress_file.as_ref().map(|path| {
            let (rx, _handle) = ProgressMonitor::new(path)
                .with_interval(options.poll_interval)
                .spawn(monitor_cancel.clone());
            rx
        });

        let env = step_env(options, &run.id, progress_file.as_deref());
        let mut iterations = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let state = store.load()?;
            if state.is_completed() {
                info!("Workflow completed: {}", state.current_step_description);
                if options.remove_state_on_completion {
                    if let Err(e) = store.remove() {
                        warn!("Failed to remove state file {}: {}", store.path().display(), e);
                    }
                }
                return Ok(());
            }

            if options.max_iterations > 0 && iterations >= options.max_iterations {
                return Err(Error::MaxIterations(options.max_iterations));
            }
            iterations += 1;

            state.validate()?;
            self.emitter.state_snapshot(&run.id, &state).await;

            info!("=== Iteration {} ===", iterations);
            info!("Step: {}", state.current_step_description);

            let mut config = ExecuteConfig::new(state.next_step_prompt.clone(), store.path());
            config.mcp_servers = options.mcp_servers.clone();
            config.allowed_tools = options.allowed_tools.clone();
            config.system_prompt = options.system_prompt.clone();
            config.timeout = options.agent_timeout;
            config.additional_args = options.extra_args.clone();
            config.env = env.clone();
            config.workdir = workdir.clone();
            config.run_id = Some(run.id.clone());

            self.execute_step(&config, &mut progress, options.show_progress, cancel)
                .await?;

            match wait_for_state_update(
                &store,
                &state,
                options.poll_interval,
                options.state_wait_timeout,
                cancel,
            )
            .await
            {
                Ok(next) => debug!("Agent published step: {}", next.current_step_description),
                Err(e) => {
                    // giving up on the agent is a cancellation, not a failure
                    if e.is_timeout() {
                        run.transition(RunStatus::Cancelled)?;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Run the agent once while relaying progress updates
    async fn execute_step(
        &self,
        config: &ExecuteConfig,
        progress: &mut Option<mpsc::Receiver<String>>,
        show_progress: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let step = self.executor.execute(config, cancel);
        tokio::pin!(step);

        loop {
            let update = tokio::select! {
                result = &mut step => return result.map(|_| ()),
                update = next_update(progress) => update,
                _ = cancel.cancelled() => {
                    // let the executor stop its process before unwinding
                    if tokio::time::timeout(CANCEL_GRACE, &mut step).await.is_err() {
                        warn!("Agent did not stop within {:?} of cancellation", CANCEL_GRACE);
                    }
                    return Err(Error::Cancelled);
                }
            };

            match update {
                Some(text) if show_progress && !text.is_empty() => info!("▸ {}", text),
                Some(_) => {}
                // monitor stopped
                None => *progress = None,
            }
        }
    }
}

/// Seed the state file, or check there is one to resume
fn initialize(store: &StateStore, options: &EngineOptions) -> Result<()> {
    if options.continue_run {
        if store.exists() {
            info!("Continuing from existing state at {}", store.path().display());
            return Ok(());
        }
        info!("No state to continue from, starting with {}", CONTINUE_PROMPT);
        return store.save(&WorkflowState::seed(CONTINUE_PROMPT));
    }

    if options.is_bare() {
        if store.exists() {
            info!("Continuing from existing state at {}", store.path().display());
            return Ok(());
        }
        info!("Starting bare execution with {}", START_PROMPT);
        return store.save(&WorkflowState::seed(START_PROMPT));
    }

    let prompt = WorkflowState::seed_prompt(&options.task, options.with_plan);
    debug!("Seeding state at {}", store.path().display());
    store.save(&WorkflowState::seed(prompt))
}

/// Environment shared by every invocation of a run
fn step_env(options: &EngineOptions, run_id: &str, progress_file: Option<&Path>) -> BTreeMap<String, String> {
    let telemetry = options.events_endpoint.as_ref().map(|endpoint| HookTelemetry {
        endpoint: endpoint.clone(),
        run_id: run_id.to_string(),
        batch_size: options.tool_call_batch_size,
        sample_rate: options.tool_call_sample_rate,
    });

    let mut env = options.env.clone();
    env.extend(hook_env(telemetry.as_ref(), progress_file));
    env
}

/// Hooks are optional; a failed install only costs telemetry
fn install_hooks(workdir: Option<&Path>, command: &Path) -> Option<HookInstall> {
    let dir = match workdir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().ok()?,
    };

    match HookInstall::install(&dir, command) {
        Ok(install) => Some(install),
        Err(e) => {
            warn!("Could not install agent hooks in {}: {}", dir.display(), e);
            None
        }
    }
}

/// Next progress update, or pending forever without a monitor
async fn next_update(progress: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match progress {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn display_task(task: &str) -> &str {
    if task.is_empty() {
        "(bare)"
    } else {
        task
    }
}
