//! Cadence CLI
//!
//! Drives an external coding agent step by step through a shared state file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cadence::events::{BatchingConfig, BatchingEmitter, EventClient, Emitters, Subscription};
use cadence::harness::ToolLog;
use cadence::signals::{SignalHandler, INTERRUPTED_EXIT_CODE};
use cadence::workflow::{Run, AGENT_ID};
use cadence::{
    ClaudeExecutor, Config, Engine, EngineOptions, EventHub, GitWorktreeManager, OutputMode,
    StateStore,
};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about = "Step-by-step orchestration of a coding agent")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent on a task until it reports completion
    Run {
        /// Task description (omit for bare mode)
        task: Option<String>,

        /// Start directly instead of asking for a plan first
        #[arg(long)]
        no_plan: bool,

        /// Work in the current checkout instead of a fresh worktree
        #[arg(long)]
        no_worktree: bool,

        /// Resume from the existing state file
        #[arg(long = "continue")]
        continue_run: bool,

        /// Limit for a single agent invocation ("30m", "2h")
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,

        /// Maximum agent invocations (0 = unbounded)
        #[arg(long)]
        max_iterations: Option<usize>,

        /// Print the run's event stream as SSE frames
        #[arg(long)]
        stream: bool,

        /// Extra agent arguments, shell-quoted
        #[arg(long, allow_hyphen_values = true)]
        agent_args: Option<String>,
    },

    /// Check a state file against the state invariants
    ValidateState {
        /// State file (default: from configuration)
        path: Option<PathBuf>,
    },

    /// Show current configuration
    Config,

    /// Initialize .cadence directory
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for agent output and events
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Load config
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Run {
            task,
            no_plan,
            no_worktree,
            continue_run,
            timeout,
            max_iterations,
            stream,
            agent_args,
        } => {
            let mut options = EngineOptions::from_config(&config, task.unwrap_or_default());
            options.with_plan = !no_plan && !continue_run;
            options.use_workspace = config.git.enabled && !no_worktree && !continue_run;
            options.continue_run = continue_run;
            if let Some(t) = timeout {
                options.agent_timeout = Some(t);
            }
            if let Some(n) = max_iterations {
                options.max_iterations = n;
            }
            if let Some(raw) = agent_args {
                let args = shell_words::split(&raw).context("parsing --agent-args")?;
                options.extra_args.extend(args);
            }
            if options.task.trim().is_empty() && !continue_run {
                // no task means bare mode
                options.with_plan = false;
                options.use_workspace = false;
            }

            if let Err(e) = run_task(&config, options, stream).await {
                if e.is_cancelled() {
                    eprintln!("Run cancelled");
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
                return Err(e.into());
            }
        }

        Commands::ValidateState { path } => {
            let path = path.unwrap_or_else(|| config.workflow.state_file.clone());
            validate_state(&path)?;
        }

        Commands::Config => match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to serialize config: {}", e),
        },

        Commands::Init => {
            let path = cadence::config::init()?;
            info!("Initialized .cadence directory");
            println!("{}", path.display());
        }
    }

    Ok(())
}

async fn run_task(config: &Config, options: EngineOptions, stream: bool) -> cadence::Result<()> {
    let cancel = CancellationToken::new();
    SignalHandler::new(cancel.clone()).install()?;

    let hub = Arc::new(EventHub::new(
        config.events.buffer_size,
        config.events.max_clients_per_run,
    ));

    let mut emitters = Emitters::new().with(hub.clone());
    if let Some(endpoint) = &config.events.endpoint {
        info!("Posting run events to {}", endpoint);
        emitters = emitters.with(Arc::new(EventClient::new(endpoint.clone())?));
    }

    let tool_log = Arc::new(ToolLog::default());
    let mode = if stream {
        OutputMode::Streaming {
            streamer: hub.clone(),
            tool_log: tool_log.clone(),
        }
    } else if config.workflow.show_tool_updates {
        OutputMode::ToolLog(tool_log.clone())
    } else {
        OutputMode::Combined
    };

    let mut executor = ClaudeExecutor::from_config(&config.agent, mode)
        .with_echo(config.workflow.show_output && !stream);

    // Tool-call telemetry stops after the run so its last batch is flushed
    let telemetry_cancel = CancellationToken::new();
    let mut telemetry = None;
    if config.events.tool_calls.enabled {
        let batching = BatchingConfig::from_config(&config.events.tool_calls);
        let sink = hub.clone();
        let (batcher, handle) = BatchingEmitter::start(
            batching,
            move |batch| {
                for event in batch {
                    sink.broadcast(event);
                }
            },
            telemetry_cancel.clone(),
        );
        executor = executor.with_tool_calls(Arc::new(batcher));
        telemetry = Some(handle);
    }

    let mut engine = Engine::new(
        Arc::new(executor),
        StateStore::new(&config.workflow.state_file),
    )
    .with_emitter(Arc::new(emitters));

    if options.use_workspace {
        let repo = std::env::current_dir()?;
        engine = engine.with_workspaces(Arc::new(GitWorktreeManager::new(
            repo,
            config.git.base_branch.clone(),
        )));
    }

    let mut run = Run::new(options.task.clone(), AGENT_ID);
    let printer = if stream {
        let subscription = hub.subscribe(&run.id)?;
        Some((subscription.id, tokio::spawn(print_events(subscription))))
    } else {
        None
    };

    let result = engine.run_with(&mut run, &options, &cancel).await;

    telemetry_cancel.cancel();
    if let Some(handle) = telemetry {
        let _ = handle.await;
    }
    if let Some((id, handle)) = printer {
        hub.unsubscribe(&run.id, id);
        let _ = handle.await;
    }

    if config.workflow.show_tool_updates && result.is_err() {
        let recent = tool_log.entries();
        if !recent.is_empty() {
            warn!("Recent agent activity:");
            for line in recent {
                warn!("  {}", line);
            }
        }
    }

    info!("Run {} finished with status {}", run.id, run.status);
    if let Some(dir) = &run.worktree_dir {
        info!("Worktree: {}", dir.display());
    }
    result
}

/// Write each event to stdout as an SSE frame until the run ends
async fn print_events(mut subscription: Subscription) {
    while let Some(event) = subscription.receiver.recv().await {
        match event.to_wire().sse_frame() {
            Ok(frame) => print!("{}", frame),
            Err(e) => warn!("Could not encode {} event: {}", event.event_type(), e),
        }
        if event.is_terminal() {
            break;
        }
    }
}

fn validate_state(path: &Path) -> anyhow::Result<()> {
    let store = StateStore::new(path);
    if !store.exists() {
        anyhow::bail!("State file not found: {}", path.display());
    }

    let state = store
        .load()
        .with_context(|| format!("reading {}", path.display()))?;
    state.validate()?;

    println!("State file is valid: {}", path.display());
    println!("  status: {}", state.status);
    println!("  step:   {}", state.current_step_description);
    if !state.next_step_prompt.is_empty() {
        println!("  next:   {}", state.next_step_prompt);
    }
    Ok(())
}
