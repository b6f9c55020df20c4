//! Claude Code executor
//!
//! Runs the Claude Code CLI in print mode for a single step. stdout and
//! stderr are read by two independent tasks and joined before returning, so
//! an agent that writes heavily to both never stalls on a full pipe.
//!
//! The timeout and the cancel token cover the whole invocation, including
//! draining output after exit: a background process left holding the pipes
//! open cannot keep a step alive. Readers are always finished before the
//! streamed message is closed.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{build_invocation, ExecuteConfig, Executor, OutputMode, StreamWriter, ToolLog, DEFAULT_TIMEOUT};
use crate::config::AgentConfig;
use crate::events::{ids, BatchingEmitter, Streamer};
use crate::{Error, Result};

/// Longest stderr excerpt carried in an exit error
const STDERR_EXCERPT: usize = 2000;

/// Executor for the `claude` CLI
pub struct ClaudeExecutor {
    /// Path to the agent binary
    binary: String,
    /// Timeout when the step config has none
    timeout: Duration,
    /// Output handling, fixed at construction
    mode: OutputMode,
    /// Echo agent stdout to our stdout
    echo: bool,
    /// Tool-call telemetry fed from stderr lines
    tool_calls: Option<Arc<BatchingEmitter>>,
}

impl ClaudeExecutor {
    pub fn new(binary: impl Into<String>, mode: OutputMode) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_TIMEOUT,
            mode,
            echo: false,
            tool_calls: None,
        }
    }

    /// Create from the `[agent]` config section
    pub fn from_config(config: &AgentConfig, mode: OutputMode) -> Self {
        Self::new(config.binary.clone(), mode).with_timeout(config.timeout)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_tool_calls(mut self, emitter: Arc<BatchingEmitter>) -> Self {
        self.tool_calls = Some(emitter);
        self
    }

    pub fn mode(&self) -> &OutputMode {
        &self.mode
    }

    fn spawn(&self, config: &ExecuteConfig) -> Result<Child> {
        let invocation = build_invocation(&self.binary, config)?;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = resolve_workdir(config.workdir.as_deref()) {
            cmd.current_dir(dir);
        }

        debug!("Spawning {} with {} args", invocation.program, invocation.args.len());

        cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::AgentNotFound(invocation.program.clone())
            } else {
                Error::Io(e)
            }
        })
    }

    fn stdout_reader<R>(
        &self,
        pipe: R,
        run_id: &str,
        message_id: Option<&str>,
        stop: CancellationToken,
    ) -> JoinHandle<String>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut writer = match (&self.mode, message_id) {
            (OutputMode::Streaming { streamer, .. }, Some(id)) => {
                Some(StreamWriter::new(streamer.clone(), run_id, id))
            }
            _ => None,
        };
        let echo = self.echo;

        tokio::spawn(async move {
            let mut pipe = pipe;
            let mut captured = Vec::new();
            let mut chunk = [0u8; 8192];
            let mut out = tokio::io::stdout();

            loop {
                let read = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    read = pipe.read(&mut chunk) => read,
                };
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Reading agent stdout failed: {}", e);
                        break;
                    }
                };
                let bytes = &chunk[..n];
                captured.extend_from_slice(bytes);
                if let Some(w) = writer.as_mut() {
                    w.write(bytes);
                }
                if echo {
                    let _ = out.write_all(bytes).await;
                    let _ = out.flush().await;
                }
            }

            if let Some(w) = writer.as_mut() {
                w.flush();
            }
            String::from_utf8_lossy(&captured).into_owned()
        })
    }

    fn stderr_reader<R>(&self, pipe: R, run_id: &str, stop: CancellationToken) -> JoinHandle<String>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tool_log = self.mode.tool_log().cloned();
        let tool_calls = self.tool_calls.clone();
        let run_id = run_id.to_string();

        tokio::spawn(async move {
            let mut captured = String::new();
            let mut lines = BufReader::new(pipe).lines();

            loop {
                let line = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        record_tool_line(&line, tool_log.as_deref(), tool_calls.as_deref(), &run_id);
                        captured.push_str(&line);
                        captured.push('\n');
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Reading agent stderr failed: {}", e);
                        break;
                    }
                }
            }
            captured
        })
    }
}

#[async_trait]
impl Executor for ClaudeExecutor {
    async fn execute(&self, config: &ExecuteConfig, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut child = self.spawn(config)?;
        let run_id = config.run_id.clone().unwrap_or_default();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Config("agent stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Config("agent stderr not captured".to_string()))?;

        let message_id = self.mode.is_streaming().then(ids::message_id);
        let streamer: Option<Arc<dyn Streamer>> = match (&self.mode, &message_id) {
            (OutputMode::Streaming { streamer, .. }, Some(id)) => {
                streamer.stream_start(&run_id, id);
                Some(streamer.clone())
            }
            _ => None,
        };

        let stop_readers = CancellationToken::new();
        let stdout_task =
            self.stdout_reader(stdout, &run_id, message_id.as_deref(), stop_readers.clone());
        let stderr_task = self.stderr_reader(stderr, &run_id, stop_readers.clone());
        let mut readers = Box::pin(async move {
            let (stdout, stderr) = tokio::join!(stdout_task, stderr_task);
            (stdout.unwrap_or_default(), stderr.unwrap_or_default())
        });

        let timeout = config.timeout.unwrap_or(self.timeout);
        let deadline = Instant::now() + timeout;

        let outcome = match wait_for_exit(&mut child, deadline, cancel).await {
            // Output may outlive the process if it left children behind
            Ok(status) => tokio::select! {
                (stdout, stderr) = &mut readers => Ok((status, stdout, stderr)),
                _ = tokio::time::sleep_until(deadline) => Err(Interrupted::TimedOut),
                _ = cancel.cancelled() => Err(Interrupted::Cancelled),
            },
            Err(interrupted) => Err(interrupted),
        };

        let result = match outcome {
            Ok((status, stdout, stderr)) => finish(status, stdout, stderr, &self.mode),
            Err(interrupted) => {
                terminate(&mut child).await;
                stop_readers.cancel();
                let _ = readers.await;

                match interrupted {
                    Interrupted::TimedOut => {
                        warn!("Agent exceeded {:?}, killed it", timeout);
                        Err(Error::Timeout(timeout))
                    }
                    Interrupted::Cancelled => {
                        info!("Agent cancelled, killed it");
                        Err(Error::Cancelled)
                    }
                    Interrupted::Failed(e) => Err(Error::Io(e)),
                }
            }
        };

        // Both readers are done, so nothing can follow the end event
        if let (Some(streamer), Some(id)) = (streamer, &message_id) {
            streamer.stream_end(&run_id, id);
        }

        result
    }
}

/// Why an invocation ended without a usable exit
enum Interrupted {
    TimedOut,
    Cancelled,
    Failed(std::io::Error),
}

async fn wait_for_exit(
    child: &mut Child,
    deadline: Instant,
    cancel: &CancellationToken,
) -> std::result::Result<ExitStatus, Interrupted> {
    tokio::select! {
        status = child.wait() => status.map_err(Interrupted::Failed),
        _ = tokio::time::sleep_until(deadline) => Err(Interrupted::TimedOut),
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
    }
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!("Agent already gone: {}", e);
    }
}

fn finish(status: ExitStatus, stdout: String, stderr: String, mode: &OutputMode) -> Result<String> {
    if !status.success() {
        return Err(Error::AgentExit {
            code: status.code().unwrap_or(-1),
            stderr: excerpt(&stderr),
        });
    }

    Ok(match mode {
        OutputMode::Combined if !stderr.is_empty() => format!("{}{}", stdout, stderr),
        _ => stdout,
    })
}

/// Tail of stderr, trimmed to a readable length
fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_EXCERPT {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_EXCERPT;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

/// Telemetry sees every stderr line, whether or not a tool log is kept
fn record_tool_line(line: &str, log: Option<&ToolLog>, calls: Option<&BatchingEmitter>, run_id: &str) {
    if let Some(log) = log {
        log.push(line);
    }

    if let (Some(calls), Some(name)) = (calls, line.split_whitespace().next()) {
        calls.emit_tool_call(run_id, name);
    }
}

/// Prefer the configured directory, then the current one; fall back to
/// inheriting ours when neither is usable
fn resolve_workdir(preferred: Option<&Path>) -> Option<PathBuf> {
    let candidate = preferred
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())?;

    match std::fs::read_dir(&candidate) {
        Ok(_) => Some(candidate),
        Err(e) => {
            debug!("Ignoring working directory {}: {}", candidate.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BatchingConfig, Event, EventKind, RecordingEmitter};
    use crate::test_support::fake_agent;
    use tempfile::TempDir;

    fn script_config(script: &str) -> ExecuteConfig {
        let mut config = ExecuteConfig::new("/start", "state.json");
        config.env.insert("SCRIPT".to_string(), script.to_string());
        config
    }

    fn executor(mode: OutputMode) -> ClaudeExecutor {
        ClaudeExecutor::new(fake_agent(), mode)
    }

    #[tokio::test]
    async fn test_combined_output() {
        let exec = executor(OutputMode::Combined);

        let out = exec
            .execute(&script_config("echo out; echo err >&2"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(out.contains("out\n"));
        assert!(out.contains("err\n"));
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let exec = executor(OutputMode::Combined);

        let err = exec
            .execute(&script_config("echo broken >&2; exit 3"), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            Error::AgentExit { code, stderr } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_binary() {
        // spawning forks; make sure the shared fake agent exists first
        fake_agent();
        let exec = ClaudeExecutor::new("/nonexistent/agent-binary", OutputMode::Combined);
        let err = exec
            .execute(&ExecuteConfig::new("/start", "state.json"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn test_timeout_kills_agent() {
        let exec = executor(OutputMode::Combined);
        let mut config = script_config("sleep 30");
        config.timeout = Some(Duration::from_millis(200));

        let start = Instant::now();
        let err = exec.execute(&config, &CancellationToken::new()).await.unwrap_err();

        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_is_distinct_from_timeout() {
        let exec = executor(OutputMode::Combined);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = exec
            .execute(&script_config("sleep 30"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn test_heavy_output_on_both_streams() {
        let exec = executor(OutputMode::ToolLog(Arc::new(ToolLog::default())));
        let script = "i=0; while [ $i -lt 5000 ]; do echo \"out line $i\"; echo \"err line $i\" >&2; i=$((i+1)); done";

        let out = tokio::time::timeout(
            Duration::from_secs(20),
            exec.execute(&script_config(script), &CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(out.lines().count(), 5000);
        assert_eq!(
            exec.mode().tool_log().unwrap().entries().last().map(String::as_str),
            Some("err line 4999")
        );
    }

    #[tokio::test]
    async fn test_streaming_emits_ordered_message() {
        let rec = Arc::new(RecordingEmitter::new());
        let exec = executor(OutputMode::Streaming {
                streamer: rec.clone(),
            tool_log: Arc::new(ToolLog::default()),
        });
        let mut config = script_config("echo one; echo two; printf three");
        config.run_id = Some("run-1".to_string());

        exec.execute(&config, &CancellationToken::new()).await.unwrap();

        let events = rec.events();
        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types.first(), Some(&"text_message_start"));
        assert_eq!(types.last(), Some(&"text_message_end"));

        let id = events[0].correlation_id().map(str::to_string);
        assert!(events.iter().all(|e| e.correlation_id().map(str::to_string) == id));

        let text: String = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::TextMessageContent { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "one\ntwo\nthree");
    }

    /// Content events that arrived after the message ended
    fn content_after_end(events: &[Event]) -> usize {
        events
            .iter()
            .skip_while(|e| e.event_type() != "text_message_end")
            .filter(|e| e.event_type() == "text_message_content")
            .count()
    }

    #[tokio::test]
    async fn test_streaming_timeout_ends_message_last() {
        for _ in 0..5 {
            let rec = Arc::new(RecordingEmitter::new());
            let exec = executor(OutputMode::Streaming {
                streamer: rec.clone(),
                tool_log: Arc::new(ToolLog::default()),
            });
            let mut config = script_config("yes line");
            config.run_id = Some("run-1".to_string());
            config.timeout = Some(Duration::from_millis(100));

            let err = exec.execute(&config, &CancellationToken::new()).await.unwrap_err();
            assert!(err.is_timeout());

            // let any straggling reader show itself
            tokio::time::sleep(Duration::from_millis(50)).await;
            let events = rec.events();
            assert_eq!(events.last().map(|e| e.event_type()), Some("text_message_end"));
            assert_eq!(content_after_end(&events), 0);
            assert_eq!(
                events.iter().filter(|e| e.event_type() == "text_message_end").count(),
                1
            );
        }
    }

    #[tokio::test]
    async fn test_streaming_cancel_ends_message_last() {
        let rec = Arc::new(RecordingEmitter::new());
        let exec = executor(OutputMode::Streaming {
            streamer: rec.clone(),
            tool_log: Arc::new(ToolLog::default()),
        });
        let mut config = script_config("yes line");
        config.run_id = Some("run-1".to_string());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = exec.execute(&config, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = rec.events();
        assert_eq!(events.last().map(|e| e.event_type()), Some("text_message_end"));
        assert_eq!(content_after_end(&events), 0);
    }

    #[tokio::test]
    async fn test_timeout_covers_inherited_pipes() {
        // the background sleep keeps stdout open after the agent exits
        let exec = executor(OutputMode::Combined);
        let mut config = script_config("sleep 6 & echo started");
        config.timeout = Some(Duration::from_millis(500));

        let start = Instant::now();
        let err = exec.execute(&config, &CancellationToken::new()).await.unwrap_err();

        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cancel_covers_inherited_pipes() {
        let exec = executor(OutputMode::Combined);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = exec
            .execute(&script_config("sleep 6 & echo started"), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_tool_calls_recorded_without_tool_log() {
        let batches = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = batches.clone();
        let stop = CancellationToken::new();
        let (calls, handle) = BatchingEmitter::start(
            BatchingConfig::default(),
            move |batch: Vec<Event>| sink.lock().unwrap().extend(batch),
            stop.clone(),
        );

        let exec = executor(OutputMode::Combined).with_tool_calls(Arc::new(calls));
        let mut config = script_config("echo 'Bash ls' >&2; echo 'Edit main.rs' >&2");
        config.run_id = Some("run-1".to_string());
        exec.execute(&config, &CancellationToken::new()).await.unwrap();

        stop.cancel();
        handle.await.unwrap();

        let names: Vec<String> = batches
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::ToolCallStart { tool_call_name, .. } => Some(tool_call_name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["Bash", "Edit"]);
    }

    #[tokio::test]
    async fn test_env_reaches_agent() {
        let exec = executor(OutputMode::Combined);
        let mut config = script_config("printf \"$CADENCE_RUN_ID\"");
        config.env.insert("CADENCE_RUN_ID".to_string(), "run-42".to_string());

        let out = exec.execute(&config, &CancellationToken::new()).await.unwrap();
        assert_eq!(out, "run-42");
    }

    #[test]
    fn test_resolve_workdir_falls_back() {
        assert_eq!(resolve_workdir(Some(Path::new("/definitely/not/here"))), None);

        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_workdir(Some(dir.path())), Some(dir.path().to_path_buf()));
    }

    #[test]
    fn test_excerpt_keeps_tail() {
        let long = "x".repeat(STDERR_EXCERPT) + "tail";
        let ex = excerpt(&long);
        assert!(ex.starts_with("..."));
        assert!(ex.ends_with("tail"));
    }
}
