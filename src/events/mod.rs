//! Run events and their distribution
//!
//! Provides:
//! - [`Event`], the value emitted for every lifecycle and content change
//! - [`WorkflowEvent`], its camelCase wire form for push transports
//! - [`EventEmitter`] and [`Streamer`], the seams the engine and the agent
//!   adapter emit through
//! - [`EventHub`], per-run fan-out to live subscribers
//! - [`BatchingEmitter`], buffered delivery of high-frequency tool calls
//! - [`EventClient`], HTTP delivery to an external endpoint

mod batching;
mod client;
mod hub;
pub mod ids;

pub use batching::{BatchingConfig, BatchingEmitter};
pub use client::EventClient;
pub use hub::{EventHub, Subscription};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::workflow::WorkflowState;

/// Source tag carried by agent-produced events
pub const EVENT_SOURCE: &str = "claude";

/// One event for one run
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    RunStarted { task: String },
    RunFinished { task: String },
    RunError { task: String, error: String },
    StateSnapshot { state: WorkflowState },
    TextMessageStart { message_id: String },
    TextMessageContent { message_id: String, content: String },
    TextMessageEnd { message_id: String },
    ToolCallStart { tool_call_id: String, tool_call_name: String },
    ToolCallEnd { tool_call_id: String, tool_call_name: String },
}

impl Event {
    pub fn new(run_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            run_id: run_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Wire name of the event type
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::RunStarted { .. } => "run_started",
            EventKind::RunFinished { .. } => "run_finished",
            EventKind::RunError { .. } => "run_error",
            EventKind::StateSnapshot { .. } => "state_snapshot",
            EventKind::TextMessageStart { .. } => "text_message_start",
            EventKind::TextMessageContent { .. } => "text_message_content",
            EventKind::TextMessageEnd { .. } => "text_message_end",
            EventKind::ToolCallStart { .. } => "tool_call_start",
            EventKind::ToolCallEnd { .. } => "tool_call_end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::RunFinished { .. } | EventKind::RunError { .. }
        )
    }

    /// Correlation key of a message or tool-call event
    pub fn correlation_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::TextMessageStart { message_id }
            | EventKind::TextMessageContent { message_id, .. }
            | EventKind::TextMessageEnd { message_id } => Some(message_id),
            EventKind::ToolCallStart { tool_call_id, .. }
            | EventKind::ToolCallEnd { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }

    pub fn to_wire(&self) -> WorkflowEvent {
        let mut wire = WorkflowEvent {
            event_type: self.event_type().to_string(),
            run_id: self.run_id.clone(),
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            ..Default::default()
        };

        match &self.kind {
            EventKind::RunStarted { task } | EventKind::RunFinished { task } => {
                wire.data = Some(serde_json::json!({ "task": task }));
            }
            EventKind::RunError { task, error } => {
                wire.data = Some(serde_json::json!({ "task": task, "error": error }));
            }
            EventKind::StateSnapshot { state } => {
                wire.data = serde_json::to_value(state).ok();
            }
            EventKind::TextMessageStart { message_id } => {
                wire.message_id = Some(message_id.clone());
                wire.source = Some(EVENT_SOURCE.to_string());
            }
            EventKind::TextMessageContent {
                message_id,
                content,
            } => {
                wire.message_id = Some(message_id.clone());
                wire.content = Some(content.clone());
                wire.delta = Some(true);
                wire.source = Some(EVENT_SOURCE.to_string());
            }
            EventKind::TextMessageEnd { message_id } => {
                wire.message_id = Some(message_id.clone());
                wire.complete = Some(true);
                wire.source = Some(EVENT_SOURCE.to_string());
            }
            EventKind::ToolCallStart {
                tool_call_id,
                tool_call_name,
            }
            | EventKind::ToolCallEnd {
                tool_call_id,
                tool_call_name,
            } => {
                wire.tool_call_id = Some(tool_call_id.clone());
                wire.tool_call_name = Some(tool_call_name.clone());
            }
        }

        wire
    }
}

/// Event as seen by external observers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub run_id: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl WorkflowEvent {
    /// Render as one Server-Sent Events frame
    pub fn sse_frame(&self) -> serde_json::Result<String> {
        Ok(format!(
            "event: {}\ndata: {}\n\n",
            self.event_type,
            serde_json::to_string(self)?
        ))
    }
}

/// Run lifecycle notifications
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn run_started(&self, run_id: &str, task: &str);
    async fn run_finished(&self, run_id: &str, task: &str);
    async fn run_error(&self, run_id: &str, task: &str, error: &str);
    async fn state_snapshot(&self, run_id: &str, state: &WorkflowState);
}

/// Streamed agent output, one message at a time
///
/// Implementations must not block; they are called from the output readers.
pub trait Streamer: Send + Sync {
    fn stream_start(&self, run_id: &str, message_id: &str);
    fn stream_content(&self, run_id: &str, message_id: &str, content: &str);
    fn stream_end(&self, run_id: &str, message_id: &str);
}

/// Emitter and streamer that discard everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEmitter;

#[async_trait]
impl EventEmitter for NoopEmitter {
    async fn run_started(&self, _run_id: &str, _task: &str) {}
    async fn run_finished(&self, _run_id: &str, _task: &str) {}
    async fn run_error(&self, _run_id: &str, _task: &str, _error: &str) {}
    async fn state_snapshot(&self, _run_id: &str, _state: &WorkflowState) {}
}

impl Streamer for NoopEmitter {
    fn stream_start(&self, _run_id: &str, _message_id: &str) {}
    fn stream_content(&self, _run_id: &str, _message_id: &str, _content: &str) {}
    fn stream_end(&self, _run_id: &str, _message_id: &str) {}
}

/// Keeps every event in memory, in emission order
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<Event>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn push(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[async_trait]
impl EventEmitter for RecordingEmitter {
    async fn run_started(&self, run_id: &str, task: &str) {
        self.push(Event::new(run_id, EventKind::RunStarted { task: task.to_string() }));
    }

    async fn run_finished(&self, run_id: &str, task: &str) {
        self.push(Event::new(run_id, EventKind::RunFinished { task: task.to_string() }));
    }

    async fn run_error(&self, run_id: &str, task: &str, error: &str) {
        self.push(Event::new(
            run_id,
            EventKind::RunError {
                task: task.to_string(),
                error: error.to_string(),
            },
        ));
    }

    async fn state_snapshot(&self, run_id: &str, state: &WorkflowState) {
        self.push(Event::new(run_id, EventKind::StateSnapshot { state: state.clone() }));
    }
}

impl Streamer for RecordingEmitter {
    fn stream_start(&self, run_id: &str, message_id: &str) {
        self.push(Event::new(
            run_id,
            EventKind::TextMessageStart {
                message_id: message_id.to_string(),
            },
        ));
    }

    fn stream_content(&self, run_id: &str, message_id: &str, content: &str) {
        self.push(Event::new(
            run_id,
            EventKind::TextMessageContent {
                message_id: message_id.to_string(),
                content: content.to_string(),
            },
        ));
    }

    fn stream_end(&self, run_id: &str, message_id: &str) {
        self.push(Event::new(
            run_id,
            EventKind::TextMessageEnd {
                message_id: message_id.to_string(),
            },
        ));
    }
}

/// Forwards lifecycle notifications to several emitters in order
#[derive(Default, Clone)]
pub struct Emitters {
    inner: Vec<Arc<dyn EventEmitter>>,
}

impl Emitters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.inner.push(emitter);
        self
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Emitters run side by side; each still sees events in order
#[async_trait]
impl EventEmitter for Emitters {
    async fn run_started(&self, run_id: &str, task: &str) {
        join_all(self.inner.iter().map(|e| e.run_started(run_id, task))).await;
    }

    async fn run_finished(&self, run_id: &str, task: &str) {
        join_all(self.inner.iter().map(|e| e.run_finished(run_id, task))).await;
    }

    async fn run_error(&self, run_id: &str, task: &str, error: &str) {
        join_all(self.inner.iter().map(|e| e.run_error(run_id, task, error))).await;
    }

    async fn state_snapshot(&self, run_id: &str, state: &WorkflowState) {
        join_all(self.inner.iter().map(|e| e.state_snapshot(run_id, state))).await;
    }
}
