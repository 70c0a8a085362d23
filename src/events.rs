//! Emitted engine events and sinks.
//!
//! Every state change a renderer could care about is emitted as a structured
//! event: plan snapshots, per-step progress, command results, status lines,
//! assistant messages, and failures. Each event is self-contained — a
//! consumer can reconstruct the current state without replaying history.
//!
//! Sinks: a JSONL file writer (one self-contained object per line), an
//! in-memory buffer for tests, a compact console printer, a fan-out, and a
//! labeling wrapper that scopes a sub-agent's events under its synthetic
//! name.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::plan::{Plan, PlanStep, StepStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Warn,
}

/// One step of a plan snapshot, trimmed to what a renderer needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotStep {
    pub id: String,
    pub title: String,
    pub status: StepStatus,
    pub waiting_for_id: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    pub has_command: bool,
    pub age: u32,
}

impl From<&PlanStep> for SnapshotStep {
    fn from(step: &PlanStep) -> Self {
        Self {
            id: step.id.clone(),
            title: step.title.clone(),
            status: step.status,
            waiting_for_id: step.waiting_for_id.iter().cloned().collect(),
            priority: step.priority,
            has_command: step.command.as_ref().is_some_and(|c| c.has_payload()),
            age: step.age,
        }
    }
}

/// Structured events produced by the pass engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Full plan snapshot after a reconcile or a step transition.
    Plan { steps: Vec<SnapshotStep> },
    /// One step changed status.
    PlanProgress { step_id: String, status: StepStatus },
    /// An executed command finished.
    CommandResult {
        step_id: String,
        exit_code: Option<i32>,
        killed: bool,
        runtime_ms: u64,
        stdout_preview: String,
        stderr_preview: String,
    },
    /// Human-readable engine status line.
    Status { level: StatusLevel, message: String },
    /// The assistant's prose message for this pass.
    AssistantMessage { text: String },
    /// The model reply failed structural validation.
    SchemaValidationFailed { errors: Vec<String> },
    /// Something went wrong that the engine recovered from.
    Error { message: String },
    Debug { message: String },
    /// An event emitted by a virtual sub-agent, scoped under its label.
    SubAgent {
        label: String,
        event: Box<AgentEvent>,
    },
}

impl AgentEvent {
    pub fn plan_snapshot(plan: &Plan) -> Self {
        Self::Plan {
            steps: plan.steps().iter().map(SnapshotStep::from).collect(),
        }
    }

    pub fn status(level: StatusLevel, message: impl Into<String>) -> Self {
        Self::Status {
            level,
            message: message.into(),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: AgentEvent);
}

/// JSONL event log — one timestamped, self-contained object per line.
pub struct JsonlEventSink {
    writer: Mutex<BufWriter<File>>,
    #[allow(dead_code)]
    path: PathBuf,
}

#[derive(Serialize)]
struct EventRecord<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a AgentEvent,
}

impl JsonlEventSink {
    /// Create the log file (and parent directories) if needed; append to an
    /// existing file.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event log: {}", path.display()))?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }
}

impl EventSink for JsonlEventSink {
    fn emit(&self, event: AgentEvent) {
        let record = EventRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            event: &event,
        };
        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(err) => {
                warn!(%err, "failed to serialize event");
                return;
            }
        };
        debug!(event = %json, "event log");
        let mut writer = self.writer.lock().unwrap();
        if let Err(err) = writeln!(writer, "{json}").and_then(|()| writer.flush()) {
            warn!(%err, "failed to write event log entry");
        }
    }
}

/// In-memory sink for tests and for the sub-agent transcript.
#[derive(Debug, Clone, Default)]
pub struct BufferEventSink {
    inner: Arc<Mutex<Vec<AgentEvent>>>,
}

impl BufferEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<AgentEvent> {
        self.inner.lock().unwrap().clone()
    }
}

impl EventSink for BufferEventSink {
    fn emit(&self, event: AgentEvent) {
        self.inner.lock().unwrap().push(event);
    }
}

/// Wraps every event in a `SubAgent` envelope before forwarding.
pub struct LabeledEventSink {
    label: String,
    inner: Arc<dyn EventSink>,
}

impl LabeledEventSink {
    pub fn new(label: impl Into<String>, inner: Arc<dyn EventSink>) -> Self {
        Self {
            label: label.into(),
            inner,
        }
    }
}

impl EventSink for LabeledEventSink {
    fn emit(&self, event: AgentEvent) {
        self.inner.emit(AgentEvent::SubAgent {
            label: self.label.clone(),
            event: Box::new(event),
        });
    }
}

/// Compact console rendering of the event stream, in the spirit of a
/// supervisor log: one prefixed line per event that matters to a human.
pub struct ConsoleEventSink;

impl EventSink for ConsoleEventSink {
    fn emit(&self, event: AgentEvent) {
        match &event {
            AgentEvent::AssistantMessage { text } => println!("\n{text}\n"),
            AgentEvent::Status { level, message } => {
                let mark = match level {
                    StatusLevel::Info => "·",
                    StatusLevel::Warn => "⚠",
                };
                println!("[planrun] {mark} {message}");
            }
            AgentEvent::PlanProgress { step_id, status } => {
                println!("[planrun] step {step_id}: {status:?}");
            }
            AgentEvent::CommandResult {
                step_id,
                exit_code,
                killed,
                ..
            } => {
                let outcome = match (exit_code, killed) {
                    (_, true) => "killed (timeout)".to_string(),
                    (Some(0), _) => "ok".to_string(),
                    (Some(code), _) => format!("exit {code}"),
                    (None, _) => "no exit code".to_string(),
                };
                println!("[planrun] step {step_id}: {outcome}");
            }
            AgentEvent::Error { message } => println!("[planrun] ✗ {message}"),
            AgentEvent::SubAgent { label, event } => {
                if let AgentEvent::Status { message, .. } = event.as_ref() {
                    println!("[planrun:{label}] {message}");
                }
            }
            AgentEvent::Plan { .. }
            | AgentEvent::SchemaValidationFailed { .. }
            | AgentEvent::Debug { .. } => {}
        }
    }
}

/// Forward each event to every sink.
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: AgentEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::step;

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = AgentEvent::status(StatusLevel::Warn, "stalled");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"status\""));
        assert!(json.contains("\"level\":\"warn\""));

        let event = AgentEvent::SchemaValidationFailed {
            errors: vec!["plan: missing".to_string()],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"schema_validation_failed\""));
    }

    #[test]
    fn plan_snapshot_captures_step_shape() {
        let plan = Plan::new(vec![step("a", StepStatus::Running, &[], Some("ls"))]);
        let event = AgentEvent::plan_snapshot(&plan);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"plan\""));
        assert!(json.contains("\"has_command\":true"));
        assert!(json.contains("\"status\":\"running\""));
    }

    #[test]
    fn jsonl_sink_writes_one_record_per_event() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs").join("session.jsonl");
        let sink = JsonlEventSink::new(&path).unwrap();

        sink.emit(AgentEvent::status(StatusLevel::Info, "starting"));
        sink.emit(AgentEvent::Debug {
            message: "tick".to_string(),
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed.get("timestamp").is_some());
            assert!(parsed.get("type").is_some());
        }
    }

    #[test]
    fn labeled_sink_wraps_events_in_subagent_envelope() {
        let buffer = BufferEventSink::new();
        let labeled = LabeledEventSink::new("subagent:probe", Arc::new(buffer.clone()));
        labeled.emit(AgentEvent::status(StatusLevel::Info, "inner"));

        let events = buffer.snapshot();
        assert_eq!(events.len(), 1);
        match &events[0] {
            AgentEvent::SubAgent { label, event } => {
                assert_eq!(label, "subagent:probe");
                assert!(matches!(event.as_ref(), AgentEvent::Status { .. }));
            }
            other => panic!("expected sub-agent envelope, got {other:?}"),
        }
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = BufferEventSink::new();
        let b = BufferEventSink::new();
        let fanout = FanoutEventSink::new(vec![Arc::new(a.clone()), Arc::new(b.clone())]);
        fanout.emit(AgentEvent::Debug {
            message: "x".to_string(),
        });
        assert_eq!(a.snapshot().len(), 1);
        assert_eq!(b.snapshot().len(), 1);
    }
}
