//! Plan data model.
//!
//! A plan is an ordered list of steps forming a DAG via `waiting_for_id`.
//! This module owns the step/command/result types and the pure helpers the
//! scheduler and reconciler build on:
//! - terminal-status classification,
//! - command payload detection,
//! - case-insensitive id lookup,
//! - dangling-dependency normalization.

pub mod reconcile;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::observation::Observation;

/// Execution status of a plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Abandoned,
}

impl StepStatus {
    /// Completed, failed, and abandoned steps never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Abandoned)
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// A runnable shell command attached to a plan step.
///
/// `shell == "agent"` marks a virtual-agent command: `run` then carries the
/// sub-agent descriptor instead of a shell invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail_lines: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

pub const VIRTUAL_SHELL: &str = "agent";

impl Command {
    /// A command is runnable when `run` or `shell` is non-empty after trimming.
    pub fn has_payload(&self) -> bool {
        let non_empty = |field: &Option<String>| field.as_deref().is_some_and(|v| !v.trim().is_empty());
        non_empty(&self.run) || non_empty(&self.shell)
    }

    /// The trimmed `(shell, run, cwd)` triple identifying this invocation.
    ///
    /// Timeouts and output filters are deliberately excluded: changing them
    /// is not a new command, neither for approval nor for reconciliation.
    pub fn invocation(&self) -> (String, String, String) {
        let trim = |field: &Option<String>| field.as_deref().unwrap_or("").trim().to_string();
        (trim(&self.shell), trim(&self.run), trim(&self.cwd))
    }

    pub fn same_invocation(&self, other: &Command) -> bool {
        self.invocation() == other.invocation()
    }

    /// Key under which the usage counter records this command: the explicit
    /// `key` field, or else the first whitespace-delimited token of `run`.
    pub fn usage_key(&self) -> Option<String> {
        if let Some(key) = self.key.as_deref() {
            let key = key.trim();
            if !key.is_empty() {
                return Some(key.to_string());
            }
        }
        self.run
            .as_deref()
            .and_then(|run| run.split_whitespace().next())
            .map(str::to_string)
    }

    pub fn is_virtual(&self) -> bool {
        self.shell.as_deref().map(str::trim) == Some(VIRTUAL_SHELL)
    }
}

/// Raw result of one command execution. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub killed: bool,
    pub runtime_ms: u64,
}

impl CommandResult {
    /// Convert an execution-layer error into a failed result. The drain loop
    /// never sees the error itself.
    pub fn from_error(message: &str, runtime_ms: u64) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.to_string(),
            exit_code: Some(1),
            killed: false,
            runtime_ms,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// One step of the plan DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub waiting_for_id: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default)]
    pub age: u32,
}

impl PlanStep {
    /// Step ids compare case-insensitively.
    pub fn matches_id(&self, id: &str) -> bool {
        self.id.eq_ignore_ascii_case(id)
    }
}

/// A plan step as proposed by the model. The model never supplies
/// observations or ages; its claimed status is advisory only.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IncomingStep {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: Option<StepStatus>,
    #[serde(default)]
    pub waiting_for_id: BTreeSet<String>,
    #[serde(default)]
    pub command: Option<Command>,
    #[serde(default)]
    pub priority: Option<i64>,
}

impl IncomingStep {
    /// Materialize a freshly introduced step. Status is forced to pending:
    /// the model cannot mark an item it just introduced as finished.
    pub fn into_pending_step(self) -> PlanStep {
        PlanStep {
            id: self.id,
            title: self.title,
            status: StepStatus::Pending,
            waiting_for_id: self.waiting_for_id,
            command: self.command,
            observation: None,
            priority: self.priority,
            age: 0,
        }
    }
}

/// The ordered plan, owned by exactly one pass executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub(crate) steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        let mut plan = Self { steps };
        plan.strip_dangling_dependencies();
        plan
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn find(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|step| step.matches_id(id))
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    pub fn open_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| !step.status.is_terminal())
            .count()
    }

    /// Non-empty and every step terminal: the plan is finished.
    pub fn fully_terminal(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|step| step.status.is_terminal())
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    /// Drop `waiting_for_id` entries that resolve to no step in the plan.
    /// A vanished dependency is not a blocker.
    pub fn strip_dangling_dependencies(&mut self) {
        let ids: Vec<String> = self
            .steps
            .iter()
            .map(|step| step.id.to_ascii_lowercase())
            .collect();
        for step in &mut self.steps {
            step.waiting_for_id
                .retain(|dep| ids.iter().any(|id| id.eq_ignore_ascii_case(dep)));
        }
    }

    /// Bump the age of every still-open step at the end of a pass.
    pub fn bump_open_ages(&mut self) {
        for step in &mut self.steps {
            if !step.status.is_terminal() {
                step.age = step.age.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn step(id: &str, status: StepStatus, deps: &[&str], run: Option<&str>) -> PlanStep {
    PlanStep {
        id: id.to_string(),
        title: format!("step {id}"),
        status,
        waiting_for_id: deps.iter().map(|d| d.to_string()).collect(),
        command: run.map(|r| Command {
            run: Some(r.to_string()),
            ..Command::default()
        }),
        observation: None,
        priority: None,
        age: 0,
    }
}
