//! Pass executor — one model round-trip plus the command drain loop.
//!
//! A pass walks a fixed state machine:
//! 1. request a completion over the running history (cancellation checked
//!    at this boundary),
//! 2. parse the reply through the repair ladder,
//! 3. validate structurally, then semantically,
//! 4. reconcile the proposed plan into local state,
//! 5. drain executable steps one at a time — approval gate, runtime,
//!    observation, plan mutation — re-selecting after every completion,
//! 6. idle handling: refusal nudge, bounded reminders, terminal cleanup,
//! 7. persist and append one consolidated plan observation if anything
//!    mutated.
//!
//! No failure inside a pass propagates as an error. Every path resolves to
//! "run another pass" or "stop the loop", and the two nudge mechanisms are
//! the only retries, both bounded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::approval::{ApprovalGate, HumanDecision};
use crate::events::{AgentEvent, EventSink, StatusLevel};
use crate::history::{History, ObservationKind, Role};
use crate::llm::{CompletionClient, CompletionOutcome};
use crate::observation;
use crate::parse::{self, ReplyShape};
use crate::persist::PlanStore;
use crate::plan::{Plan, StepStatus, reconcile::reconcile};
use crate::prompts;
use crate::runtime::{CommandRuntime, ProcessRunner};
use crate::scheduler;
use crate::usage::UsageCounter;
use crate::validate::{SchemaValidator, SemanticValidator};

/// Shared cancellation flag, set by the interrupt handler and checked at
/// the completion-await boundary. An in-flight command is left to its
/// timeout.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Injected clock so observation timestamps are reproducible in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Failure classes a pass absorbs. The variant only decides which
/// observation and event the failure turns into; none of them escapes.
#[derive(Debug, Error)]
pub enum PassFailure {
    #[error("model reply was not valid JSON: {0}")]
    Parse(String),
    #[error("model reply failed schema validation")]
    Schema(Vec<String>),
    #[error("model reply violated the plan protocol")]
    Semantics(Vec<String>),
    #[error("completion transport error: {0}")]
    Transport(String),
}

/// Every external collaborator the engine consumes, constructed once and
/// passed by reference instead of a bag of optional parameters.
#[derive(Clone)]
pub struct Dependencies {
    pub completion: Arc<dyn CompletionClient>,
    pub runner: Arc<dyn ProcessRunner>,
    pub decisions: Arc<dyn crate::approval::DecisionProvider>,
    pub schema: Arc<dyn SchemaValidator>,
    pub semantics: Arc<dyn SemanticValidator>,
    pub store: Arc<dyn PlanStore>,
    pub events: Arc<dyn EventSink>,
    pub usage: Arc<dyn UsageCounter>,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancelFlag,
}

#[derive(Debug, Clone)]
pub struct PassConfig {
    pub model: String,
    pub merge_plan_updates: bool,
    pub auto_approve: bool,
    pub extra_allowlist: Vec<String>,
    pub default_shell: String,
    pub default_timeout: Duration,
    /// Cap on consecutive idle nudges (reminders / refusal prompts) and on
    /// consecutive protocol-failure retries.
    pub max_consecutive_nudges: u32,
    pub subagent_max_passes: u32,
    pub subagent_max_depth: u32,
    /// Recursion depth of this executor; 0 for the top-level session.
    pub depth: u32,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            merge_plan_updates: true,
            auto_approve: false,
            extra_allowlist: Vec::new(),
            default_shell: "/bin/sh".to_string(),
            default_timeout: Duration::from_secs(120),
            max_consecutive_nudges: 3,
            subagent_max_passes: 10,
            subagent_max_depth: 2,
            depth: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// The model needs to see what happened; run another pass.
    Continue,
    /// Nothing left to do, or control goes back to the operator.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEnd {
    Stopped,
    CapReached,
}

pub struct PassExecutor {
    config: PassConfig,
    deps: Dependencies,
    gate: ApprovalGate,
    runtime: CommandRuntime,
    plan: Plan,
    history: History,
    idle_nudges: u32,
    recovery_attempts: u32,
}

impl PassExecutor {
    pub fn new(
        config: PassConfig,
        deps: Dependencies,
        history: History,
        initial_plan: Option<Plan>,
    ) -> Self {
        let gate = ApprovalGate::new(config.auto_approve, config.extra_allowlist.clone());
        let runtime = CommandRuntime::new(
            deps.runner.clone(),
            deps.usage.clone(),
            config.default_shell.clone(),
            config.default_timeout,
        );
        Self {
            config,
            deps,
            gate,
            runtime,
            plan: initial_plan.unwrap_or_default(),
            history,
            idle_nudges: 0,
            recovery_attempts: 0,
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Drive passes until the executor stops on its own or `max_passes` is
    /// exhausted.
    pub fn run_to_completion(&mut self, max_passes: Option<u32>) -> LoopEnd {
        let mut passes = 0u32;
        loop {
            if let Some(cap) = max_passes
                && passes >= cap
            {
                return LoopEnd::CapReached;
            }
            passes += 1;
            debug!(pass = passes, depth = self.config.depth, "starting pass");
            match self.run_pass() {
                PassOutcome::Continue => {}
                PassOutcome::Stop => return LoopEnd::Stopped,
            }
        }
    }

    /// Execute one full pass. Infallible by design: every failure ends in
    /// an outcome, not an error.
    pub fn run_pass(&mut self) -> PassOutcome {
        if self.deps.cancel.is_canceled() {
            return self.record_cancellation("session canceled before completion request");
        }

        let messages = self.history.transport_messages();
        let text = match self.deps.completion.complete(&messages, &self.config.model) {
            Ok(CompletionOutcome::Success(text)) if !text.trim().is_empty() => text,
            Ok(CompletionOutcome::Canceled) => {
                return self.record_cancellation("completion request canceled");
            }
            Ok(_) => {
                self.emit(AgentEvent::status(
                    StatusLevel::Info,
                    "model returned no content; stopping",
                ));
                return PassOutcome::Stop;
            }
            Err(err) => {
                return self.absorb_failure(PassFailure::Transport(format!("{err:#}")));
            }
        };

        self.history.push_chat(Role::Assistant, text.clone());

        let value = match parse::parse_reply_text(&text) {
            Ok(value) => value,
            Err(err) => return self.absorb_failure(PassFailure::Parse(err)),
        };

        let schema = self.deps.schema.validate(&value);
        if !schema.valid {
            let errors = schema
                .errors
                .into_iter()
                .map(|issue| format!("{}: {}", issue.path, issue.message))
                .collect();
            return self.absorb_failure(PassFailure::Schema(errors));
        }

        let reply = match parse::to_reply(value) {
            Ok(reply) => reply,
            Err(err) => return self.absorb_failure(PassFailure::Parse(err)),
        };

        let semantics = self.deps.semantics.validate(&reply);
        if !semantics.valid {
            return self.absorb_failure(PassFailure::Semantics(semantics.errors));
        }

        self.recovery_attempts = 0;
        if let Some(message) = reply.message.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            self.emit(AgentEvent::AssistantMessage {
                text: message.to_string(),
            });
        }

        let before = self.plan.clone();
        let incoming_empty = reply.plan.is_empty();
        reconcile(&mut self.plan, &reply.plan, self.config.merge_plan_updates);
        self.emit(AgentEvent::plan_snapshot(&self.plan));

        let (executed, rejected) = self.drain_steps();

        let mutated = executed > 0 || rejected || self.plan != before;
        if mutated {
            self.plan.bump_open_ages();
            if self.plan.is_empty() || self.plan.fully_terminal() {
                self.deps.store.clear();
            } else {
                self.deps.store.save(&self.plan);
            }
            self.history
                .push_observation(ObservationKind::plan_summary(&self.plan));
        }

        if !before.fully_terminal() && self.plan.fully_terminal() {
            self.emit(AgentEvent::Plan { steps: Vec::new() });
            self.emit(AgentEvent::status(StatusLevel::Info, "plan complete"));
        }

        if rejected {
            // The model sees the rejection observation on the next pass.
            return PassOutcome::Continue;
        }
        if executed > 0 {
            self.idle_nudges = 0;
            return PassOutcome::Continue;
        }

        self.handle_idle(&reply, incoming_empty)
    }

    /// Drain executable steps sequentially, re-selecting after each
    /// completion. Returns (commands executed, rejected by human).
    fn drain_steps(&mut self) -> (usize, bool) {
        let mut executed = 0usize;

        loop {
            let Some(idx) = scheduler::select_next(&self.plan) else {
                return (executed, false);
            };
            let Some(command) = self.plan.steps[idx].command.clone() else {
                // select_next only returns steps with payloads; defend anyway.
                self.plan.steps[idx].status = StepStatus::Failed;
                continue;
            };
            let step_id = self.plan.steps[idx].id.clone();
            let title = self.plan.steps[idx].title.clone();

            self.plan.steps[idx].status = StepStatus::Running;
            self.emit(AgentEvent::PlanProgress {
                step_id: step_id.clone(),
                status: StepStatus::Running,
            });
            self.emit(AgentEvent::plan_snapshot(&self.plan));

            if !self.approve(idx, &command) {
                return (executed, true);
            }

            let result = if command.is_virtual() {
                crate::subagent::execute_virtual(&self.config, &self.deps, &command)
            } else {
                self.runtime.execute(&command)
            };
            executed += 1;

            let built = observation::build(&command, &result, self.deps.clock.now());
            let status = if result.success() {
                StepStatus::Completed
            } else {
                StepStatus::Failed
            };

            let step = &mut self.plan.steps[idx];
            step.status = status;
            if result.killed {
                // A timed-out command must not be retried verbatim.
                step.command = None;
            }
            step.observation = Some(built.observation.clone());

            self.history.push_observation(ObservationKind::Command {
                step_id: step_id.clone(),
                title,
                runtime_ms: built.observation.metadata.runtime_ms,
                killed: built.observation.metadata.killed,
                output: built.observation.for_llm.clone(),
            });
            self.emit(AgentEvent::CommandResult {
                step_id: step_id.clone(),
                exit_code: built.observation.for_llm.exit_code,
                killed: result.killed,
                runtime_ms: result.runtime_ms,
                stdout_preview: built.preview.stdout,
                stderr_preview: built.preview.stderr,
            });
            self.emit(AgentEvent::PlanProgress { step_id, status });
        }
    }

    /// Run the approval gate for one step. Returns false when the human
    /// rejected the command and the pass must stop draining.
    fn approve(&mut self, idx: usize, command: &crate::plan::Command) -> bool {
        let shown = command_label(command);
        let auto = self.gate.should_auto_approve(command);
        if auto.approved {
            self.emit(AgentEvent::status(
                StatusLevel::Info,
                format!("auto-approved `{shown}` ({})", auto.source.label()),
            ));
            return true;
        }

        let decision = match self.deps.decisions.request_decision(command) {
            Ok(decision) => decision,
            Err(err) => {
                warn!(%err, "decision provider failed; treating as rejection");
                HumanDecision::Reject
            }
        };

        match decision {
            HumanDecision::ApproveOnce => {
                self.emit(AgentEvent::status(
                    StatusLevel::Info,
                    format!("approved once: `{shown}`"),
                ));
                true
            }
            HumanDecision::ApproveSession => {
                self.gate.record_session_approval(command);
                self.emit(AgentEvent::status(
                    StatusLevel::Info,
                    format!("approved for this session: `{shown}`"),
                ));
                true
            }
            HumanDecision::Reject => {
                let observation =
                    observation::cancellation("command rejected by human", self.deps.clock.now());
                let step = &mut self.plan.steps[idx];
                step.status = StepStatus::Pending;
                step.observation = Some(observation.clone());
                let step_id = step.id.clone();
                let title = step.title.clone();

                self.history.push_observation(ObservationKind::Command {
                    step_id: step_id.clone(),
                    title,
                    runtime_ms: 0,
                    killed: false,
                    output: observation.for_llm,
                });
                self.emit(AgentEvent::PlanProgress {
                    step_id,
                    status: StepStatus::Pending,
                });
                self.emit(AgentEvent::status(
                    StatusLevel::Warn,
                    format!("rejected by human: `{shown}`; ending pass"),
                ));
                false
            }
        }
    }

    /// No command executed this pass: decide between nudging the model and
    /// handing control back.
    fn handle_idle(&mut self, reply: &ReplyShape, incoming_empty: bool) -> PassOutcome {
        let refusal_source = reply
            .message
            .as_deref()
            .unwrap_or_else(|| self.history.last_assistant_text().unwrap_or(""));

        if incoming_empty && self.plan.is_empty() && prompts::looks_like_refusal(refusal_source) {
            self.idle_nudges += 1;
            if self.idle_nudges > self.config.max_consecutive_nudges {
                self.emit(AgentEvent::status(
                    StatusLevel::Warn,
                    "model keeps refusing with no plan; stopping",
                ));
                return PassOutcome::Stop;
            }
            self.history.push_chat(Role::User, prompts::CONTINUE_NUDGE);
            self.emit(AgentEvent::status(
                StatusLevel::Info,
                "model refused with no plan; nudging it to continue",
            ));
            return PassOutcome::Continue;
        }

        let open = self.plan.open_count();
        if open > 0 {
            self.idle_nudges += 1;
            if self.idle_nudges > self.config.max_consecutive_nudges {
                self.emit(AgentEvent::status(
                    StatusLevel::Warn,
                    format!(
                        "{open} open step(s) but nothing executable after {} reminders; \
                         handing control back",
                        self.config.max_consecutive_nudges
                    ),
                ));
                return PassOutcome::Stop;
            }
            self.history
                .push_chat(Role::User, prompts::reminder_nudge(open));
            self.emit(AgentEvent::status(
                StatusLevel::Info,
                "no executable step; reminding the model to revise the plan",
            ));
            return PassOutcome::Continue;
        }

        PassOutcome::Stop
    }

    fn record_cancellation(&mut self, reason: &str) -> PassOutcome {
        self.history.push_observation(ObservationKind::Canceled {
            reason: reason.to_string(),
        });
        self.emit(AgentEvent::status(StatusLevel::Warn, reason));
        PassOutcome::Stop
    }

    /// Convert a protocol/transport failure into an observation plus a
    /// bounded "try again" outcome.
    fn absorb_failure(&mut self, failure: PassFailure) -> PassOutcome {
        match &failure {
            PassFailure::Parse(err) => {
                let excerpt = self
                    .history
                    .last_assistant_text()
                    .map(parse::excerpt)
                    .unwrap_or_default();
                self.history.push_observation(ObservationKind::ParseFailure {
                    error: err.clone(),
                    excerpt,
                });
                self.emit(AgentEvent::Error {
                    message: failure.to_string(),
                });
            }
            PassFailure::Schema(errors) => {
                self.history
                    .push_observation(ObservationKind::SchemaValidationFailure {
                        errors: errors.clone(),
                    });
                self.emit(AgentEvent::SchemaValidationFailed {
                    errors: errors.clone(),
                });
            }
            PassFailure::Semantics(errors) => {
                self.history
                    .push_observation(ObservationKind::SemanticValidationFailure {
                        errors: errors.clone(),
                    });
                self.emit(AgentEvent::Error {
                    message: format!("{failure}: {}", errors.join("; ")),
                });
            }
            PassFailure::Transport(_) => {
                self.emit(AgentEvent::Error {
                    message: failure.to_string(),
                });
            }
        }

        self.recovery_attempts += 1;
        if self.recovery_attempts > self.config.max_consecutive_nudges {
            self.emit(AgentEvent::status(
                StatusLevel::Warn,
                "repeated protocol failures; stopping",
            ));
            return PassOutcome::Stop;
        }
        PassOutcome::Continue
    }

    fn emit(&self, event: AgentEvent) {
        self.deps.events.emit(event);
    }
}

fn command_label(command: &crate::plan::Command) -> String {
    let run = command.run.as_deref().unwrap_or("").trim();
    let mut label: String = run.chars().take(60).collect();
    if label.len() < run.len() {
        label.push('…');
    }
    if command.is_virtual() {
        format!("agent: {label}")
    } else {
        label
    }
}
