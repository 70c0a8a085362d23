//! Virtual agent executor — a bounded, isolated pass loop for one command.
//!
//! A step whose command has `shell: "agent"` delegates a self-contained
//! sub-task. The descriptor in `run` is either a JSON object
//! `{"prompt", "summary", "max_passes"}` or a bare prompt string. The
//! sub-agent gets a fresh history, runs unattended (auto-approval forced
//! on), persists nothing, and emits its events wrapped under a synthetic
//! label. Its whole transcript folds back into one synthetic command
//! result for the parent step.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tracing::debug;

use crate::events::LabeledEventSink;
use crate::history::{History, HistoryEntry, ObservationKind, Role};
use crate::parse;
use crate::pass::{Dependencies, LoopEnd, PassConfig, PassExecutor};
use crate::persist::NullPlanStore;
use crate::plan::{Command, CommandResult};
use crate::prompts;

const DEFAULT_SUMMARY_CHARS: usize = 48;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDescriptor {
    pub prompt: String,
    pub summary: String,
    pub max_passes: u32,
}

#[derive(Deserialize)]
struct DescriptorWire {
    prompt: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    max_passes: Option<u32>,
}

/// Parse the `run` field of a virtual command.
pub fn parse_descriptor(run: &str, default_max_passes: u32) -> Result<VirtualDescriptor, String> {
    let trimmed = run.trim();
    if trimmed.is_empty() {
        return Err("virtual agent command has an empty descriptor".to_string());
    }

    if trimmed.starts_with('{') {
        let wire: DescriptorWire = serde_json::from_str(trimmed)
            .map_err(|err| format!("virtual agent descriptor is not valid JSON: {err}"))?;
        let prompt = wire.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err("virtual agent descriptor has an empty prompt".to_string());
        }
        let summary = wire
            .summary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| summarize(&prompt));
        return Ok(VirtualDescriptor {
            prompt,
            summary,
            max_passes: wire.max_passes.unwrap_or(default_max_passes).max(1),
        });
    }

    Ok(VirtualDescriptor {
        prompt: trimmed.to_string(),
        summary: summarize(trimmed),
        max_passes: default_max_passes,
    })
}

fn summarize(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or(prompt);
    let mut summary: String = first_line.chars().take(DEFAULT_SUMMARY_CHARS).collect();
    if summary.len() < first_line.len() {
        summary.push('…');
    }
    summary
}

/// Decision port for sub-agents. Auto-approval is forced on, so this is
/// never consulted; if it somehow is, it fails closed.
struct UnattendedDecisions;

impl crate::approval::DecisionProvider for UnattendedDecisions {
    fn request_decision(&self, _: &Command) -> anyhow::Result<crate::approval::HumanDecision> {
        Ok(crate::approval::HumanDecision::Reject)
    }
}

/// Run one virtual command to a synthetic `CommandResult`.
pub fn execute_virtual(
    parent: &PassConfig,
    deps: &Dependencies,
    command: &Command,
) -> CommandResult {
    let started = Instant::now();
    let elapsed_ms = |started: Instant| started.elapsed().as_millis() as u64;

    let depth = parent.depth + 1;
    if depth > parent.subagent_max_depth {
        return CommandResult::from_error(
            &format!(
                "virtual agent refused: recursion depth {depth} exceeds the limit of {}",
                parent.subagent_max_depth
            ),
            elapsed_ms(started),
        );
    }

    let descriptor = match parse_descriptor(
        command.run.as_deref().unwrap_or(""),
        parent.subagent_max_passes,
    ) {
        Ok(descriptor) => descriptor,
        Err(err) => return CommandResult::from_error(&err, elapsed_ms(started)),
    };

    debug!(
        summary = %descriptor.summary,
        max_passes = descriptor.max_passes,
        depth,
        "starting virtual agent"
    );

    let label = format!("subagent:{}", descriptor.summary);
    let child_deps = Dependencies {
        decisions: Arc::new(UnattendedDecisions),
        store: Arc::new(NullPlanStore),
        events: Arc::new(LabeledEventSink::new(label, deps.events.clone())),
        ..deps.clone()
    };
    let child_config = PassConfig {
        auto_approve: true,
        extra_allowlist: Vec::new(),
        depth,
        ..parent.clone()
    };

    let system = format!(
        "{}\nYou are a delegated sub-agent. Accomplish this single task and report \
         your findings in your final message.",
        prompts::SYSTEM_PROMPT
    );
    let history = History::seeded(&system, &descriptor.prompt);

    let mut executor = PassExecutor::new(child_config, child_deps, history, None);
    let end = executor.run_to_completion(Some(descriptor.max_passes));
    let report = collect_report(&descriptor, executor.history());

    match (end, report) {
        (LoopEnd::CapReached, _) => CommandResult::from_error(
            &format!(
                "sub-agent `{}` hit the pass limit ({}) before finishing",
                descriptor.summary, descriptor.max_passes
            ),
            elapsed_ms(started),
        ),
        (LoopEnd::Stopped, None) => CommandResult::from_error(
            &format!("sub-agent `{}` produced no findings", descriptor.summary),
            elapsed_ms(started),
        ),
        (LoopEnd::Stopped, Some(stdout)) => CommandResult {
            stdout,
            stderr: String::new(),
            exit_code: Some(0),
            killed: false,
            runtime_ms: elapsed_ms(started),
        },
    }
}

/// Walk the sub-agent transcript: last assistant message plus every command
/// observation, combined into one report. `None` when there is nothing.
fn collect_report(descriptor: &VirtualDescriptor, history: &History) -> Option<String> {
    let mut last_message: Option<String> = None;
    let mut findings: Vec<String> = Vec::new();

    for entry in history.entries() {
        match entry {
            HistoryEntry::Chat(msg) if msg.role == Role::Assistant => {
                if let Ok(value) = parse::parse_reply_text(&msg.content)
                    && let Some(text) = value.get("message").and_then(|m| m.as_str())
                    && !text.trim().is_empty()
                {
                    last_message = Some(text.trim().to_string());
                }
            }
            HistoryEntry::Observation(ObservationKind::Command {
                step_id, output, ..
            }) => {
                let mut block = format!(
                    "[{step_id}] exit {}",
                    output
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "?".to_string())
                );
                if !output.stdout.is_empty() {
                    block.push('\n');
                    block.push_str(&output.stdout);
                }
                if !output.stderr.is_empty() {
                    block.push('\n');
                    block.push_str(&output.stderr);
                }
                findings.push(block);
            }
            _ => {}
        }
    }

    if last_message.is_none() && findings.is_empty() {
        return None;
    }

    let mut report = format!("sub-agent `{}` finished", descriptor.summary);
    if let Some(message) = last_message {
        report.push('\n');
        report.push_str(&message);
    }
    if !findings.is_empty() {
        report.push_str("\n\ncommand observations:\n");
        report.push_str(&findings.join("\n"));
    }
    Some(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AgentEvent, BufferEventSink};
    use crate::pass::test_support::{FixedClock, ScriptedCompletion, ScriptedRunner};
    use crate::pass::CancelFlag;
    use crate::usage::NoopUsageCounter;
    use crate::validate::{JsonSchemaValidator, PlanSemanticValidator};
    use serde_json::json;

    fn virtual_command(run: &str) -> Command {
        Command {
            shell: Some("agent".to_string()),
            run: Some(run.to_string()),
            ..Command::default()
        }
    }

    fn deps_with(
        completion: Arc<ScriptedCompletion>,
        runner: Arc<ScriptedRunner>,
        events: BufferEventSink,
    ) -> Dependencies {
        Dependencies {
            completion,
            runner,
            decisions: Arc::new(UnattendedDecisions),
            schema: Arc::new(JsonSchemaValidator::new()),
            semantics: Arc::new(PlanSemanticValidator::new(64)),
            store: Arc::new(NullPlanStore),
            events: Arc::new(events),
            usage: Arc::new(NoopUsageCounter),
            clock: Arc::new(FixedClock),
            cancel: CancelFlag::default(),
        }
    }

    #[test]
    fn descriptor_parses_json_and_bare_text() {
        let parsed = parse_descriptor(
            r#"{"prompt": "inspect the logs", "summary": "log check", "max_passes": 4}"#,
            10,
        )
        .unwrap();
        assert_eq!(parsed.summary, "log check");
        assert_eq!(parsed.max_passes, 4);

        let bare = parse_descriptor("find all TODO markers in src", 10).unwrap();
        assert_eq!(bare.prompt, "find all TODO markers in src");
        assert_eq!(bare.max_passes, 10);
        assert!(bare.summary.starts_with("find all TODO"));

        assert!(parse_descriptor("   ", 10).is_err());
        assert!(parse_descriptor(r#"{"prompt": ""}"#, 10).is_err());
    }

    #[test]
    fn successful_subagent_aggregates_message_and_observations() {
        let replies = vec![
            json!({
                "message": "looking",
                "plan": [{"id": "look", "status": "running", "command": {"run": "run-look"}}]
            }),
            json!({
                "message": "done: the answer is 42",
                "plan": [{"id": "look", "status": "completed", "command": {"run": "run-look"}}]
            }),
        ];
        let runner = Arc::new(ScriptedRunner::default());
        let events = BufferEventSink::new();
        let deps = deps_with(
            Arc::new(ScriptedCompletion::of_texts(replies)),
            runner.clone(),
            events.clone(),
        );

        let result = execute_virtual(
            &PassConfig::default(),
            &deps,
            &virtual_command("{\"prompt\": \"find the answer\", \"summary\": \"answer hunt\"}"),
        );

        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.contains("answer hunt"));
        assert!(result.stdout.contains("done: the answer is 42"));
        assert!(result.stdout.contains("[look] exit 0"));
        assert!(result.stdout.contains("ran run-look"));
        assert_eq!(runner.calls.lock().unwrap().as_slice(), ["run-look"]);

        // Every child event arrives wrapped under the sub-agent label.
        let wrapped = events
            .snapshot()
            .iter()
            .all(|e| matches!(e, AgentEvent::SubAgent { label, .. } if label == "subagent:answer hunt"));
        assert!(wrapped);
    }

    #[test]
    fn pass_cap_resolves_to_a_failed_result() {
        let step = |id: &str| {
            json!({
                "plan": [{"id": id, "status": "running", "command": {"run": format!("run-{id}")}}]
            })
        };
        // Always another executable step: the cap has to fire.
        let replies = vec![step("t1"), step("t2"), step("t3")];
        let runner = Arc::new(ScriptedRunner::default());
        let deps = deps_with(
            Arc::new(ScriptedCompletion::of_texts(replies)),
            runner,
            BufferEventSink::new(),
        );

        let command = virtual_command("{\"prompt\": \"loop\", \"max_passes\": 2}");
        let result = execute_virtual(&PassConfig::default(), &deps, &command);

        assert_eq!(result.exit_code, Some(1));
        assert!(result.stderr.contains("pass limit (2)"));
    }

    #[test]
    fn empty_transcript_is_a_failure() {
        // Immediate refusal-free stop: model returns no content at all.
        let deps = deps_with(
            Arc::new(ScriptedCompletion::new(vec![])),
            Arc::new(ScriptedRunner::default()),
            BufferEventSink::new(),
        );
        let result = execute_virtual(&PassConfig::default(), &deps, &virtual_command("do a thing"));
        assert_eq!(result.exit_code, Some(1));
        assert!(result.stderr.contains("no findings"));
    }

    #[test]
    fn recursion_depth_guard_fails_fast() {
        let deps = deps_with(
            Arc::new(ScriptedCompletion::new(vec![])),
            Arc::new(ScriptedRunner::default()),
            BufferEventSink::new(),
        );
        let parent = PassConfig {
            depth: 2,
            subagent_max_depth: 2,
            ..PassConfig::default()
        };
        let result = execute_virtual(&parent, &deps, &virtual_command("go deeper"));
        assert_eq!(result.exit_code, Some(1));
        assert!(result.stderr.contains("recursion depth"));
    }

    #[test]
    fn malformed_descriptor_fails_without_running() {
        let deps = deps_with(
            Arc::new(ScriptedCompletion::new(vec![])),
            Arc::new(ScriptedRunner::default()),
            BufferEventSink::new(),
        );
        let result = execute_virtual(
            &PassConfig::default(),
            &deps,
            &virtual_command("{\"prompt\": 42}"),
        );
        assert_eq!(result.exit_code, Some(1));
        assert!(result.stderr.contains("not valid JSON"));
    }
}
