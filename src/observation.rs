//! Observation builder — bounded, filtered command output.
//!
//! Raw command output is never forwarded to the model as-is. This module:
//! - folds stderr into stdout on success so success does not look like failure,
//! - enforces a hard 50 KiB safety cutoff that discards runaway output,
//! - applies the per-command regex filter, tail cap, and byte cap in order,
//! - records which controls fired in a human-readable truncation notice,
//! - produces short head-fragment previews for UI display.
//!
//! Observations are only ever constructed here.

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::plan::{Command, CommandResult};

/// Combined stdout+stderr above this size is discarded outright.
pub const SAFETY_CUTOFF_BYTES: usize = 50 * 1024;

/// Replaces both streams when the safety cutoff fires.
pub const CORRUPTION_MARKER: &str =
    "[output discarded: combined stdout/stderr exceeded the 50 KiB safety cutoff; \
     re-run with a narrower command or a filter_regex]";

/// Tail cap applied when the command sets no explicit `tail_lines`.
pub const DEFAULT_TAIL_LINES: usize = 200;

/// Byte cap applied when the command sets no explicit `max_bytes`.
pub const DEFAULT_MAX_BYTES: usize = 16 * 1024;

const PREVIEW_MAX_BYTES: usize = 400;
const PREVIEW_MAX_LINES: usize = 8;

/// The sanitized view of a command outcome sent back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmView {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncation_notice: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub canceled_by_human: bool,
}

/// Execution metadata kept alongside the model-facing view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationMeta {
    pub runtime_ms: u64,
    pub killed: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub for_llm: LlmView,
    pub metadata: ObservationMeta,
}

/// Head fragments of the final streams, for UI display only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltObservation {
    pub preview: Preview,
    pub observation: Observation,
}

/// Build the observation for one executed command.
pub fn build(command: &Command, result: &CommandResult, now: DateTime<Utc>) -> BuiltObservation {
    let mut stdout = result.stdout.clone();
    let mut stderr = result.stderr.clone();
    let mut exit_code = result.exit_code;
    let mut notices: Vec<String> = Vec::new();
    let mut safety_fired = false;

    // Success with stderr noise: fold it into stdout.
    if exit_code == Some(0) && !stderr.is_empty() {
        if !stdout.is_empty() && !stdout.ends_with('\n') {
            stdout.push('\n');
        }
        stdout.push_str(&stderr);
        stderr.clear();
    }

    if stdout.len() + stderr.len() > SAFETY_CUTOFF_BYTES {
        stdout = CORRUPTION_MARKER.to_string();
        stderr = CORRUPTION_MARKER.to_string();
        exit_code = Some(1);
        safety_fired = true;
        notices.push(format!(
            "safety cutoff: combined output exceeded {SAFETY_CUTOFF_BYTES} bytes and was \
             discarded; narrow the command or set filter_regex to reduce output"
        ));
    } else {
        if let Some(pattern) = command.filter_regex.as_deref().filter(|p| !p.trim().is_empty()) {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => {
                    let before = (count_lines(&stdout), count_lines(&stderr));
                    stdout = filter_lines(&stdout, &re);
                    stderr = filter_lines(&stderr, &re);
                    let after = (count_lines(&stdout), count_lines(&stderr));
                    if after != before {
                        notices.push(format!(
                            "filter_regex `{pattern}` kept {} of {} lines; remove filter_regex \
                             to see unfiltered output",
                            after.0 + after.1,
                            before.0 + before.1
                        ));
                    }
                }
                Err(err) => {
                    warn!(pattern, %err, "invalid filter_regex; output left unfiltered");
                }
            }
        }

        let tail_cap = match command.tail_lines {
            Some(n) if n <= 0 => None,
            Some(n) => Some(n as usize),
            None => Some(DEFAULT_TAIL_LINES),
        };
        if let Some(cap) = tail_cap {
            let before = (count_lines(&stdout), count_lines(&stderr));
            stdout = tail_lines(&stdout, cap);
            stderr = tail_lines(&stderr, cap);
            let after = (count_lines(&stdout), count_lines(&stderr));
            if after != before {
                notices.push(format!(
                    "output limited to the last {cap} lines (tail_lines); set tail_lines to 0 \
                     to disable the line cap"
                ));
            }
        }

        let byte_cap = command.max_bytes.unwrap_or(DEFAULT_MAX_BYTES);
        if stdout.len() > byte_cap || stderr.len() > byte_cap {
            stdout = tail_bytes(&stdout, byte_cap).to_string();
            stderr = tail_bytes(&stderr, byte_cap).to_string();
            notices.push(format!(
                "output truncated to the last {byte_cap} bytes (max_bytes); raise max_bytes \
                 to see more"
            ));
        }
    }

    let truncated = safety_fired || !notices.is_empty();
    let truncation_notice = if notices.is_empty() {
        None
    } else {
        Some(notices.join(" "))
    };

    let preview = Preview {
        stdout: head_fragment(&stdout),
        stderr: head_fragment(&stderr),
    };

    BuiltObservation {
        preview,
        observation: Observation {
            for_llm: LlmView {
                stdout,
                stderr,
                exit_code,
                truncated,
                truncation_notice,
                canceled_by_human: false,
            },
            metadata: ObservationMeta {
                runtime_ms: result.runtime_ms,
                killed: result.killed,
                timestamp: now,
            },
        },
    }
}

/// Observation recorded when a human rejects a proposed command.
pub fn cancellation(reason: &str, now: DateTime<Utc>) -> Observation {
    Observation {
        for_llm: LlmView {
            stdout: String::new(),
            stderr: reason.to_string(),
            exit_code: Some(1),
            truncated: false,
            truncation_notice: None,
            canceled_by_human: true,
        },
        metadata: ObservationMeta {
            runtime_ms: 0,
            killed: false,
            timestamp: now,
        },
    }
}

fn count_lines(text: &str) -> usize {
    if text.is_empty() { 0 } else { text.lines().count() }
}

fn filter_lines(text: &str, re: &regex::Regex) -> String {
    if text.is_empty() {
        return String::new();
    }
    let kept: Vec<&str> = text.lines().filter(|line| re.is_match(line)).collect();
    kept.join("\n")
}

fn tail_lines(text: &str, cap: usize) -> String {
    let total = count_lines(text);
    if total <= cap {
        return text.to_string();
    }
    let kept: Vec<&str> = text.lines().skip(total - cap).collect();
    kept.join("\n")
}

/// Keep the last `cap` bytes, moving forward to the next char boundary.
fn tail_bytes(text: &str, cap: usize) -> &str {
    if text.len() <= cap {
        return text;
    }
    let mut start = text.len() - cap;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

fn head_fragment(text: &str) -> String {
    let mut fragment: String = text
        .lines()
        .take(PREVIEW_MAX_LINES)
        .collect::<Vec<_>>()
        .join("\n");
    if fragment.len() > PREVIEW_MAX_BYTES {
        let mut end = PREVIEW_MAX_BYTES;
        while end > 0 && !fragment.is_char_boundary(end) {
            end -= 1;
        }
        fragment.truncate(end);
    }
    fragment
}
