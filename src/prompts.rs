//! Prompt texts and reply heuristics.
//!
//! The system prompt pins the JSON reply protocol the validators enforce.
//! The nudges are the two bounded retry policies the pass loop is allowed
//! to use: a "please continue" for bare refusals with no plan, and a
//! reminder when open steps exist but none can execute.

use std::sync::OnceLock;

use regex::Regex;

pub const SYSTEM_PROMPT: &str = r#"You are an autonomous command-execution agent. You accomplish the operator's goal by maintaining a plan of shell-command steps and reacting to their observed results.

Reply with a single JSON object, no prose outside it:

{
  "message": "short status for the operator",
  "plan": [
    {
      "id": "unique-step-id",
      "title": "what this step does",
      "status": "running",
      "waiting_for_id": ["ids of steps this one depends on"],
      "priority": 1,
      "command": {
        "reason": "why this command",
        "run": "the shell command",
        "cwd": "working directory (optional)",
        "timeout_secs": 60,
        "filter_regex": "keep only matching output lines (optional)",
        "tail_lines": 200,
        "max_bytes": 16384
      }
    }
  ]
}

Rules:
- Step ids are stable across replies; resend the full plan each time.
- Mark the first step you expect to run as "running"; leave the rest "pending".
- Statuses you receive back are authoritative; you cannot mark work done yourself.
- To retry a failed step, change its command. To delegate a self-contained
  sub-task, use "shell": "agent" and put the sub-task description in "run".
- When the goal is complete, reply with the final plan and a closing message.
"#;

pub const CONTINUE_NUDGE: &str =
    "Your last reply contained no plan and no actionable content. Continue working \
     toward the goal: reply with a JSON plan as specified.";

pub fn reminder_nudge(open_steps: usize) -> String {
    format!(
        "{open_steps} plan step(s) are still open but none can execute — each is either \
         missing a runnable command or waiting on a step that did not complete. Revise \
         the plan: fix dependencies, change failed commands, or abandon steps that no \
         longer matter."
    )
}

/// Heuristic for a bare refusal: a short reply that opens with a refusal
/// phrase. Only consulted when both the local and incoming plans are empty.
pub fn looks_like_refusal(text: &str) -> bool {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"(?i)^i('m| am) (sorry|afraid|unable)",
            r"(?i)^i can('|no)t\b",
            r"(?i)^i cannot\b",
            r"(?i)^(sorry|unfortunately)[,. ]",
            r"(?i)^i (won't|will not|refuse)",
            r"(?i)^as an ai\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static refusal pattern"))
        .collect()
    });

    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.len() > 400 {
        return false;
    }
    patterns.iter().any(|re| re.is_match(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusal_phrases_match() {
        assert!(looks_like_refusal("I'm sorry, I can't help with that."));
        assert!(looks_like_refusal("I cannot run shell commands."));
        assert!(looks_like_refusal("Sorry, that is outside my abilities."));
        assert!(looks_like_refusal("As an AI, I am not able to do this."));
    }

    #[test]
    fn working_replies_do_not_match() {
        assert!(!looks_like_refusal("Running the test suite next."));
        assert!(!looks_like_refusal("{\"message\": \"on it\", \"plan\": []}"));
        assert!(!looks_like_refusal(""));
    }

    #[test]
    fn long_prose_is_not_a_bare_refusal() {
        let long = format!("I can't do that. {}", "But here is context. ".repeat(40));
        assert!(!looks_like_refusal(&long));
    }

    #[test]
    fn reminder_names_the_open_count() {
        assert!(reminder_nudge(3).contains("3 plan step(s)"));
    }
}
