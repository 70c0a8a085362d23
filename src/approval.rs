//! Approval gate — unattended vs. human-gated command execution.
//!
//! Auto-approval sources, checked in order:
//! 1. the explicit auto-approve flag for the whole session,
//! 2. a static allowlist of known-safe binaries with subcommand and
//!    flag-pattern restrictions,
//! 3. an in-memory record of commands the human already approved for the
//!    rest of the session.
//!
//! Anything else escalates to the human decision port, which may block
//! indefinitely. Allowlist evaluation fails closed: multi-line commands,
//! shell metacharacters, `sudo`, unknown binaries, and denied flag patterns
//! all escalate.

use std::collections::HashSet;

use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::plan::Command;

/// Where an auto-approval came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalSource {
    Flag,
    Allowlist,
    Session,
    None,
}

impl ApprovalSource {
    pub fn label(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Allowlist => "allowlist",
            Self::Session => "session",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoApproval {
    pub approved: bool,
    pub source: ApprovalSource,
}

/// Outcome of a human decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HumanDecision {
    ApproveOnce,
    ApproveSession,
    Reject,
}

/// Port for the blocking human decision.
pub trait DecisionProvider: Send + Sync {
    fn request_decision(&self, command: &Command) -> Result<HumanDecision>;
}

/// Terminal prompt for approval decisions.
pub struct TerminalDecisionProvider;

impl DecisionProvider for TerminalDecisionProvider {
    fn request_decision(&self, command: &Command) -> Result<HumanDecision> {
        let run = command.run.as_deref().unwrap_or("").trim();
        let cwd = command.cwd.as_deref().unwrap_or(".");
        let reason = command.reason.as_deref().unwrap_or("(no reason given)");

        eprintln!("\nproposed command:\n  $ {run}\n  cwd: {cwd}\n  why: {reason}");
        let choice = dialoguer::Select::new()
            .with_prompt("run this command?")
            .items(&["approve once", "approve for this session", "reject"])
            .default(0)
            .interact()
            .context("approval prompt failed")?;

        Ok(match choice {
            0 => HumanDecision::ApproveOnce,
            1 => HumanDecision::ApproveSession,
            _ => HumanDecision::Reject,
        })
    }
}

/// One allowlist record: a binary, the subcommands it may take (empty set
/// means any), and flag patterns that force escalation anyway.
struct AllowRule {
    binary: &'static str,
    subcommands: &'static [&'static str],
    deny_flags: &'static [&'static str],
}

const ALLOW_RULES: &[AllowRule] = &[
    AllowRule { binary: "ls", subcommands: &[], deny_flags: &[] },
    AllowRule { binary: "cat", subcommands: &[], deny_flags: &[] },
    AllowRule { binary: "head", subcommands: &[], deny_flags: &[] },
    AllowRule { binary: "tail", subcommands: &[], deny_flags: &[] },
    AllowRule { binary: "wc", subcommands: &[], deny_flags: &[] },
    AllowRule { binary: "pwd", subcommands: &[], deny_flags: &[] },
    AllowRule { binary: "echo", subcommands: &[], deny_flags: &[] },
    AllowRule { binary: "which", subcommands: &[], deny_flags: &[] },
    AllowRule { binary: "uname", subcommands: &[], deny_flags: &[] },
    AllowRule { binary: "grep", subcommands: &[], deny_flags: &[] },
    AllowRule { binary: "rg", subcommands: &[], deny_flags: &[] },
    AllowRule { binary: "find", subcommands: &[], deny_flags: &[r"-delete|-exec"] },
    AllowRule {
        binary: "git",
        subcommands: &["status", "log", "diff", "show", "branch", "remote"],
        deny_flags: &[],
    },
    AllowRule {
        binary: "cargo",
        subcommands: &["check", "build", "test", "fmt", "clippy", "metadata", "tree"],
        deny_flags: &[],
    },
    AllowRule {
        binary: "curl",
        subcommands: &[],
        deny_flags: &[
            r"(?:^|\s)(?:-X|--request)\s*(?:POST|PUT|DELETE|PATCH)\b",
            r"(?:^|\s)(?:-d|--data\S*|-F|--form|-T|--upload-file)\b",
        ],
    },
];

/// Shell constructs the allowlist never auto-approves: redirection, pipes,
/// chaining, substitution, backgrounding.
const SHELL_METACHARACTERS: &[char] = &['|', '&', ';', '<', '>', '$', '`', '(', ')'];

/// SHA-256 signature of the trimmed `(shell, run, cwd)` triple. Timeouts and
/// output filters are excluded: re-running the same invocation with a longer
/// timeout is still the command the human approved.
pub fn command_signature(command: &Command) -> String {
    let (shell, run, cwd) = command.invocation();
    let mut hasher = Sha256::new();
    hasher.update(shell.as_bytes());
    hasher.update([0]);
    hasher.update(run.as_bytes());
    hasher.update([0]);
    hasher.update(cwd.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct ApprovalGate {
    auto_approve_all: bool,
    extra_binaries: Vec<String>,
    session_approvals: HashSet<String>,
}

impl ApprovalGate {
    /// `extra_binaries` extends the allowlist with operator-configured
    /// binaries (any subcommand, still subject to the metacharacter rules).
    pub fn new(auto_approve_all: bool, extra_binaries: Vec<String>) -> Self {
        Self {
            auto_approve_all,
            extra_binaries,
            session_approvals: HashSet::new(),
        }
    }

    pub fn should_auto_approve(&self, command: &Command) -> AutoApproval {
        if self.auto_approve_all {
            return AutoApproval {
                approved: true,
                source: ApprovalSource::Flag,
            };
        }
        if self.allowlisted(command) {
            return AutoApproval {
                approved: true,
                source: ApprovalSource::Allowlist,
            };
        }
        if self.session_approvals.contains(&command_signature(command)) {
            return AutoApproval {
                approved: true,
                source: ApprovalSource::Session,
            };
        }
        AutoApproval {
            approved: false,
            source: ApprovalSource::None,
        }
    }

    /// Record an `approve for this session` decision.
    pub fn record_session_approval(&mut self, command: &Command) {
        self.session_approvals.insert(command_signature(command));
    }

    fn allowlisted(&self, command: &Command) -> bool {
        // Virtual-agent commands have no shell semantics to inspect.
        if command.is_virtual() {
            return false;
        }
        let Some(run) = command.run.as_deref().map(str::trim) else {
            return false;
        };
        if run.is_empty() || run.contains('\n') {
            return false;
        }
        if run.contains(SHELL_METACHARACTERS) {
            return false;
        }

        let Ok(tokens) = shell_words::split(run) else {
            return false;
        };
        let Some(binary) = tokens.first() else {
            return false;
        };
        if binary == "sudo" {
            return false;
        }

        if self.extra_binaries.iter().any(|extra| extra == binary) {
            return true;
        }

        let Some(rule) = ALLOW_RULES.iter().find(|rule| rule.binary == binary) else {
            return false;
        };

        if !rule.subcommands.is_empty() {
            let subcommand = tokens
                .iter()
                .skip(1)
                .find(|token| !token.starts_with('-'));
            match subcommand {
                Some(sub) if rule.subcommands.contains(&sub.as_str()) => {}
                _ => return false,
            }
        }

        for pattern in rule.deny_flags {
            let re = Regex::new(pattern).expect("static allowlist pattern");
            if re.is_match(run) {
                return false;
            }
        }

        true
    }
}
