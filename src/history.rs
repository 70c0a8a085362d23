//! Chat history and observation records.
//!
//! The running history is a typed list: plain chat turns plus structured
//! observation records (command outcomes, plan summaries, protocol
//! failures). Observations stay typed inside the engine and are serialized
//! to JSON only when the history is rendered for the completion transport.

use serde::{Deserialize, Serialize};

use crate::observation::LlmView;
use crate::plan::{Plan, StepStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// One step of a consolidated plan observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanObservationStep {
    pub id: String,
    pub title: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Machine-readable records fed back to the model as user turns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservationKind {
    /// Outcome of one executed command.
    Command {
        step_id: String,
        title: String,
        runtime_ms: u64,
        killed: bool,
        #[serde(flatten)]
        output: LlmView,
    },
    /// Consolidated plan state at the end of a pass.
    Plan { steps: Vec<PlanObservationStep> },
    /// The reply could not be parsed as JSON.
    ParseFailure { error: String, excerpt: String },
    /// The reply violated the structural schema.
    SchemaValidationFailure { errors: Vec<String> },
    /// The reply violated the plan protocol.
    SemanticValidationFailure { errors: Vec<String> },
    /// The pass was canceled before or during the completion request.
    Canceled { reason: String },
}

impl ObservationKind {
    pub fn plan_summary(plan: &Plan) -> Self {
        Self::Plan {
            steps: plan
                .steps()
                .iter()
                .map(|step| PlanObservationStep {
                    id: step.id.clone(),
                    title: step.title.clone(),
                    status: step.status,
                    exit_code: step
                        .observation
                        .as_ref()
                        .and_then(|obs| obs.for_llm.exit_code),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEntry {
    Chat(ChatMessage),
    Observation(ObservationKind),
}

/// The running conversation owned by one pass executor.
#[derive(Debug, Clone, Default)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    /// Seed a fresh history with the system prompt and the opening request.
    pub fn seeded(system: &str, user: &str) -> Self {
        let mut history = Self::default();
        history.push_chat(Role::System, system);
        history.push_chat(Role::User, user);
        history
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn push_chat(&mut self, role: Role, content: impl Into<String>) {
        self.entries.push(HistoryEntry::Chat(ChatMessage {
            role,
            content: content.into(),
        }));
    }

    pub fn push_observation(&mut self, observation: ObservationKind) {
        self.entries.push(HistoryEntry::Observation(observation));
    }

    /// Render for the completion transport. Observations become user turns
    /// carrying their JSON serialization; this is the only place they leave
    /// typed form.
    pub fn transport_messages(&self) -> Vec<ChatMessage> {
        self.entries
            .iter()
            .map(|entry| match entry {
                HistoryEntry::Chat(message) => message.clone(),
                HistoryEntry::Observation(observation) => ChatMessage {
                    role: Role::User,
                    content: serde_json::to_string(observation)
                        .unwrap_or_else(|_| "{\"kind\":\"unserializable\"}".to_string()),
                },
            })
            .collect()
    }

    /// Raw text of the most recent assistant turn.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.entries.iter().rev().find_map(|entry| match entry {
            HistoryEntry::Chat(ChatMessage {
                role: Role::Assistant,
                content,
            }) => Some(content.as_str()),
            _ => None,
        })
    }
}
