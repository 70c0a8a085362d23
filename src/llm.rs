//! Model completion port and the default HTTP adapter.
//!
//! The engine consumes completions through the `CompletionClient` trait; the
//! default adapter speaks an OpenAI-compatible `/chat/completions` endpoint
//! over blocking HTTP. Cancellation is checked before the request goes out;
//! an interrupt that lands mid-request surfaces as `Canceled` when the
//! response would otherwise be consumed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::history::ChatMessage;
use crate::pass::CancelFlag;

/// Outcome of one completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Success(String),
    Canceled,
    MissingContent,
}

pub trait CompletionClient: Send + Sync {
    fn complete(&self, messages: &[ChatMessage], model: &str) -> Result<CompletionOutcome>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct HttpCompletionClient {
    endpoint: String,
    api_key: Option<String>,
    cancel: CancelFlag,
    timeout: std::time::Duration,
}

impl HttpCompletionClient {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        cancel: CancelFlag,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            endpoint,
            api_key,
            cancel,
            timeout,
        }
    }
}

impl CompletionClient for HttpCompletionClient {
    fn complete(&self, messages: &[ChatMessage], model: &str) -> Result<CompletionOutcome> {
        if self.cancel.is_canceled() {
            return Ok(CompletionOutcome::Canceled);
        }

        let mut request = ureq::post(&self.endpoint)
            .timeout(self.timeout)
            .set("content-type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.set("authorization", &format!("Bearer {key}"));
        }

        let response = request
            .send_json(ChatRequest { model, messages })
            .with_context(|| format!("completion request to {} failed", self.endpoint))?;

        if self.cancel.is_canceled() {
            return Ok(CompletionOutcome::Canceled);
        }

        let parsed: ChatResponse = response
            .into_json()
            .context("completion response was not valid JSON")?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content);

        Ok(match content {
            Some(text) if !text.trim().is_empty() => CompletionOutcome::Success(text),
            _ => CompletionOutcome::MissingContent,
        })
    }
}
