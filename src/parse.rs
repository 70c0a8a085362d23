//! Model reply parsing.
//!
//! The assistant is asked to answer with a single JSON object, but real
//! replies arrive wrapped in code fences, prefixed with prose, or with
//! trailing commas. Parsing runs a bounded repair ladder before giving up:
//! 1. parse the text as-is,
//! 2. strip a markdown code fence,
//! 3. slice the outermost `{...}`,
//! 4. drop trailing commas and retry the best candidate.
//! Anything past that is a parse failure the model is asked to correct.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::plan::IncomingStep;

/// Typed shape of a parsed reply. Unknown extra fields at the root are
/// tolerated; the validators decide what is acceptable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplyShape {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub plan: Vec<IncomingStep>,
}

/// How many reply bytes are echoed back in a parse-failure observation.
const EXCERPT_BYTES: usize = 240;

pub fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= EXCERPT_BYTES {
        return trimmed.to_string();
    }
    let mut end = EXCERPT_BYTES;
    while end > 0 && !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}

/// Parse reply text into a JSON value via the repair ladder.
pub fn parse_reply_text(text: &str) -> Result<Value, String> {
    let mut last_error = String::new();

    for candidate in candidates(text) {
        match serde_json::from_str::<Value>(&candidate) {
            Ok(Value::Object(map)) => return Ok(Value::Object(map)),
            Ok(other) => last_error = format!("expected a JSON object, got {}", kind_of(&other)),
            Err(err) => last_error = err.to_string(),
        }
    }

    Err(last_error)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// The repair-ladder candidates, cheapest first, without duplicates.
fn candidates(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    push_candidate(&mut out, text.to_string());

    if let Some(unfenced) = strip_code_fence(text) {
        push_candidate(&mut out, unfenced.to_string());
    }

    if let Some(object) = outermost_object(text) {
        push_candidate(&mut out, object.to_string());
    }

    // Trailing-comma repair on every candidate gathered so far.
    let gathered: Vec<String> = out.clone();
    for candidate in gathered {
        push_candidate(&mut out, drop_trailing_commas(&candidate));
    }

    out
}

fn push_candidate(out: &mut Vec<String>, candidate: String) {
    let candidate = candidate.trim().to_string();
    if !candidate.is_empty() && !out.contains(&candidate) {
        out.push(candidate);
    }
}

fn strip_code_fence(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let start = trimmed.find("```")?;
    let after = &trimmed[start + 3..];
    // Skip a language tag like `json` on the fence line.
    let body_start = after.find('\n')?;
    let body = &after[body_start + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn drop_trailing_commas(text: &str) -> String {
    // A comma directly before a closing brace/bracket is never valid JSON;
    // string contents can contain the same shape, so only apply this as a
    // late repair rung.
    let re = Regex::new(r",\s*([}\]])").expect("static regex");
    re.replace_all(text, "$1").into_owned()
}

/// Deserialize a schema-validated value into the typed reply.
pub fn to_reply(value: Value) -> Result<ReplyShape, String> {
    serde_json::from_value(value).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json_parses_directly() {
        let value = parse_reply_text(r#"{"message": "hi", "plan": []}"#).unwrap();
        assert_eq!(value["message"], "hi");
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let text = "Here is the plan:\n```json\n{\"message\": \"ok\"}\n```\nthanks";
        let value = parse_reply_text(text).unwrap();
        assert_eq!(value["message"], "ok");
    }

    #[test]
    fn prose_around_an_object_is_sliced_away() {
        let text = "Sure! {\"message\": \"embedded\"} Hope that helps.";
        let value = parse_reply_text(text).unwrap();
        assert_eq!(value["message"], "embedded");
    }

    #[test]
    fn trailing_commas_are_repaired() {
        let text = r#"{"plan": [{"id": "a", "title": "t",},],}"#;
        let value = parse_reply_text(text).unwrap();
        assert_eq!(value["plan"][0]["id"], "a");
    }

    #[test]
    fn fenced_object_with_trailing_comma_needs_two_rungs() {
        let text = "```json\n{\"message\": \"x\",}\n```";
        let value = parse_reply_text(text).unwrap();
        assert_eq!(value["message"], "x");
    }

    #[test]
    fn non_object_json_is_rejected() {
        let err = parse_reply_text("[1, 2, 3]").unwrap_err();
        assert!(err.contains("expected a JSON object"), "{err}");
    }

    #[test]
    fn hopeless_text_reports_the_parser_error() {
        assert!(parse_reply_text("I will not produce JSON.").is_err());
    }

    #[test]
    fn typed_reply_tolerates_extra_root_fields() {
        let value = parse_reply_text(
            r#"{"message": "m", "confidence": 0.9, "plan": [{"id": "a", "command": {"run": "ls"}}]}"#,
        )
        .unwrap();
        let reply = to_reply(value).unwrap();
        assert_eq!(reply.message.as_deref(), Some("m"));
        assert_eq!(reply.plan.len(), 1);
        assert_eq!(
            reply.plan[0].command.as_ref().and_then(|c| c.run.as_deref()),
            Some("ls")
        );
    }

    #[test]
    fn excerpt_is_bounded() {
        let long = "x".repeat(1000);
        assert!(excerpt(&long).len() <= EXCERPT_BYTES + "…".len());
        assert_eq!(excerpt("short"), "short");
    }
}
