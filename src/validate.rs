//! Reply validation — structural schema and plan-protocol checks.
//!
//! Validation is split the way the rest of the engine consumes it: a
//! structural pass over the raw JSON value (compiled JSON Schema) and a
//! semantic pass over the typed reply (plan size bound, unique ids, payload
//! requirements, running-step discipline). Both are ports so tests and
//! embedders can swap them out.

use serde_json::{Value, json};

use crate::parse::ReplyShape;

/// One structural violation, addressed by JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaVerdict {
    pub valid: bool,
    pub errors: Vec<SchemaIssue>,
}

pub trait SchemaValidator: Send + Sync {
    fn validate(&self, value: &Value) -> SchemaVerdict;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticVerdict {
    pub valid: bool,
    pub errors: Vec<String>,
}

pub trait SemanticValidator: Send + Sync {
    fn validate(&self, reply: &ReplyShape) -> SemanticVerdict;
}

/// Structural validator compiled from the embedded reply schema.
pub struct JsonSchemaValidator {
    validator: jsonschema::Validator,
}

impl JsonSchemaValidator {
    pub fn new() -> Self {
        let schema = reply_schema();
        let validator =
            jsonschema::validator_for(&schema).expect("embedded reply schema must compile");
        Self { validator }
    }
}

impl Default for JsonSchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaValidator for JsonSchemaValidator {
    fn validate(&self, value: &Value) -> SchemaVerdict {
        let errors: Vec<SchemaIssue> = self
            .validator
            .iter_errors(value)
            .map(|err| SchemaIssue {
                path: err.instance_path.to_string(),
                message: err.to_string(),
            })
            .collect();
        SchemaVerdict {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// The wire contract for one reply. Extra fields at the root are tolerated;
/// steps and commands are strict so typos surface as protocol errors
/// instead of silently dropped fields.
fn reply_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "message": { "type": ["string", "null"] },
            "plan": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["id"],
                    "additionalProperties": false,
                    "properties": {
                        "id": { "type": "string", "minLength": 1 },
                        "title": { "type": "string" },
                        "status": {
                            "enum": ["pending", "running", "completed", "failed", "abandoned"]
                        },
                        "waiting_for_id": {
                            "type": "array",
                            "items": { "type": "string" }
                        },
                        "priority": { "type": ["integer", "null"] },
                        "command": {
                            "type": ["object", "null"],
                            "additionalProperties": false,
                            "properties": {
                                "reason": { "type": ["string", "null"] },
                                "shell": { "type": ["string", "null"] },
                                "run": { "type": ["string", "null"] },
                                "cwd": { "type": ["string", "null"] },
                                "timeout_secs": { "type": ["integer", "null"], "minimum": 0 },
                                "filter_regex": { "type": ["string", "null"] },
                                "tail_lines": { "type": ["integer", "null"] },
                                "max_bytes": { "type": ["integer", "null"], "minimum": 0 },
                                "key": { "type": ["string", "null"] }
                            }
                        }
                    }
                }
            }
        }
    })
}

/// Plan-protocol validator.
pub struct PlanSemanticValidator {
    max_steps: usize,
}

impl PlanSemanticValidator {
    pub fn new(max_steps: usize) -> Self {
        Self { max_steps }
    }
}

impl SemanticValidator for PlanSemanticValidator {
    fn validate(&self, reply: &ReplyShape) -> SemanticVerdict {
        let mut errors = Vec::new();

        if reply.plan.len() > self.max_steps {
            errors.push(format!(
                "plan has {} steps; at most {} are allowed",
                reply.plan.len(),
                self.max_steps
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for step in &reply.plan {
            if !seen.insert(step.id.to_ascii_lowercase()) {
                errors.push(format!("duplicate step id `{}`", step.id));
            }
        }

        for step in &reply.plan {
            let open = step.status.is_none_or(|status| !status.is_terminal());
            let has_payload = step.command.as_ref().is_some_and(|c| c.has_payload());
            if open && !has_payload {
                errors.push(format!(
                    "open step `{}` carries no runnable command",
                    step.id
                ));
            }
        }

        // The first open step is the one about to execute; the model must
        // flag it running so renderers and resumed sessions agree on state.
        if let Some(first_open) = reply
            .plan
            .iter()
            .find(|step| step.status.is_none_or(|status| !status.is_terminal()))
            && first_open.status != Some(crate::plan::StepStatus::Running)
        {
            errors.push(format!(
                "first open step `{}` must have status `running`",
                first_open.id
            ));
        }

        SemanticVerdict {
            valid: errors.is_empty(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_reply_text;

    fn schema() -> JsonSchemaValidator {
        JsonSchemaValidator::new()
    }

    fn semantics() -> PlanSemanticValidator {
        PlanSemanticValidator::new(64)
    }

    fn reply(text: &str) -> ReplyShape {
        crate::parse::to_reply(parse_reply_text(text).unwrap()).unwrap()
    }

    #[test]
    fn valid_reply_passes_both_validators() {
        let text = r#"{
            "message": "working",
            "plan": [
                {"id": "probe", "title": "Probe", "status": "running",
                 "command": {"run": "ls -la", "timeout_secs": 30}},
                {"id": "next", "title": "Next", "status": "pending",
                 "waiting_for_id": ["probe"], "command": {"run": "cat out.txt"}}
            ]
        }"#;
        let value = parse_reply_text(text).unwrap();
        assert!(schema().validate(&value).valid);
        assert!(semantics().validate(&reply(text)).valid);
    }

    #[test]
    fn schema_rejects_missing_step_id() {
        let value = parse_reply_text(r#"{"plan": [{"title": "no id"}]}"#).unwrap();
        let verdict = schema().validate(&value);
        assert!(!verdict.valid);
        assert!(verdict.errors[0].path.contains("/plan/0"));
    }

    #[test]
    fn schema_rejects_unknown_step_fields() {
        let value =
            parse_reply_text(r#"{"plan": [{"id": "a", "comand": {"run": "ls"}}]}"#).unwrap();
        let verdict = schema().validate(&value);
        assert!(!verdict.valid);
    }

    #[test]
    fn schema_rejects_bad_status() {
        let value = parse_reply_text(r#"{"plan": [{"id": "a", "status": "done"}]}"#).unwrap();
        assert!(!schema().validate(&value).valid);
    }

    #[test]
    fn schema_tolerates_extra_root_fields() {
        let value = parse_reply_text(r#"{"message": "m", "confidence": 1, "plan": []}"#).unwrap();
        assert!(schema().validate(&value).valid);
    }

    #[test]
    fn semantics_rejects_oversized_plans() {
        let steps: Vec<String> = (0..3)
            .map(|i| format!(r#"{{"id": "s{i}", "status": "running", "command": {{"run": "x"}}}}"#))
            .collect();
        let text = format!(r#"{{"plan": [{}]}}"#, steps.join(","));
        let verdict = PlanSemanticValidator::new(2).validate(&reply(&text));
        assert!(!verdict.valid);
        assert!(verdict.errors[0].contains("at most 2"));
    }

    #[test]
    fn semantics_rejects_duplicate_ids_case_insensitively() {
        let text = r#"{"plan": [
            {"id": "Build", "status": "running", "command": {"run": "make"}},
            {"id": "build", "status": "pending", "command": {"run": "make"}}
        ]}"#;
        let verdict = semantics().validate(&reply(text));
        assert!(verdict.errors.iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn semantics_requires_payload_on_open_steps() {
        let text = r#"{"plan": [{"id": "a", "status": "running"}]}"#;
        let verdict = semantics().validate(&reply(text));
        assert!(verdict.errors.iter().any(|e| e.contains("no runnable command")));
    }

    #[test]
    fn semantics_requires_first_open_step_running() {
        let text = r#"{"plan": [
            {"id": "done", "status": "completed"},
            {"id": "a", "status": "pending", "command": {"run": "ls"}}
        ]}"#;
        let verdict = semantics().validate(&reply(text));
        assert!(
            verdict
                .errors
                .iter()
                .any(|e| e.contains("must have status `running`"))
        );
    }

    #[test]
    fn empty_plan_is_semantically_valid() {
        let verdict = semantics().validate(&reply(r#"{"message": "nothing to do"}"#));
        assert!(verdict.valid);
    }
}
