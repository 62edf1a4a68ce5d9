//! Client-response ingestion: user input and agent responses.
//!
//! Client steps complete implicitly, but their results still flow back
//! through the engine so declared coercion, validation expressions, and
//! response schemas apply in one place. The helpers here take a
//! materialized step (as the caller received it) plus the reported value
//! and produce the state updates to apply.

use serde_json::Value as JsonValue;
use windlass_types::{MaterializedStep, StateUpdateSpec, WorkflowError, WorkflowResult};

use crate::expr::{Scope, evaluate_predicate};
use crate::schema::validate_response;

/// Coerces a reported `user_input` value to the step's declared
/// `input_type` and checks its `validation` expression.
///
/// The validation expression sees the candidate as both `user_input` and
/// `value` (both spellings appear in authored workflows). Returns the
/// coerced value ready for the step's `state_update`.
pub fn accept_user_input(step: &MaterializedStep, raw: JsonValue) -> WorkflowResult<JsonValue> {
    if step.r#type != "user_input" {
        return Err(WorkflowError::constraint_violation(format!(
            "step '{}' is not a user_input step",
            step.id
        ))
        .with_step(step.id.clone()));
    }

    let declared_type = step.definition.get("input_type").and_then(JsonValue::as_str).unwrap_or("string");
    let coerced = coerce_input(declared_type, raw, &step.id)?;

    if let Some(expression) = step.definition.get("validation").and_then(JsonValue::as_str) {
        let mut scope = Scope::new();
        scope.bind_json("user_input", &coerced);
        scope.bind_json("value", &coerced);
        let accepted = evaluate_predicate(expression, &scope).map_err(|error| WorkflowError::from(error).with_step(step.id.clone()))?;
        if !accepted {
            return Err(WorkflowError::constraint_violation(format!(
                "step '{}': input failed validation '{expression}'",
                step.id
            ))
            .with_step(step.id.clone()));
        }
    }

    Ok(coerced)
}

/// The state updates produced by a completed `user_input` step: its
/// declared `state_update` with the accepted value filled in.
pub fn user_input_updates(step: &MaterializedStep, accepted: JsonValue) -> Vec<StateUpdateSpec> {
    match step.definition.get("state_update").cloned().and_then(|value| serde_json::from_value::<StateUpdateSpec>(value).ok()) {
        Some(mut update) => {
            update.value = accepted;
            vec![update]
        }
        None => Vec::new(),
    }
}

/// Checks an `agent_response` payload against the step's `response_schema`
/// and materializes its `state_updates` with `response` fields substituted.
///
/// Update values reference the payload through `{{ response.* }}`; a
/// literal value passes through untouched.
pub fn accept_agent_response(step: &MaterializedStep, response: JsonValue) -> WorkflowResult<Vec<StateUpdateSpec>> {
    if step.r#type != "agent_response" {
        return Err(WorkflowError::constraint_violation(format!(
            "step '{}' is not an agent_response step",
            step.id
        ))
        .with_step(step.id.clone()));
    }

    if let Some(schema) = step.definition.get("response_schema") {
        validate_response(schema, &response).map_err(|error| error.with_step(step.id.clone()))?;
    }

    let mut updates: Vec<StateUpdateSpec> = step
        .definition
        .get("state_updates")
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default();

    let mut scope = Scope::new();
    scope.bind_json("response", &response);
    for update in &mut updates {
        update.value = crate::template::replace_variables(&update.value, &scope);
    }
    Ok(updates)
}

fn coerce_input(declared_type: &str, raw: JsonValue, step_id: &str) -> WorkflowResult<JsonValue> {
    let mismatch = |raw: &JsonValue| {
        Err(WorkflowError::constraint_violation(format!(
            "step '{step_id}': cannot interpret {} as {declared_type}",
            windlass_types::workflow::validation::json_type_name(raw)
        ))
        .with_step(step_id.to_string()))
    };

    match declared_type {
        "string" | "choice" => match raw {
            JsonValue::String(_) => Ok(raw),
            JsonValue::Number(number) => Ok(JsonValue::String(number.to_string())),
            JsonValue::Bool(flag) => Ok(JsonValue::String(flag.to_string())),
            other => mismatch(&other),
        },
        "number" => match &raw {
            JsonValue::Number(_) => Ok(raw),
            JsonValue::String(text) => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|parsed| {
                    if parsed.fract() == 0.0 && parsed.abs() < 9.007_199_254_740_992e15 {
                        Some(JsonValue::from(parsed as i64))
                    } else {
                        serde_json::Number::from_f64(parsed).map(JsonValue::Number)
                    }
                })
                .map(Ok)
                .unwrap_or_else(|| mismatch(&raw)),
            _ => mismatch(&raw),
        },
        "boolean" => match &raw {
            JsonValue::Bool(_) => Ok(raw),
            JsonValue::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Ok(JsonValue::Bool(true)),
                "false" | "no" | "n" | "0" => Ok(JsonValue::Bool(false)),
                _ => mismatch(&raw),
            },
            _ => mismatch(&raw),
        },
        "object" => {
            if raw.is_object() {
                Ok(raw)
            } else {
                mismatch(&raw)
            }
        }
        "array" => {
            if raw.is_array() {
                Ok(raw)
            } else {
                mismatch(&raw)
            }
        }
        // Unknown declared types pass through; schema-level rejection is the
        // validator's concern.
        _ => Ok(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use windlass_types::ErrorCode;

    fn input_step(definition: JsonValue) -> MaterializedStep {
        MaterializedStep {
            id: "ask".to_string(),
            r#type: "user_input".to_string(),
            definition,
        }
    }

    #[test]
    fn string_inputs_pass_and_numbers_stringify() {
        let step = input_step(json!({"prompt": "name?", "input_type": "string"}));
        assert_eq!(accept_user_input(&step, json!("alice")).unwrap(), json!("alice"));
        assert_eq!(accept_user_input(&step, json!(7)).unwrap(), json!("7"));
    }

    #[test]
    fn number_inputs_parse_from_strings() {
        let step = input_step(json!({"prompt": "count?", "input_type": "number"}));
        assert_eq!(accept_user_input(&step, json!("42")).unwrap(), json!(42));
        assert_eq!(accept_user_input(&step, json!("2.5")).unwrap(), json!(2.5));
        let error = accept_user_input(&step, json!("many")).unwrap_err();
        assert_eq!(error.code, ErrorCode::ConstraintViolation);
    }

    #[test]
    fn boolean_inputs_accept_common_spellings() {
        let step = input_step(json!({"prompt": "sure?", "input_type": "boolean"}));
        assert_eq!(accept_user_input(&step, json!("yes")).unwrap(), json!(true));
        assert_eq!(accept_user_input(&step, json!("0")).unwrap(), json!(false));
        assert!(accept_user_input(&step, json!("sometimes")).is_err());
    }

    #[test]
    fn validation_expression_gates_the_value() {
        let step = input_step(json!({
            "prompt": "password?",
            "input_type": "string",
            "validation": "user_input.length >= 8"
        }));
        assert!(accept_user_input(&step, json!("long enough")).is_ok());
        let error = accept_user_input(&step, json!("short")).unwrap_err();
        assert!(error.message.contains("failed validation"));
    }

    #[test]
    fn accepted_value_fills_the_declared_state_update() {
        let step = input_step(json!({
            "prompt": "name?",
            "state_update": {"path": "state.name", "value": null}
        }));
        let updates = user_input_updates(&step, json!("alice"));
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].path, "state.name");
        assert_eq!(updates[0].value, json!("alice"));
    }

    #[test]
    fn agent_response_checks_schema_and_substitutes_updates() {
        let step = MaterializedStep {
            id: "report".to_string(),
            r#type: "agent_response".to_string(),
            definition: json!({
                "response_schema": {"type": "object", "required": ["verdict"]},
                "state_updates": [
                    {"path": "state.verdict", "value": "{{ response.verdict }}"},
                    {"path": "state.raw_count", "value": 1}
                ]
            }),
        };
        let updates = accept_agent_response(&step, json!({"verdict": "pass"})).unwrap();
        assert_eq!(updates[0].value, json!("pass"));
        assert_eq!(updates[1].value, json!(1));

        let error = accept_agent_response(&step, json!({})).unwrap_err();
        assert_eq!(error.code, ErrorCode::ConstraintViolation);
        assert_eq!(error.step_id.as_deref(), Some("report"));
    }

    #[test]
    fn wrong_step_types_are_rejected() {
        let step = MaterializedStep {
            id: "msg".to_string(),
            r#type: "user_message".to_string(),
            definition: json!({"message": "hi"}),
        };
        assert!(accept_user_input(&step, json!("x")).is_err());
        assert!(accept_agent_response(&step, json!({})).is_err());
    }
}
