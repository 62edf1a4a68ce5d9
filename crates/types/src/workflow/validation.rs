//! Input value validation against declared input schemas.
//!
//! The engine validates caller-supplied inputs at `start`. These helpers stay
//! in the types crate so any loader-side preflight can apply the same checks
//! without depending on the engine.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::error::WorkflowError;
use crate::workflow::WorkflowInputDefinition;

static WORKFLOW_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*:[a-z0-9][a-z0-9_.-]*$").expect("workflow name pattern compiles"));

/// True when the name follows the `namespace:identifier` convention.
///
/// The engine accepts any non-empty name; canonical-form enforcement belongs
/// to the loader, which uses this check to warn on nonconforming names.
pub fn is_canonical_workflow_name(name: &str) -> bool {
    WORKFLOW_NAME_PATTERN.is_match(name)
}

/// Validates a candidate input value against its declaration.
///
/// Checks required presence and the declared primitive type. Expression-based
/// validation (`validation` on the declaration) is evaluated by the engine,
/// which owns the expression dialect.
pub fn validate_input_value(name: &str, definition: &WorkflowInputDefinition, candidate: Option<&JsonValue>) -> Result<(), WorkflowError> {
    let Some(value) = candidate else {
        if definition.required && definition.default.is_none() {
            return Err(WorkflowError::invalid_input(format!("required input '{name}' is missing")));
        }
        return Ok(());
    };

    let Some(declared_type) = definition.r#type.as_deref() else {
        return Ok(());
    };

    let matches_declared = match declared_type {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        // Unknown declared types are not enforced; the validator component
        // owns schema-level rejection of bad declarations.
        _ => true,
    };

    if !matches_declared {
        return Err(WorkflowError::invalid_input(format!(
            "input '{name}' expected type '{declared_type}', got {}",
            json_type_name(value)
        )));
    }

    Ok(())
}

/// Human-readable JSON type name used in validation messages.
pub fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
