//! Minimal response-schema checking for `agent_response` steps.
//!
//! The `response_schema` field accepts a small JSON-Schema-shaped subset:
//! `type`, `required`, `properties`, `items`, and `enum`. Checking is
//! depth-bounded so a malformed self-referential schema cannot hang the
//! engine; anything the subset does not express is accepted.

use serde_json::Value as JsonValue;
use windlass_types::{WorkflowError, WorkflowResult, workflow::validation::json_type_name};

const MAX_SCHEMA_DEPTH: usize = 64;

/// Validates a reported response against a `response_schema` value.
///
/// The schema location (`response.field.path`) is carried into error
/// messages so a failing ingest names the offending field.
pub fn validate_response(schema: &JsonValue, response: &JsonValue) -> WorkflowResult<()> {
    validate_at(schema, response, "response", 0)
}

fn validate_at(schema: &JsonValue, value: &JsonValue, location: &str, depth: usize) -> WorkflowResult<()> {
    if depth >= MAX_SCHEMA_DEPTH {
        return Ok(());
    }
    let Some(schema_object) = schema.as_object() else {
        // Non-object schemas carry no constraints.
        return Ok(());
    };

    if let Some(expected_type) = schema_object.get("type").and_then(JsonValue::as_str)
        && !type_matches(expected_type, value)
    {
        return Err(WorkflowError::constraint_violation(format!(
            "{location}: expected {expected_type}, got {}",
            json_type_name(value)
        ))
        .with_path(location.to_string()));
    }

    if let Some(allowed) = schema_object.get("enum").and_then(JsonValue::as_array)
        && !allowed.iter().any(|candidate| candidate == value)
    {
        return Err(WorkflowError::constraint_violation(format!("{location}: value is not one of the allowed literals"))
            .with_path(location.to_string()));
    }

    if let Some(required) = schema_object.get("required").and_then(JsonValue::as_array) {
        let fields = value.as_object();
        for name in required.iter().filter_map(JsonValue::as_str) {
            let present = fields.map(|map| map.contains_key(name)).unwrap_or(false);
            if !present {
                return Err(WorkflowError::constraint_violation(format!("{location}: missing required field '{name}'"))
                    .with_path(format!("{location}.{name}")));
            }
        }
    }

    if let Some(properties) = schema_object.get("properties").and_then(JsonValue::as_object)
        && let Some(fields) = value.as_object()
    {
        for (name, child_schema) in properties {
            if let Some(child_value) = fields.get(name) {
                validate_at(child_schema, child_value, &format!("{location}.{name}"), depth + 1)?;
            }
        }
    }

    if let Some(item_schema) = schema_object.get("items")
        && let Some(items) = value.as_array()
    {
        for (index, item) in items.iter().enumerate() {
            validate_at(item_schema, item, &format!("{location}[{index}]"), depth + 1)?;
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &JsonValue) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}
