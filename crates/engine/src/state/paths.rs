//! Dot-path parsing and nested JSON mutation for state updates.
//!
//! Update paths name a tier and a field chain (`state.config.debug`). Only
//! `inputs.*` and `state.*` are writable; the legacy `raw.*` spelling is
//! normalized to `state.*` at the boundary. Paths are validated before any
//! tier is touched so a bad path rejects its whole batch.

use serde_json::{Map as JsonMap, Value as JsonValue};
use windlass_types::{UpdateOperation, WorkflowError};

/// Writable state tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableTier {
    Inputs,
    State,
}

/// A parsed, validated update path: target tier plus field segments.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPath {
    pub tier: WritableTier,
    pub segments: Vec<String>,
}

impl ParsedPath {
    /// Canonical rendering (`state.a.b`).
    pub fn canonical(&self) -> String {
        let tier = match self.tier {
            WritableTier::Inputs => "inputs",
            WritableTier::State => "state",
        };
        format!("{tier}.{}", self.segments.join("."))
    }
}

/// Parses and validates an update path.
///
/// Accepts `inputs.<field...>`, `state.<field...>`, and the legacy
/// `raw.<field...>` (normalized to `state`). Everything else, including a
/// bare tier name, empty segments, and `computed.*`, is `INVALID_PATH`.
pub fn parse_update_path(path: &str) -> Result<ParsedPath, WorkflowError> {
    let mut segments = path.split('.');
    let tier = match segments.next() {
        Some("inputs") => WritableTier::Inputs,
        Some("state") | Some("raw") => WritableTier::State,
        _ => return Err(WorkflowError::invalid_path(path)),
    };
    let fields: Vec<String> = segments.map(str::to_string).collect();
    if fields.is_empty() || fields.iter().any(String::is_empty) {
        return Err(WorkflowError::invalid_path(path));
    }
    Ok(ParsedPath { tier, segments: fields })
}

/// True when the path would be accepted by [`parse_update_path`].
pub fn is_writable_path(path: &str) -> bool {
    parse_update_path(path).is_ok()
}

/// Reads a field chain from a tier map. Missing intermediates yield `None`.
pub fn read_segments<'value>(root: &'value JsonMap<String, JsonValue>, segments: &[String]) -> Option<&'value JsonValue> {
    let (first, rest) = segments.split_first()?;
    let mut current = root.get(first)?;
    for segment in rest {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Applies one mutation at a field chain, creating intermediate objects.
pub fn apply_operation(
    root: &mut JsonMap<String, JsonValue>,
    path: &ParsedPath,
    operation: UpdateOperation,
    value: &JsonValue,
) -> Result<(), WorkflowError> {
    let slot = resolve_slot(root, &path.segments, path)?;
    match operation {
        UpdateOperation::Set => {
            *slot = value.clone();
        }
        UpdateOperation::Increment => {
            let current = match slot {
                JsonValue::Null => 0.0,
                JsonValue::Number(number) => number.as_f64().unwrap_or(0.0),
                other => {
                    return Err(WorkflowError::type_error(format!(
                        "cannot increment non-numeric value at '{}' (found {})",
                        path.canonical(),
                        type_name(other)
                    ))
                    .with_path(path.canonical()));
                }
            };
            let delta = match value {
                JsonValue::Null => 1.0,
                JsonValue::Number(number) => number.as_f64().unwrap_or(0.0),
                other => {
                    return Err(WorkflowError::type_error(format!(
                        "increment operand at '{}' must be a number (found {})",
                        path.canonical(),
                        type_name(other)
                    ))
                    .with_path(path.canonical()));
                }
            };
            *slot = number_value(current + delta);
        }
        UpdateOperation::Append => match slot {
            JsonValue::Array(items) => items.push(value.clone()),
            JsonValue::Null => *slot = JsonValue::Array(vec![value.clone()]),
            other => {
                return Err(WorkflowError::type_error(format!(
                    "cannot append to non-array value at '{}' (found {})",
                    path.canonical(),
                    type_name(other)
                ))
                .with_path(path.canonical()));
            }
        },
        UpdateOperation::Merge => {
            let JsonValue::Object(incoming) = value else {
                return Err(WorkflowError::type_error(format!(
                    "merge operand at '{}' must be an object (found {})",
                    path.canonical(),
                    type_name(value)
                ))
                .with_path(path.canonical()));
            };
            match slot {
                JsonValue::Object(existing) => {
                    for (key, entry) in incoming {
                        existing.insert(key.clone(), entry.clone());
                    }
                }
                JsonValue::Null => *slot = JsonValue::Object(incoming.clone()),
                other => {
                    return Err(WorkflowError::type_error(format!(
                        "cannot merge into non-object value at '{}' (found {})",
                        path.canonical(),
                        type_name(other)
                    ))
                    .with_path(path.canonical()));
                }
            }
        }
    }
    Ok(())
}

/// Walks to the target slot, materializing missing intermediates as objects.
fn resolve_slot<'map>(
    root: &'map mut JsonMap<String, JsonValue>,
    segments: &[String],
    path: &ParsedPath,
) -> Result<&'map mut JsonValue, WorkflowError> {
    let (last, intermediates) = segments.split_last().expect("validated paths have at least one segment");
    let mut current = root;
    for segment in intermediates {
        let entry = current.entry(segment.clone()).or_insert_with(|| JsonValue::Object(JsonMap::new()));
        current = match entry {
            JsonValue::Object(map) => map,
            other => {
                return Err(WorkflowError::type_error(format!(
                    "cannot descend through non-object value at segment '{segment}' of '{}' (found {})",
                    path.canonical(),
                    type_name(other)
                ))
                .with_path(path.canonical()));
            }
        };
    }
    Ok(current.entry(last.clone()).or_insert(JsonValue::Null))
}

fn number_value(number: f64) -> JsonValue {
    if number.fract() == 0.0 && number.abs() < 9.007_199_254_740_992e15 {
        JsonValue::Number(serde_json::Number::from(number as i64))
    } else {
        serde_json::Number::from_f64(number).map(JsonValue::Number).unwrap_or(JsonValue::Null)
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use windlass_types::ErrorCode;

    #[test]
    fn writable_paths_are_inputs_and_state_only() {
        assert!(is_writable_path("inputs.counter"));
        assert!(is_writable_path("state.version"));
        assert!(is_writable_path("inputs.user.name"));
        assert!(is_writable_path("state.config.debug"));
        assert!(is_writable_path("raw.counter"));

        assert!(!is_writable_path("computed.value"));
        assert!(!is_writable_path("invalid.path"));
        assert!(!is_writable_path("counter"));
        assert!(!is_writable_path(""));
    }

    #[test]
    fn path_validation_edge_cases() {
        assert!(!is_writable_path("inputs"));
        assert!(!is_writable_path("state"));
        assert!(!is_writable_path("inputs."));
        assert!(!is_writable_path("state."));
        assert!(!is_writable_path(".field"));
        assert!(!is_writable_path("inputs..field"));
    }

    #[test]
    fn raw_paths_normalize_to_state() {
        let parsed = parse_update_path("raw.counter").unwrap();
        assert_eq!(parsed.tier, WritableTier::State);
        assert_eq!(parsed.canonical(), "state.counter");
    }

    #[test]
    fn set_creates_nested_structure() {
        let mut root = JsonMap::new();
        let path = parse_update_path("state.config.debug").unwrap();
        apply_operation(&mut root, &path, UpdateOperation::Set, &json!(true)).unwrap();
        assert_eq!(root.get("config").unwrap(), &json!({"debug": true}));
    }

    #[test]
    fn increment_defaults_missing_to_zero_and_null_operand_to_one() {
        let mut root = JsonMap::new();
        let path = parse_update_path("state.counter").unwrap();
        apply_operation(&mut root, &path, UpdateOperation::Increment, &JsonValue::Null).unwrap();
        apply_operation(&mut root, &path, UpdateOperation::Increment, &json!(4)).unwrap();
        assert_eq!(root.get("counter").unwrap(), &json!(5));
    }

    #[test]
    fn increment_on_string_is_a_type_error() {
        let mut root = json!({"label": "x"}).as_object().unwrap().clone();
        let path = parse_update_path("state.label").unwrap();
        let error = apply_operation(&mut root, &path, UpdateOperation::Increment, &json!(1)).unwrap_err();
        assert_eq!(error.code, ErrorCode::TypeError);
    }

    #[test]
    fn append_creates_array_and_pushes() {
        let mut root = JsonMap::new();
        let path = parse_update_path("state.files").unwrap();
        apply_operation(&mut root, &path, UpdateOperation::Append, &json!("a.rs")).unwrap();
        apply_operation(&mut root, &path, UpdateOperation::Append, &json!("b.rs")).unwrap();
        assert_eq!(root.get("files").unwrap(), &json!(["a.rs", "b.rs"]));
    }

    #[test]
    fn merge_shallow_merges_objects() {
        let mut root = json!({"config": {"a": 1, "b": 2}}).as_object().unwrap().clone();
        let path = parse_update_path("state.config").unwrap();
        apply_operation(&mut root, &path, UpdateOperation::Merge, &json!({"b": 3, "c": 4})).unwrap();
        assert_eq!(root.get("config").unwrap(), &json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn read_segments_walks_nested_maps() {
        let root = json!({"user": {"name": "Alice"}}).as_object().unwrap().clone();
        let segments = vec!["user".to_string(), "name".to_string()];
        assert_eq!(read_segments(&root, &segments), Some(&json!("Alice")));
        let missing = vec!["user".to_string(), "age".to_string()];
        assert_eq!(read_segments(&root, &missing), None);
    }
}
