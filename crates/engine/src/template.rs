//! Variable replacement for step definitions.
//!
//! Walks any JSON-shaped value and substitutes `{{ expr }}` occurrences
//! against a scope built from the flattened state view. This is expression
//! interpolation only, not a templating language: no blocks, no filters.
//!
//! Replacement happens lazily, per step, immediately before the step is
//! emitted or processed, so each step observes state produced by earlier
//! steps in the same batch.

use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::warn;

use crate::expr::{ExprErrorKind, JsValue, Scope, evaluate};

/// Recursively replaces all `{{ ... }}` occurrences in a JSON value.
///
/// A string that is exactly one `{{ expr }}` with no surrounding text keeps
/// the evaluated value's type (`"{{ state.items }}"` yields an array). Any
/// surrounding text coerces every substitution to a string. References that
/// resolve to `undefined` (or fail to resolve) render as `<expr>`
/// placeholders so missing inputs surface to the caller instead of aborting
/// the workflow.
pub fn replace_variables(value: &JsonValue, scope: &Scope) -> JsonValue {
    match value {
        JsonValue::String(text) => replace_in_string(text, scope),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(|item| replace_variables(item, scope)).collect()),
        JsonValue::Object(entries) => {
            let mut replaced = JsonMap::new();
            for (key, entry) in entries {
                replaced.insert(key.clone(), replace_variables(entry, scope));
            }
            JsonValue::Object(replaced)
        }
        other => other.clone(),
    }
}

/// Replaces `{{ ... }}` occurrences in one string.
fn replace_in_string(input: &str, scope: &Scope) -> JsonValue {
    // Exact-match template: preserve the evaluated type.
    let trimmed = input.trim();
    if let Some(inner) = exact_template_expression(trimmed) {
        return match resolve(inner, scope) {
            Resolution::Value(value) => value.into_json(),
            Resolution::Unresolved(placeholder) => JsonValue::String(placeholder),
        };
    }

    let mut output = String::new();
    let mut remaining = input;
    let mut substituted = false;

    while let Some(open_offset) = remaining.find("{{") {
        let (before, after_open) = remaining.split_at(open_offset);
        output.push_str(before);
        match after_open.find("}}") {
            Some(close_offset) => {
                let expression = after_open[2..close_offset].trim();
                match resolve(expression, scope) {
                    Resolution::Value(value) => output.push_str(&value.to_display_string()),
                    Resolution::Unresolved(placeholder) => output.push_str(&placeholder),
                }
                substituted = true;
                remaining = &after_open[close_offset + 2..];
            }
            None => {
                // Unterminated marker; keep the rest verbatim.
                output.push_str(after_open);
                remaining = "";
            }
        }
    }

    if !substituted {
        return JsonValue::String(input.to_string());
    }
    output.push_str(remaining);
    JsonValue::String(output)
}

/// Returns the inner expression when the whole string is one `{{ expr }}`.
fn exact_template_expression(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("{{")?.strip_suffix("}}")?;
    // A second opener means the string holds multiple templates.
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

enum Resolution {
    Value(JsValue),
    Unresolved(String),
}

fn resolve(expression: &str, scope: &Scope) -> Resolution {
    match evaluate(expression, scope) {
        Ok(JsValue::Undefined) => Resolution::Unresolved(format!("<{expression}>")),
        Ok(value) => Resolution::Value(value),
        Err(error) => {
            if error.kind != ExprErrorKind::Reference {
                warn!(expression, %error, "template expression failed; rendering placeholder");
            }
            Resolution::Unresolved(format!("<{expression}>"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope_of(bindings: JsonValue) -> Scope {
        Scope::from_flattened(bindings.as_object().expect("object bindings"))
    }

    #[test]
    fn mixed_text_coerces_to_string() {
        let scope = scope_of(json!({"name": "Alice", "counter": 5}));
        let replaced = replace_variables(&json!("Hello {{ name }}, count is {{ counter }}"), &scope);
        assert_eq!(replaced, json!("Hello Alice, count is 5"));
    }

    #[test]
    fn exact_template_preserves_value_type() {
        let scope = scope_of(json!({"items": [1, 2, 3], "enabled": true, "limits": {"max": 9}}));
        assert_eq!(replace_variables(&json!("{{ items }}"), &scope), json!([1, 2, 3]));
        assert_eq!(replace_variables(&json!("{{ enabled }}"), &scope), json!(true));
        assert_eq!(replace_variables(&json!("{{ limits.max }}"), &scope), json!(9));
    }

    #[test]
    fn unresolved_references_render_placeholders() {
        let scope = scope_of(json!({}));
        assert_eq!(replace_variables(&json!("{{ state.missing }}"), &scope), json!("<state.missing>"));
        assert_eq!(
            replace_variables(&json!("value: {{ state.missing }}"), &scope),
            json!("value: <state.missing>")
        );
    }

    #[test]
    fn nested_structures_are_replaced_recursively() {
        let scope = scope_of(json!({"tool": "lint", "files": ["a.rs", "b.rs"]}));
        let definition = json!({
            "tool": "{{ tool }}",
            "parameters": {"targets": "{{ files }}", "label": "run {{ tool }}"},
            "retries": 2
        });
        let replaced = replace_variables(&definition, &scope);
        assert_eq!(replaced["tool"], json!("lint"));
        assert_eq!(replaced["parameters"]["targets"], json!(["a.rs", "b.rs"]));
        assert_eq!(replaced["parameters"]["label"], json!("run lint"));
        assert_eq!(replaced["retries"], json!(2));
    }

    #[test]
    fn expressions_inside_templates_are_evaluated() {
        let scope = scope_of(json!({"counter": 4}));
        assert_eq!(replace_variables(&json!("{{ counter * 2 }}"), &scope), json!(8));
        assert_eq!(
            replace_variables(&json!("{{ counter > 3 ? 'many' : 'few' }}"), &scope),
            json!("many")
        );
    }

    #[test]
    fn strings_without_templates_pass_through() {
        let scope = scope_of(json!({}));
        assert_eq!(replace_variables(&json!("plain text"), &scope), json!("plain text"));
        assert_eq!(replace_variables(&json!("unterminated {{ marker"), &scope), json!("unterminated {{ marker"));
    }

    #[test]
    fn multiple_templates_in_one_string_each_resolve() {
        let scope = scope_of(json!({"a": 1, "b": 2}));
        assert_eq!(replace_variables(&json!("{{ a }}+{{ b }}={{ a + b }}"), &scope), json!("1+2=3"));
    }
}
