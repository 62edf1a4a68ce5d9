//! Runtime value model for the expression dialect.
//!
//! Authored expressions assume JavaScript semantics: a distinct `undefined`,
//! truthiness, loose numeric coercion, and string concatenation with `+`.
//! [`JsValue`] carries those semantics over the JSON substrate the rest of
//! the engine speaks. `undefined` exists only inside the evaluator; it
//! converts to JSON `null` at the boundary.

use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};

/// A value produced or consumed by the expression evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum JsValue {
    /// The distinguished `undefined` value (missing identifiers, safe navigation).
    Undefined,
    /// JavaScript `null`.
    Null,
    /// Boolean.
    Bool(bool),
    /// All numbers are IEEE 754 doubles, as in the source dialect.
    Number(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered array.
    Array(Vec<JsValue>),
    /// Insertion-ordered object.
    Object(IndexMap<String, JsValue>),
}

impl JsValue {
    /// Converts a JSON value into the evaluator's value model.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => JsValue::Null,
            JsonValue::Bool(flag) => JsValue::Bool(*flag),
            JsonValue::Number(number) => JsValue::Number(number.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(text) => JsValue::String(text.clone()),
            JsonValue::Array(items) => JsValue::Array(items.iter().map(JsValue::from_json).collect()),
            JsonValue::Object(entries) => {
                JsValue::Object(entries.iter().map(|(key, entry)| (key.clone(), JsValue::from_json(entry))).collect())
            }
        }
    }

    /// Converts back to JSON. `undefined` becomes `null`; non-finite numbers
    /// also become `null`, mirroring `JSON.stringify` behavior.
    pub fn into_json(self) -> JsonValue {
        match self {
            JsValue::Undefined | JsValue::Null => JsonValue::Null,
            JsValue::Bool(flag) => JsonValue::Bool(flag),
            JsValue::Number(number) => number_to_json(number),
            JsValue::String(text) => JsonValue::String(text),
            JsValue::Array(items) => JsonValue::Array(items.into_iter().map(JsValue::into_json).collect()),
            JsValue::Object(entries) => {
                let mut map = JsonMap::new();
                for (key, entry) in entries {
                    map.insert(key, entry.into_json());
                }
                JsonValue::Object(map)
            }
        }
    }

    /// JavaScript truthiness.
    pub fn is_truthy(&self) -> bool {
        match self {
            JsValue::Undefined | JsValue::Null => false,
            JsValue::Bool(flag) => *flag,
            JsValue::Number(number) => *number != 0.0 && !number.is_nan(),
            JsValue::String(text) => !text.is_empty(),
            JsValue::Array(_) | JsValue::Object(_) => true,
        }
    }

    /// `typeof` result for this value. Arrays and `null` report `object`.
    pub fn type_of(&self) -> &'static str {
        match self {
            JsValue::Undefined => "undefined",
            JsValue::Null | JsValue::Array(_) | JsValue::Object(_) => "object",
            JsValue::Bool(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::String(_) => "string",
        }
    }

    /// Numeric coercion (`ToNumber`): `null` is 0, `undefined` is NaN,
    /// booleans are 0/1, strings parse leniently.
    pub fn to_number(&self) -> f64 {
        match self {
            JsValue::Undefined => f64::NAN,
            JsValue::Null => 0.0,
            JsValue::Bool(flag) => {
                if *flag {
                    1.0
                } else {
                    0.0
                }
            }
            JsValue::Number(number) => *number,
            JsValue::String(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() { 0.0 } else { trimmed.parse::<f64>().unwrap_or(f64::NAN) }
            }
            JsValue::Array(items) if items.is_empty() => 0.0,
            JsValue::Array(items) if items.len() == 1 => items[0].to_number(),
            JsValue::Array(_) | JsValue::Object(_) => f64::NAN,
        }
    }

    /// String coercion (`ToString`), matching the dialect's display rules.
    pub fn to_display_string(&self) -> String {
        match self {
            JsValue::Undefined => "undefined".to_string(),
            JsValue::Null => "null".to_string(),
            JsValue::Bool(flag) => flag.to_string(),
            JsValue::Number(number) => format_number(*number),
            JsValue::String(text) => text.clone(),
            JsValue::Array(items) => items.iter().map(JsValue::to_display_string).collect::<Vec<_>>().join(","),
            JsValue::Object(_) => "[object Object]".to_string(),
        }
    }

    /// Loose equality (`==`): `null` and `undefined` are mutually equal,
    /// mixed number/string/boolean operands coerce numerically, and
    /// structured values compare structurally.
    pub fn loose_equals(&self, other: &JsValue) -> bool {
        use JsValue::*;
        match (self, other) {
            (Undefined | Null, Undefined | Null) => true,
            (Undefined | Null, _) | (_, Undefined | Null) => false,
            (Number(left), Number(right)) => left == right,
            (String(left), String(right)) => left == right,
            (Bool(left), Bool(right)) => left == right,
            (Array(_), Array(_)) | (Object(_), Object(_)) => self == other,
            (Number(_) | String(_) | Bool(_), Number(_) | String(_) | Bool(_)) => {
                let left = self.to_number();
                let right = other.to_number();
                left == right
            }
            _ => false,
        }
    }

    /// Strict equality (`===`): no coercion across types.
    pub fn strict_equals(&self, other: &JsValue) -> bool {
        use JsValue::*;
        match (self, other) {
            (Undefined, Undefined) | (Null, Null) => true,
            (Number(left), Number(right)) => left == right,
            (String(left), String(right)) => left == right,
            (Bool(left), Bool(right)) => left == right,
            (Array(_), Array(_)) | (Object(_), Object(_)) => self == other,
            _ => false,
        }
    }
}

fn number_to_json(number: f64) -> JsonValue {
    if !number.is_finite() {
        return JsonValue::Null;
    }
    if number.fract() == 0.0 && number.abs() < 9.007_199_254_740_992e15 {
        // Whole doubles round-trip as JSON integers so state stays readable.
        JsonValue::Number(JsonNumber::from(number as i64))
    } else {
        JsonNumber::from_f64(number).map(JsonValue::Number).unwrap_or(JsonValue::Null)
    }
}

/// Formats a double the way the source dialect prints it: integral values
/// without a trailing `.0`, non-finite values by name.
pub fn format_number(number: f64) -> String {
    if number.is_nan() {
        "NaN".to_string()
    } else if number.is_infinite() {
        if number > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else if number.fract() == 0.0 && number.abs() < 9.007_199_254_740_992e15 {
        format!("{}", number as i64)
    } else {
        format!("{number}")
    }
}
