//! Tree-walking evaluator for parsed expressions.
//!
//! Evaluation is total over the documented dialect: missing identifiers read
//! as `undefined`, member access on `undefined`/`null` yields `undefined`
//! (safe navigation), and numeric edge cases follow IEEE 754. The only
//! evaluation-time failures are type errors (calling a non-function, unknown
//! method) and reference errors (calling an unknown bare function).

use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Value as JsonValue};

use super::parser::{BinaryOp, Expr, LogicalOp, UnaryOp};
use super::value::{JsValue, format_number};
use super::{ExprError, ExprErrorKind};

/// Name-to-value bindings visible to an expression.
///
/// Built from the flattened state view plus any frame-local bindings
/// (`item`, `loop`, `attempt_number`). Later bindings shadow earlier ones.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    bindings: IndexMap<String, JsValue>,
}

impl Scope {
    /// Empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a scope from a flattened JSON view.
    pub fn from_flattened(view: &JsonMap<String, JsonValue>) -> Self {
        let mut scope = Self::new();
        for (name, value) in view {
            scope.bindings.insert(name.clone(), JsValue::from_json(value));
        }
        scope
    }

    /// Binds or shadows a name.
    pub fn bind(&mut self, name: impl Into<String>, value: JsValue) {
        self.bindings.insert(name.into(), value);
    }

    /// Binds a JSON value directly.
    pub fn bind_json(&mut self, name: impl Into<String>, value: &JsonValue) {
        self.bindings.insert(name.into(), JsValue::from_json(value));
    }

    fn lookup(&self, name: &str) -> Option<&JsValue> {
        self.bindings.get(name)
    }
}

/// Evaluates a parsed expression against a scope.
pub fn evaluate_ast(expression: &Expr, scope: &Scope, source: &str) -> Result<JsValue, ExprError> {
    let mut evaluator = Evaluator {
        source,
        locals: Vec::new(),
    };
    evaluator.eval(expression, scope)
}

struct Evaluator<'source> {
    source: &'source str,
    /// Arrow-parameter frames, innermost last.
    locals: Vec<IndexMap<String, JsValue>>,
}

impl<'source> Evaluator<'source> {
    fn type_error(&self, message: impl Into<String>) -> ExprError {
        ExprError::new(ExprErrorKind::Type, message, self.source)
    }

    fn reference_error(&self, message: impl Into<String>) -> ExprError {
        ExprError::new(ExprErrorKind::Reference, message, self.source)
    }

    fn lookup(&self, scope: &Scope, name: &str) -> Option<JsValue> {
        for frame in self.locals.iter().rev() {
            if let Some(value) = frame.get(name) {
                return Some(value.clone());
            }
        }
        scope.lookup(name).cloned()
    }

    fn eval(&mut self, expression: &Expr, scope: &Scope) -> Result<JsValue, ExprError> {
        match expression {
            Expr::NumberLiteral(number) => Ok(JsValue::Number(*number)),
            Expr::StringLiteral(text) => Ok(JsValue::String(text.clone())),
            Expr::BoolLiteral(flag) => Ok(JsValue::Bool(*flag)),
            Expr::NullLiteral => Ok(JsValue::Null),
            Expr::UndefinedLiteral => Ok(JsValue::Undefined),
            Expr::Identifier(name) => Ok(self.lookup(scope, name).unwrap_or(JsValue::Undefined)),
            Expr::ArrayLiteral(elements) => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(self.eval(element, scope)?);
                }
                Ok(JsValue::Array(values))
            }
            Expr::ObjectLiteral(entries) => {
                let mut object = IndexMap::new();
                for (key, value_expression) in entries {
                    object.insert(key.clone(), self.eval(value_expression, scope)?);
                }
                Ok(JsValue::Object(object))
            }
            Expr::Member { object, property } => {
                // Namespace constants resolve before generic member access.
                if let Expr::Identifier(namespace) = object.as_ref()
                    && self.lookup(scope, namespace).is_none()
                    && let Some(constant) = namespace_constant(namespace, property)
                {
                    return Ok(constant);
                }
                let target = self.eval(object, scope)?;
                Ok(read_property(&target, property))
            }
            Expr::Index { object, index } => {
                let target = self.eval(object, scope)?;
                let key = self.eval(index, scope)?;
                Ok(read_index(&target, &key))
            }
            Expr::Call { callee, arguments } => self.eval_call(callee, arguments, scope),
            Expr::Unary { operator, operand } => {
                let value = self.eval(operand, scope)?;
                Ok(match operator {
                    UnaryOp::Not => JsValue::Bool(!value.is_truthy()),
                    UnaryOp::Negate => JsValue::Number(-value.to_number()),
                    UnaryOp::Plus => JsValue::Number(value.to_number()),
                    UnaryOp::Typeof => JsValue::String(value.type_of().to_string()),
                })
            }
            Expr::Binary { operator, left, right } => {
                let left_value = self.eval(left, scope)?;
                let right_value = self.eval(right, scope)?;
                Ok(apply_binary(*operator, &left_value, &right_value))
            }
            Expr::Logical { operator, left, right } => {
                let left_value = self.eval(left, scope)?;
                match operator {
                    LogicalOp::And => {
                        if left_value.is_truthy() {
                            self.eval(right, scope)
                        } else {
                            Ok(left_value)
                        }
                    }
                    LogicalOp::Or => {
                        if left_value.is_truthy() {
                            Ok(left_value)
                        } else {
                            self.eval(right, scope)
                        }
                    }
                }
            }
            Expr::Conditional { test, consequent, alternate } => {
                let test_value = self.eval(test, scope)?;
                if test_value.is_truthy() {
                    self.eval(consequent, scope)
                } else {
                    self.eval(alternate, scope)
                }
            }
            Expr::Arrow { .. } => Err(self.type_error("functions are only allowed as method callbacks")),
        }
    }

    fn eval_call(&mut self, callee: &Expr, arguments: &[Expr], scope: &Scope) -> Result<JsValue, ExprError> {
        match callee {
            Expr::Member { object, property } => {
                // Namespace functions: Math.floor(x), JSON.parse(s), Date.now().
                if let Expr::Identifier(namespace) = object.as_ref()
                    && self.lookup(scope, namespace).is_none()
                    && is_namespace(namespace)
                {
                    let values = self.eval_arguments(arguments, scope)?;
                    return self.call_namespace(namespace, property, values);
                }
                let target = self.eval(object, scope)?;
                self.call_method(&target, property, arguments, scope)
            }
            Expr::Identifier(name) => {
                let values = self.eval_arguments(arguments, scope)?;
                match name.as_str() {
                    "parseInt" => Ok(builtin_parse_int(&values)),
                    "parseFloat" => Ok(builtin_parse_float(&values)),
                    "String" => Ok(JsValue::String(values.first().map(JsValue::to_display_string).unwrap_or_default())),
                    "Number" => Ok(JsValue::Number(values.first().map(JsValue::to_number).unwrap_or(f64::NAN))),
                    "Boolean" => Ok(JsValue::Bool(values.first().map(JsValue::is_truthy).unwrap_or(false))),
                    other => {
                        if self.lookup(scope, other).is_some() {
                            Err(self.type_error(format!("'{other}' is not a function")))
                        } else {
                            Err(self.reference_error(format!("'{other}' is not defined")))
                        }
                    }
                }
            }
            _ => Err(self.type_error("expression is not callable")),
        }
    }

    fn eval_arguments(&mut self, arguments: &[Expr], scope: &Scope) -> Result<Vec<JsValue>, ExprError> {
        let mut values = Vec::with_capacity(arguments.len());
        for argument in arguments {
            values.push(self.eval(argument, scope)?);
        }
        Ok(values)
    }

    fn call_namespace(&self, namespace: &str, function: &str, arguments: Vec<JsValue>) -> Result<JsValue, ExprError> {
        match namespace {
            "Math" => call_math(function, &arguments).ok_or_else(|| self.type_error(format!("Math.{function} is not a function"))),
            "JSON" => match function {
                "parse" => {
                    let text = arguments.first().map(JsValue::to_display_string).unwrap_or_default();
                    match serde_json::from_str::<JsonValue>(&text) {
                        Ok(parsed) => Ok(JsValue::from_json(&parsed)),
                        Err(parse_error) => Err(ExprError::new(
                            ExprErrorKind::Syntax,
                            format!("JSON.parse: {parse_error}"),
                            self.source,
                        )),
                    }
                }
                "stringify" => {
                    let value = arguments.into_iter().next().unwrap_or(JsValue::Undefined);
                    if matches!(value, JsValue::Undefined) {
                        return Ok(JsValue::Undefined);
                    }
                    let json = value.into_json();
                    Ok(JsValue::String(serde_json::to_string(&json).unwrap_or_else(|_| "null".to_string())))
                }
                other => Err(self.type_error(format!("JSON.{other} is not a function"))),
            },
            "Date" => match function {
                "now" => Ok(JsValue::Number(chrono::Utc::now().timestamp_millis() as f64)),
                "parse" => {
                    let text = arguments.first().map(JsValue::to_display_string).unwrap_or_default();
                    Ok(JsValue::Number(parse_date_millis(&text)))
                }
                other => Err(self.type_error(format!("Date.{other} is not a function"))),
            },
            _ => Err(self.reference_error(format!("'{namespace}' is not defined"))),
        }
    }

    fn call_method(&mut self, target: &JsValue, method: &str, arguments: &[Expr], scope: &Scope) -> Result<JsValue, ExprError> {
        match target {
            JsValue::Undefined | JsValue::Null => {
                Err(self.type_error(format!("cannot call '{method}' on {}", target.to_display_string())))
            }
            JsValue::String(text) => self.call_string_method(text, method, arguments, scope),
            JsValue::Array(items) => self.call_array_method(items, method, arguments, scope),
            JsValue::Number(number) => match method {
                "toFixed" => {
                    let digits = self.eval_first_number(arguments, scope)?.unwrap_or(0.0).max(0.0) as usize;
                    Ok(JsValue::String(format!("{number:.digits$}")))
                }
                "toString" => Ok(JsValue::String(format_number(*number))),
                other => Err(self.type_error(format!("'{other}' is not a number method"))),
            },
            JsValue::Bool(_) | JsValue::Object(_) => match method {
                "toString" => Ok(JsValue::String(target.to_display_string())),
                other => Err(self.type_error(format!("'{other}' is not a method of {}", target.type_of()))),
            },
        }
    }

    fn eval_first_number(&mut self, arguments: &[Expr], scope: &Scope) -> Result<Option<f64>, ExprError> {
        match arguments.first() {
            None => Ok(None),
            Some(expression) => Ok(Some(self.eval(expression, scope)?.to_number())),
        }
    }

    fn call_string_method(&mut self, text: &str, method: &str, arguments: &[Expr], scope: &Scope) -> Result<JsValue, ExprError> {
        let mut plain_argument = |evaluator: &mut Self, index: usize| -> Result<JsValue, ExprError> {
            match arguments.get(index) {
                None => Ok(JsValue::Undefined),
                Some(expression) => evaluator.eval(expression, scope),
            }
        };

        match method {
            "includes" => {
                let needle = plain_argument(self, 0)?.to_display_string();
                Ok(JsValue::Bool(text.contains(&needle)))
            }
            "startsWith" => {
                let prefix = plain_argument(self, 0)?.to_display_string();
                Ok(JsValue::Bool(text.starts_with(&prefix)))
            }
            "endsWith" => {
                let suffix = plain_argument(self, 0)?.to_display_string();
                Ok(JsValue::Bool(text.ends_with(&suffix)))
            }
            "indexOf" => {
                let needle = plain_argument(self, 0)?.to_display_string();
                let position = text.find(&needle).map(|byte| text[..byte].chars().count() as f64).unwrap_or(-1.0);
                Ok(JsValue::Number(position))
            }
            "split" => {
                let separator = plain_argument(self, 0)?;
                if matches!(separator, JsValue::Undefined) {
                    return Ok(JsValue::Array(vec![JsValue::String(text.to_string())]));
                }
                let separator = separator.to_display_string();
                let parts: Vec<JsValue> = if separator.is_empty() {
                    text.chars().map(|character| JsValue::String(character.to_string())).collect()
                } else {
                    text.split(&separator).map(|part| JsValue::String(part.to_string())).collect()
                };
                Ok(JsValue::Array(parts))
            }
            "match" => {
                let pattern = plain_argument(self, 0)?.to_display_string();
                match regex::Regex::new(&pattern) {
                    Err(compile_error) => Err(ExprError::new(
                        ExprErrorKind::Syntax,
                        format!("invalid pattern in match(): {compile_error}"),
                        self.source,
                    )),
                    Ok(compiled) => match compiled.captures(text) {
                        None => Ok(JsValue::Null),
                        Some(captures) => {
                            let groups = captures
                                .iter()
                                .map(|group| {
                                    group
                                        .map(|matched| JsValue::String(matched.as_str().to_string()))
                                        .unwrap_or(JsValue::Undefined)
                                })
                                .collect();
                            Ok(JsValue::Array(groups))
                        }
                    },
                }
            }
            "replace" => {
                let needle = plain_argument(self, 0)?.to_display_string();
                let replacement = plain_argument(self, 1)?.to_display_string();
                Ok(JsValue::String(text.replacen(&needle, &replacement, 1)))
            }
            "toLowerCase" => Ok(JsValue::String(text.to_lowercase())),
            "toUpperCase" => Ok(JsValue::String(text.to_uppercase())),
            "trim" => Ok(JsValue::String(text.trim().to_string())),
            "charAt" => {
                let index = plain_argument(self, 0)?.to_number();
                let character = if index >= 0.0 { text.chars().nth(index as usize) } else { None };
                Ok(JsValue::String(character.map(String::from).unwrap_or_default()))
            }
            "slice" => {
                let characters: Vec<char> = text.chars().collect();
                let (start, end) = self.slice_bounds(arguments, scope, characters.len())?;
                Ok(JsValue::String(characters[start..end].iter().collect()))
            }
            "concat" => {
                let mut combined = text.to_string();
                for index in 0..arguments.len() {
                    combined.push_str(&plain_argument(self, index)?.to_display_string());
                }
                Ok(JsValue::String(combined))
            }
            other => Err(self.type_error(format!("'{other}' is not a string method"))),
        }
    }

    fn call_array_method(&mut self, items: &[JsValue], method: &str, arguments: &[Expr], scope: &Scope) -> Result<JsValue, ExprError> {
        match method {
            "includes" => {
                let needle = match arguments.first() {
                    None => JsValue::Undefined,
                    Some(expression) => self.eval(expression, scope)?,
                };
                Ok(JsValue::Bool(items.iter().any(|item| item.strict_equals(&needle))))
            }
            "indexOf" => {
                let needle = match arguments.first() {
                    None => JsValue::Undefined,
                    Some(expression) => self.eval(expression, scope)?,
                };
                let position = items
                    .iter()
                    .position(|item| item.strict_equals(&needle))
                    .map(|index| index as f64)
                    .unwrap_or(-1.0);
                Ok(JsValue::Number(position))
            }
            "join" => {
                let separator = match arguments.first() {
                    None => ",".to_string(),
                    Some(expression) => self.eval(expression, scope)?.to_display_string(),
                };
                let joined = items.iter().map(JsValue::to_display_string).collect::<Vec<_>>().join(&separator);
                Ok(JsValue::String(joined))
            }
            "slice" => {
                let (start, end) = self.slice_bounds(arguments, scope, items.len())?;
                Ok(JsValue::Array(items[start..end].to_vec()))
            }
            "concat" => {
                let mut combined = items.to_vec();
                for expression in arguments {
                    match self.eval(expression, scope)? {
                        JsValue::Array(more) => combined.extend(more),
                        single => combined.push(single),
                    }
                }
                Ok(JsValue::Array(combined))
            }
            "map" => {
                let callback = self.expect_callback(arguments, "map")?;
                let mut mapped = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    mapped.push(self.invoke_callback(callback, &[item.clone(), JsValue::Number(index as f64)], scope)?);
                }
                Ok(JsValue::Array(mapped))
            }
            "filter" => {
                let callback = self.expect_callback(arguments, "filter")?;
                let mut kept = Vec::new();
                for (index, item) in items.iter().enumerate() {
                    if self
                        .invoke_callback(callback, &[item.clone(), JsValue::Number(index as f64)], scope)?
                        .is_truthy()
                    {
                        kept.push(item.clone());
                    }
                }
                Ok(JsValue::Array(kept))
            }
            "find" => {
                let callback = self.expect_callback(arguments, "find")?;
                for (index, item) in items.iter().enumerate() {
                    if self
                        .invoke_callback(callback, &[item.clone(), JsValue::Number(index as f64)], scope)?
                        .is_truthy()
                    {
                        return Ok(item.clone());
                    }
                }
                Ok(JsValue::Undefined)
            }
            "every" => {
                let callback = self.expect_callback(arguments, "every")?;
                for (index, item) in items.iter().enumerate() {
                    if !self
                        .invoke_callback(callback, &[item.clone(), JsValue::Number(index as f64)], scope)?
                        .is_truthy()
                    {
                        return Ok(JsValue::Bool(false));
                    }
                }
                Ok(JsValue::Bool(true))
            }
            "some" => {
                let callback = self.expect_callback(arguments, "some")?;
                for (index, item) in items.iter().enumerate() {
                    if self
                        .invoke_callback(callback, &[item.clone(), JsValue::Number(index as f64)], scope)?
                        .is_truthy()
                    {
                        return Ok(JsValue::Bool(true));
                    }
                }
                Ok(JsValue::Bool(false))
            }
            "reduce" => {
                let callback = self.expect_callback(arguments, "reduce")?;
                let mut iterator = items.iter().enumerate();
                let mut accumulator = match arguments.get(1) {
                    Some(initial) => self.eval(initial, scope)?,
                    None => match iterator.next() {
                        Some((_, first)) => first.clone(),
                        None => return Err(self.type_error("reduce of empty array with no initial value")),
                    },
                };
                for (index, item) in iterator {
                    accumulator =
                        self.invoke_callback(callback, &[accumulator, item.clone(), JsValue::Number(index as f64)], scope)?;
                }
                Ok(accumulator)
            }
            other => Err(self.type_error(format!("'{other}' is not an array method"))),
        }
    }

    fn slice_bounds(&mut self, arguments: &[Expr], scope: &Scope, length: usize) -> Result<(usize, usize), ExprError> {
        let resolve = |raw: f64| -> usize {
            if raw.is_nan() {
                return 0;
            }
            if raw < 0.0 {
                (length as f64 + raw).max(0.0) as usize
            } else {
                (raw as usize).min(length)
            }
        };
        let start = match arguments.first() {
            None => 0,
            Some(expression) => resolve(self.eval(expression, scope)?.to_number()),
        }
        .min(length);
        let end = match arguments.get(1) {
            None => length,
            Some(expression) => resolve(self.eval(expression, scope)?.to_number()),
        }
        .clamp(start, length);
        Ok((start, end))
    }

    fn expect_callback<'a>(&self, arguments: &'a [Expr], method: &str) -> Result<&'a Expr, ExprError> {
        match arguments.first() {
            Some(expression @ Expr::Arrow { .. }) => Ok(expression),
            _ => Err(self.type_error(format!("{method}() requires a callback argument"))),
        }
    }

    fn invoke_callback(&mut self, callback: &Expr, call_arguments: &[JsValue], scope: &Scope) -> Result<JsValue, ExprError> {
        let Expr::Arrow { parameters, body } = callback else {
            return Err(self.type_error("callback is not a function"));
        };
        let mut frame = IndexMap::new();
        for (position, parameter) in parameters.iter().enumerate() {
            frame.insert(parameter.clone(), call_arguments.get(position).cloned().unwrap_or(JsValue::Undefined));
        }
        self.locals.push(frame);
        let result = self.eval(body, scope);
        self.locals.pop();
        result
    }
}

fn is_namespace(name: &str) -> bool {
    matches!(name, "Math" | "JSON" | "Date")
}

fn namespace_constant(namespace: &str, property: &str) -> Option<JsValue> {
    match (namespace, property) {
        ("Math", "PI") => Some(JsValue::Number(std::f64::consts::PI)),
        ("Math", "E") => Some(JsValue::Number(std::f64::consts::E)),
        _ => None,
    }
}

fn call_math(function: &str, arguments: &[JsValue]) -> Option<JsValue> {
    let first = arguments.first().map(JsValue::to_number).unwrap_or(f64::NAN);
    let result = match function {
        "abs" => first.abs(),
        "floor" => first.floor(),
        "ceil" => first.ceil(),
        "round" => {
            // JS rounds half toward positive infinity.
            (first + 0.5).floor()
        }
        "trunc" => first.trunc(),
        "sqrt" => first.sqrt(),
        "sign" => {
            if first.is_nan() {
                f64::NAN
            } else if first > 0.0 {
                1.0
            } else if first < 0.0 {
                -1.0
            } else {
                first
            }
        }
        "log" => first.ln(),
        "log10" => first.log10(),
        "exp" => first.exp(),
        "pow" => {
            let exponent = arguments.get(1).map(JsValue::to_number).unwrap_or(f64::NAN);
            first.powf(exponent)
        }
        "min" => arguments.iter().map(JsValue::to_number).fold(f64::INFINITY, f64::min),
        "max" => arguments.iter().map(JsValue::to_number).fold(f64::NEG_INFINITY, f64::max),
        _ => return None,
    };
    Some(JsValue::Number(result))
}

fn builtin_parse_int(arguments: &[JsValue]) -> JsValue {
    let text = arguments.first().map(JsValue::to_display_string).unwrap_or_default();
    let radix = arguments.get(1).map(JsValue::to_number).filter(|radix| !radix.is_nan()).unwrap_or(10.0) as u32;
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let mut end = 0usize;
    for character in digits.chars() {
        if character.to_digit(radix.clamp(2, 36)).is_some() {
            end += character.len_utf8();
        } else {
            break;
        }
    }
    if end == 0 {
        return JsValue::Number(f64::NAN);
    }
    match i64::from_str_radix(&digits[..end], radix.clamp(2, 36)) {
        Ok(parsed) => JsValue::Number(if negative { -(parsed as f64) } else { parsed as f64 }),
        Err(_) => JsValue::Number(f64::NAN),
    }
}

fn builtin_parse_float(arguments: &[JsValue]) -> JsValue {
    let text = arguments.first().map(JsValue::to_display_string).unwrap_or_default();
    let trimmed = text.trim();
    // Longest numeric prefix, as the source dialect parses it.
    let mut end = 0usize;
    let mut seen_dot = false;
    let mut seen_exponent = false;
    for (offset, character) in trimmed.char_indices() {
        let acceptable = character.is_ascii_digit()
            || (character == '.' && !seen_dot && !seen_exponent)
            || ((character == 'e' || character == 'E') && !seen_exponent && offset > 0)
            || ((character == '+' || character == '-') && (offset == 0 || trimmed[..offset].ends_with(['e', 'E'])));
        if !acceptable {
            break;
        }
        if character == '.' {
            seen_dot = true;
        }
        if character == 'e' || character == 'E' {
            seen_exponent = true;
        }
        end = offset + character.len_utf8();
    }
    trimmed[..end].parse::<f64>().map(JsValue::Number).unwrap_or(JsValue::Number(f64::NAN))
}

fn parse_date_millis(text: &str) -> f64 {
    if let Ok(with_zone) = chrono::DateTime::parse_from_rfc3339(text) {
        return with_zone.timestamp_millis() as f64;
    }
    if let Ok(naive_date) = chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        let at_midnight = naive_date.and_hms_opt(0, 0, 0).expect("midnight is valid");
        return at_midnight.and_utc().timestamp_millis() as f64;
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return naive.and_utc().timestamp_millis() as f64;
    }
    f64::NAN
}

/// Reads `target.property` with safe navigation.
fn read_property(target: &JsValue, property: &str) -> JsValue {
    match target {
        JsValue::Object(entries) => entries.get(property).cloned().unwrap_or(JsValue::Undefined),
        JsValue::Array(items) => match property {
            "length" => JsValue::Number(items.len() as f64),
            _ => property
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index).cloned())
                .unwrap_or(JsValue::Undefined),
        },
        JsValue::String(text) => match property {
            "length" => JsValue::Number(text.chars().count() as f64),
            _ => JsValue::Undefined,
        },
        _ => JsValue::Undefined,
    }
}

/// Reads `target[key]` with safe navigation.
fn read_index(target: &JsValue, key: &JsValue) -> JsValue {
    match target {
        JsValue::Array(items) => {
            let index = key.to_number();
            if index.fract() == 0.0 && index >= 0.0 {
                items.get(index as usize).cloned().unwrap_or(JsValue::Undefined)
            } else {
                JsValue::Undefined
            }
        }
        JsValue::Object(_) => read_property(target, &key.to_display_string()),
        JsValue::String(text) => {
            let index = key.to_number();
            if index.fract() == 0.0 && index >= 0.0 {
                text.chars()
                    .nth(index as usize)
                    .map(|character| JsValue::String(character.to_string()))
                    .unwrap_or(JsValue::Undefined)
            } else {
                JsValue::Undefined
            }
        }
        _ => JsValue::Undefined,
    }
}

fn apply_binary(operator: BinaryOp, left: &JsValue, right: &JsValue) -> JsValue {
    match operator {
        BinaryOp::Add => {
            if matches!(left, JsValue::String(_)) || matches!(right, JsValue::String(_)) {
                JsValue::String(format!("{}{}", left.to_display_string(), right.to_display_string()))
            } else if matches!(left, JsValue::Array(_) | JsValue::Object(_)) || matches!(right, JsValue::Array(_) | JsValue::Object(_))
            {
                // Structured operands stringify, as the source dialect does.
                JsValue::String(format!("{}{}", left.to_display_string(), right.to_display_string()))
            } else {
                JsValue::Number(left.to_number() + right.to_number())
            }
        }
        BinaryOp::Subtract => JsValue::Number(left.to_number() - right.to_number()),
        BinaryOp::Multiply => JsValue::Number(left.to_number() * right.to_number()),
        BinaryOp::Divide => JsValue::Number(left.to_number() / right.to_number()),
        BinaryOp::Modulo => {
            let divisor = right.to_number();
            if divisor == 0.0 {
                JsValue::Number(f64::NAN)
            } else {
                JsValue::Number(left.to_number() % divisor)
            }
        }
        BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => {
            let outcome = if let (JsValue::String(left_text), JsValue::String(right_text)) = (left, right) {
                match operator {
                    BinaryOp::Less => left_text < right_text,
                    BinaryOp::LessEqual => left_text <= right_text,
                    BinaryOp::Greater => left_text > right_text,
                    BinaryOp::GreaterEqual => left_text >= right_text,
                    _ => unreachable!(),
                }
            } else {
                let left_number = left.to_number();
                let right_number = right.to_number();
                if left_number.is_nan() || right_number.is_nan() {
                    false
                } else {
                    match operator {
                        BinaryOp::Less => left_number < right_number,
                        BinaryOp::LessEqual => left_number <= right_number,
                        BinaryOp::Greater => left_number > right_number,
                        BinaryOp::GreaterEqual => left_number >= right_number,
                        _ => unreachable!(),
                    }
                }
            };
            JsValue::Bool(outcome)
        }
        BinaryOp::LooseEqual => JsValue::Bool(left.loose_equals(right)),
        BinaryOp::LooseNotEqual => JsValue::Bool(!left.loose_equals(right)),
        BinaryOp::StrictEqual => JsValue::Bool(left.strict_equals(right)),
        BinaryOp::StrictNotEqual => JsValue::Bool(!left.strict_equals(right)),
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse;
    use super::*;
    use serde_json::json;

    fn eval_with(source: &str, scope: &Scope) -> JsValue {
        let ast = parse(source).expect("parses");
        evaluate_ast(&ast, scope, source).expect("evaluates")
    }

    fn eval_in_scope(source: &str, bindings: JsonValue) -> JsValue {
        let JsonValue::Object(map) = bindings else { panic!("bindings must be an object") };
        let scope = Scope::from_flattened(&map);
        eval_with(source, &scope)
    }

    #[test]
    fn arithmetic_and_concatenation() {
        assert_eq!(eval_in_scope("1 + 2 * 3", json!({})), JsValue::Number(7.0));
        assert_eq!(eval_in_scope("'n=' + 5", json!({})), JsValue::String("n=5".into()));
        assert_eq!(eval_in_scope("counter * 2", json!({"counter": 21})), JsValue::Number(42.0));
    }

    #[test]
    fn division_by_zero_follows_float_semantics() {
        assert_eq!(eval_in_scope("1 / 0", json!({})), JsValue::Number(f64::INFINITY));
        let nan = eval_in_scope("0 / 0", json!({}));
        assert!(matches!(nan, JsValue::Number(number) if number.is_nan()));
    }

    #[test]
    fn missing_identifiers_read_as_undefined() {
        assert_eq!(eval_in_scope("missing", json!({})), JsValue::Undefined);
        assert_eq!(eval_in_scope("missing.deeply.nested", json!({})), JsValue::Undefined);
        assert_eq!(eval_in_scope("typeof missing", json!({})), JsValue::String("undefined".into()));
    }

    #[test]
    fn safe_navigation_through_null() {
        assert_eq!(eval_in_scope("value.x", json!({"value": null})), JsValue::Undefined);
        assert_eq!(eval_in_scope("items[10]", json!({"items": [1]})), JsValue::Undefined);
    }

    #[test]
    fn ternary_and_logical_operators_return_operands() {
        assert_eq!(eval_in_scope("flag ? 'yes' : 'no'", json!({"flag": true})), JsValue::String("yes".into()));
        assert_eq!(eval_in_scope("'' || 'fallback'", json!({})), JsValue::String("fallback".into()));
        assert_eq!(eval_in_scope("'left' && 'right'", json!({})), JsValue::String("right".into()));
    }

    #[test]
    fn array_combinators_with_callbacks() {
        let scope_data = json!({"items": [1, 2, 3, 4]});
        assert_eq!(
            eval_in_scope("items.map(x => x * 2)", scope_data.clone()),
            JsValue::from_json(&json!([2, 4, 6, 8]))
        );
        assert_eq!(
            eval_in_scope("items.filter(x => x % 2 == 0)", scope_data.clone()),
            JsValue::from_json(&json!([2, 4]))
        );
        assert_eq!(
            eval_in_scope("items.reduce((acc, x) => acc + x, 0)", scope_data.clone()),
            JsValue::Number(10.0)
        );
        assert_eq!(eval_in_scope("items.every(x => x > 0)", scope_data.clone()), JsValue::Bool(true));
        assert_eq!(eval_in_scope("items.some(x => x > 3)", scope_data), JsValue::Bool(true));
    }

    #[test]
    fn string_methods_cover_documented_set() {
        let scope_data = json!({"name": "Windlass Engine"});
        assert_eq!(eval_in_scope("name.includes('Engine')", scope_data.clone()), JsValue::Bool(true));
        assert_eq!(eval_in_scope("name.toLowerCase()", scope_data.clone()), JsValue::String("windlass engine".into()));
        assert_eq!(
            eval_in_scope("name.split(' ')", scope_data.clone()),
            JsValue::from_json(&json!(["Windlass", "Engine"]))
        );
        assert_eq!(eval_in_scope("name.length", scope_data.clone()), JsValue::Number(15.0));
        assert_eq!(eval_in_scope("'  pad  '.trim()", json!({})), JsValue::String("pad".into()));
        assert_eq!(eval_in_scope("name.replace('Engine', 'Core')", scope_data), JsValue::String("Windlass Core".into()));
    }

    #[test]
    fn match_returns_captures_or_null() {
        assert_eq!(eval_in_scope("'v1.2'.match('missing')", json!({})), JsValue::Null);
        let captures = eval_in_scope(r"'v1.2'.match('v(\\d+)')", json!({}));
        assert_eq!(captures, JsValue::from_json(&json!(["v1", "1"])));
    }

    #[test]
    fn builtins_parse_numbers_and_json() {
        assert_eq!(eval_in_scope("parseInt('42px')", json!({})), JsValue::Number(42.0));
        assert_eq!(eval_in_scope("parseFloat('2.5rem')", json!({})), JsValue::Number(2.5));
        assert_eq!(eval_in_scope("Math.max(1, 9, 4)", json!({})), JsValue::Number(9.0));
        assert_eq!(eval_in_scope("JSON.parse('{\"a\": 1}').a", json!({})), JsValue::Number(1.0));
        assert_eq!(eval_in_scope("JSON.stringify([1, 2])", json!({})), JsValue::String("[1,2]".into()));
    }

    #[test]
    fn unknown_function_is_a_reference_error() {
        let ast = parse("doStuff(1)").unwrap();
        let error = evaluate_ast(&ast, &Scope::new(), "doStuff(1)").unwrap_err();
        assert_eq!(error.kind, ExprErrorKind::Reference);
    }

    #[test]
    fn calling_method_on_undefined_is_a_type_error() {
        let ast = parse("missing.map(x => x)").unwrap();
        let error = evaluate_ast(&ast, &Scope::new(), "missing.map(x => x)").unwrap_err();
        assert_eq!(error.kind, ExprErrorKind::Type);
    }

    #[test]
    fn locals_shadow_flattened_scope() {
        let mut scope = Scope::from_flattened(json!({"x": 1}).as_object().unwrap());
        scope.bind("x", JsValue::Number(2.0));
        assert_eq!(eval_with("x", &scope), JsValue::Number(2.0));
    }

    #[test]
    fn date_parse_handles_iso_dates() {
        let millis = eval_in_scope("Date.parse('2026-01-01T00:00:00Z')", json!({}));
        assert_eq!(millis, JsValue::Number(1_767_225_600_000.0));
        let nan = eval_in_scope("Date.parse('not a date')", json!({}));
        assert!(matches!(nan, JsValue::Number(number) if number.is_nan()));
    }
}
