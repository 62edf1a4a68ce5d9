//! Expression evaluation for conditions, computed transforms, and templates.
//!
//! The dialect is a restricted, JavaScript-flavored expression language:
//! one expression per string, no statements, no assignment, and a fixed set
//! of built-in namespaces (`Math`, `JSON`, `Date`) and methods. Dangerous
//! idioms (`eval`, `Function`, `require`, `import`, `process`, `global`,
//! `window`) are rejected when the expression is compiled.
//!
//! Evaluation is lenient where authors expect it to be: missing identifiers
//! and safe navigation read as `undefined`, and numeric edge cases follow
//! IEEE 754 (`1 / 0` is `Infinity`).

use serde::{Deserialize, Serialize};
use windlass_types::{ErrorCode, WorkflowError};

mod eval;
mod parser;
mod token;
mod value;

pub use eval::{Scope, evaluate_ast};
pub use parser::{Expr, parse};
pub use value::{JsValue, format_number};

/// Failure category for a typed expression error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExprErrorKind {
    /// The source is not a valid expression, or uses a forbidden construct.
    Syntax,
    /// An operation was applied to a value of the wrong type.
    Type,
    /// A bare function name could not be resolved.
    Reference,
}

impl ExprErrorKind {
    fn label(&self) -> &'static str {
        match self {
            ExprErrorKind::Syntax => "SyntaxError",
            ExprErrorKind::Type => "TypeError",
            ExprErrorKind::Reference => "ReferenceError",
        }
    }
}

/// Typed evaluation failure carrying the offending expression source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExprError {
    /// Failure category.
    pub kind: ExprErrorKind,
    /// Human-readable description.
    pub message: String,
    /// The expression source that failed.
    pub expression: String,
}

impl ExprError {
    pub(crate) fn new(kind: ExprErrorKind, message: impl Into<String>, expression: &str) -> Self {
        Self {
            kind,
            message: message.into(),
            expression: expression.to_string(),
        }
    }
}

impl std::fmt::Display for ExprError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}: {} (in '{}')", self.kind.label(), self.message, self.expression)
    }
}

impl std::error::Error for ExprError {}

impl From<ExprError> for WorkflowError {
    fn from(error: ExprError) -> Self {
        WorkflowError::new(ErrorCode::ExpressionError, error.to_string())
    }
}

/// A parsed expression ready for repeated evaluation.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    source: String,
    ast: Expr,
}

impl CompiledExpr {
    /// The original expression source.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates against the given scope.
    pub fn evaluate(&self, scope: &Scope) -> Result<JsValue, ExprError> {
        evaluate_ast(&self.ast, scope, &self.source)
    }
}

/// Compiles an expression, rejecting forbidden constructs up front.
pub fn compile(source: &str) -> Result<CompiledExpr, ExprError> {
    let ast = parse(source)?;
    Ok(CompiledExpr {
        source: source.to_string(),
        ast,
    })
}

/// Compiles and evaluates in one step.
pub fn evaluate(source: &str, scope: &Scope) -> Result<JsValue, ExprError> {
    compile(source)?.evaluate(scope)
}

/// Evaluates an expression as a condition, applying truthiness.
pub fn evaluate_predicate(source: &str, scope: &Scope) -> Result<bool, ExprError> {
    Ok(evaluate(source, scope)?.is_truthy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compile_rejects_forbidden_constructs_before_evaluation() {
        for source in ["eval('x')", "process.exit()", "a = 1"] {
            let error = compile(source).unwrap_err();
            assert_eq!(error.kind, ExprErrorKind::Syntax, "expected syntax rejection for {source}");
        }
    }

    #[test]
    fn predicate_applies_truthiness() {
        let scope = Scope::from_flattened(json!({"counter": 3}).as_object().unwrap());
        assert!(evaluate_predicate("counter < 5", &scope).unwrap());
        assert!(!evaluate_predicate("counter - 3", &scope).unwrap());
        assert!(!evaluate_predicate("missing_value", &scope).unwrap());
    }

    #[test]
    fn expr_error_converts_to_workflow_error() {
        let error = evaluate("nope()", &Scope::new()).unwrap_err();
        let workflow_error: WorkflowError = error.into();
        assert_eq!(workflow_error.code, ErrorCode::ExpressionError);
        assert!(workflow_error.message.contains("ReferenceError"));
    }

    #[test]
    fn compiled_expressions_are_reusable() {
        let compiled = compile("input * 2").unwrap();
        let mut scope = Scope::new();
        scope.bind_json("input", &json!(4));
        assert_eq!(compiled.evaluate(&scope).unwrap(), JsValue::Number(8.0));
        scope.bind_json("input", &json!(5));
        assert_eq!(compiled.evaluate(&scope).unwrap(), JsValue::Number(10.0));
    }
}
