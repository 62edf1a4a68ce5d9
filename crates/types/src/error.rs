//! Engine error taxonomy.
//!
//! Every failure the engine surfaces crosses its boundary as a
//! [`WorkflowError`]: a stable machine-readable code plus a human-readable
//! message, optionally anchored to the step and state path involved. Inside
//! the engine these are ordinary values threaded through `Result`s; they are
//! never used for control flow.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used across the engine crates.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Stable machine-readable error codes surfaced by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Unknown workflow id, missing sub-agent task, or missing referenced path
    /// in a strict context.
    NotFound,
    /// A declared required input is missing or mistyped.
    InvalidInput,
    /// An update path is outside the writable tiers.
    InvalidPath,
    /// Optimistic lock mismatch on a versioned update.
    VersionConflict,
    /// Computed-field dependency graph contains a cycle.
    CircularDependency,
    /// A loop guard fired; surfaced as a warning, not a failure.
    MaxIterationsExceeded,
    /// Runtime validation of a step field failed.
    ConstraintViolation,
    /// A workflow, step, or interaction deadline elapsed.
    Timeout,
    /// The expression evaluator returned a typed failure.
    ExpressionError,
    /// A server-side shell command exited non-zero.
    ShellCommandFailed,
    /// An expression or step operand had the wrong runtime type.
    TypeError,
    /// `break`/`continue` encountered outside a loop frame.
    ControlFlowError,
    /// A sub-agent task ended in failure.
    SubagentFailed,
    /// A sub-agent task was cancelled by its deadline.
    SubagentTimeout,
    /// Admission control rejected the request.
    CircuitBreakerOpen,
    /// Engine-internal invariant violation.
    Internal,
}

impl ErrorCode {
    /// The wire spelling of the code (`SCREAMING_SNAKE_CASE`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::InvalidPath => "INVALID_PATH",
            ErrorCode::VersionConflict => "VERSION_CONFLICT",
            ErrorCode::CircularDependency => "CIRCULAR_DEPENDENCY",
            ErrorCode::MaxIterationsExceeded => "MAX_ITERATIONS_EXCEEDED",
            ErrorCode::ConstraintViolation => "CONSTRAINT_VIOLATION",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ExpressionError => "EXPRESSION_ERROR",
            ErrorCode::ShellCommandFailed => "SHELL_COMMAND_FAILED",
            ErrorCode::TypeError => "TYPE_ERROR",
            ErrorCode::ControlFlowError => "CONTROL_FLOW_ERROR",
            ErrorCode::SubagentFailed => "SUBAGENT_FAILED",
            ErrorCode::SubagentTimeout => "SUBAGENT_TIMEOUT",
            ErrorCode::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

/// A typed engine failure: code, message, and optional step/path anchors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Error)]
#[error("{}: {message}", code.as_str())]
pub struct WorkflowError {
    /// Stable machine-readable code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Identifier of the step the failure is anchored to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// State path involved in the failure, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl WorkflowError {
    /// Builds an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            step_id: None,
            path: None,
        }
    }

    /// Anchors the error to a step id.
    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Anchors the error to a state path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// `NOT_FOUND` for an unknown workflow id.
    pub fn workflow_not_found(workflow_id: &str) -> Self {
        Self::new(ErrorCode::NotFound, format!("workflow '{workflow_id}' not found"))
    }

    /// `INVALID_INPUT` with the given message.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// `INVALID_PATH` anchored to the offending path.
    pub fn invalid_path(path: &str) -> Self {
        Self::new(
            ErrorCode::InvalidPath,
            format!("update path '{path}' is outside the writable tiers (inputs.*, state.*)"),
        )
        .with_path(path.to_string())
    }

    /// `VERSION_CONFLICT` describing the mismatch.
    pub fn version_conflict(expected: u64, actual: u64) -> Self {
        Self::new(
            ErrorCode::VersionConflict,
            format!("expected state version {expected}, found {actual}"),
        )
    }

    /// `CIRCULAR_DEPENDENCY` naming the cycle members.
    pub fn circular_dependency(members: &[String]) -> Self {
        Self::new(
            ErrorCode::CircularDependency,
            format!("computed fields form a dependency cycle: {}", members.join(" -> ")),
        )
    }

    /// `CONSTRAINT_VIOLATION` with the given message.
    pub fn constraint_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConstraintViolation, message)
    }

    /// `TIMEOUT` with the given message.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    /// `TYPE_ERROR` with the given message.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TypeError, message)
    }

    /// `CONTROL_FLOW_ERROR` with the given message.
    pub fn control_flow(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ControlFlowError, message)
    }

    /// `INTERNAL` invariant violation.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_as_screaming_snake_case() {
        let serialized = serde_json::to_value(ErrorCode::MaxIterationsExceeded).unwrap();
        assert_eq!(serialized, serde_json::json!("MAX_ITERATIONS_EXCEEDED"));
        assert_eq!(ErrorCode::CircuitBreakerOpen.as_str(), "CIRCUIT_BREAKER_OPEN");
    }

    #[test]
    fn display_includes_code_and_message() {
        let error = WorkflowError::invalid_path("computed.value");
        let rendered = error.to_string();
        assert!(rendered.starts_with("INVALID_PATH:"));
        assert!(rendered.contains("computed.value"));
        assert_eq!(error.path.as_deref(), Some("computed.value"));
    }

    #[test]
    fn errors_round_trip_through_json() {
        let error = WorkflowError::new(ErrorCode::SubagentFailed, "task exploded").with_step("fanout");
        let json = serde_json::to_string(&error).unwrap();
        let back: WorkflowError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, error);
        assert!(json.contains("SUBAGENT_FAILED"));
    }
}
