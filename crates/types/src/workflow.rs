//! Strongly typed workflow schema definitions shared across the loader, engine, and driver.
//!
//! The models here mirror the authoring format accepted by the engine: a
//! declarative workflow with typed inputs, a three-tier state declaration,
//! an ordered step list, and optional sub-agent task templates. Authoring
//! order is preserved (via `IndexMap`) so diagnostics and materialized
//! output render inputs and computed fields in a predictable sequence.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::WorkflowError;

pub mod validation;

/// Describes a fully authored workflow: metadata, declared inputs, initial
/// state, computed-field schema, steps, and sub-agent task templates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkflowDefinition {
    /// Canonical workflow identifier, conventionally `namespace:identifier`.
    #[serde(default)]
    pub name: String,
    /// Optional descriptive copy surfaced in listings and status reports.
    #[serde(default)]
    pub description: Option<String>,
    /// Semantic version of the authored definition.
    #[serde(default)]
    pub version: Option<String>,
    /// Declarative input definitions keyed by input name, preserving author order.
    #[serde(default)]
    pub inputs: IndexMap<String, WorkflowInputDefinition>,
    /// Initial values for the mutable `state` tier.
    #[serde(default)]
    pub default_state: DefaultState,
    /// Declaration of the derived `computed` tier.
    #[serde(default)]
    pub state_schema: StateSchema,
    /// Ordered list of top-level steps.
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    /// Named sub-agent task templates instantiated by `parallel_foreach` steps.
    #[serde(default)]
    pub sub_agent_tasks: IndexMap<String, SubAgentTaskDefinition>,
}

impl WorkflowDefinition {
    /// Assigns `step_<n>` identifiers to top-level steps authored without one.
    ///
    /// Identifiers are assigned in authoring order and are unique within the
    /// top-level scope. Sub-agent task steps are normalized the same way.
    /// Nested branch/body steps are named by the engine when their enclosing
    /// construct is expanded.
    pub fn normalize_step_ids(&mut self) {
        assign_missing_step_ids(&mut self.steps);
        for task in self.sub_agent_tasks.values_mut() {
            assign_missing_step_ids(&mut task.steps);
        }
    }

    /// Total number of top-level steps, reported by `start` and status calls.
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }
}

fn assign_missing_step_ids(steps: &mut [WorkflowStep]) {
    for (index, step) in steps.iter_mut().enumerate() {
        if step.id.trim().is_empty() {
            step.id = format!("step_{}", index + 1);
        }
    }
}

/// Initial values for the writable tiers of a workflow's state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DefaultState {
    /// Seed values for the mutable `state` tier.
    #[serde(default)]
    pub state: JsonMap<String, JsonValue>,
}

/// Declaration of the derived `computed` state tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StateSchema {
    /// Computed-field descriptors keyed by output field name.
    #[serde(default)]
    pub computed: IndexMap<String, ComputedFieldDefinition>,
}

/// Declares a single derived state field and its recomputation policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputedFieldDefinition {
    /// Dependency paths into the flattened state, a single path or an ordered list.
    pub from: DependencyList,
    /// Transform expression. With a single dependency, `input` is bound to that
    /// value; with a list, `input` is bound to the ordered array of values.
    pub transform: String,
    /// Failure policy applied when the transform raises.
    #[serde(default)]
    pub on_error: ComputedErrorPolicy,
    /// Substitute value used when `on_error` is `use_fallback`.
    #[serde(default)]
    pub fallback: Option<JsonValue>,
}

/// One or more dependency paths for a computed field, preserving author order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DependencyList {
    /// A single dependency path; the transform sees the scalar value as `input`.
    Single(String),
    /// Multiple dependency paths; the transform sees an ordered array as `input`.
    Many(Vec<String>),
}

impl DependencyList {
    /// Returns the dependency paths in declaration order.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            DependencyList::Single(path) => vec![path.as_str()],
            DependencyList::Many(paths) => paths.iter().map(String::as_str).collect(),
        }
    }

    /// True when the descriptor declared a list, even a single-element one.
    pub fn is_many(&self) -> bool {
        matches!(self, DependencyList::Many(_))
    }
}

/// Failure policy for a computed-field transform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComputedErrorPolicy {
    /// Re-raise the failure; the enclosing update batch fails.
    #[default]
    Propagate,
    /// Substitute the configured `fallback` value.
    UseFallback,
    /// Keep the field's previous value.
    Ignore,
}

/// Defines metadata for a single workflow input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkflowInputDefinition {
    /// Declares the primitive type (`string`, `number`, `boolean`, `object`, `array`).
    #[serde(default)]
    pub r#type: Option<String>,
    /// Descriptive text explaining the purpose of the input.
    #[serde(default)]
    pub description: Option<String>,
    /// When true, a missing value at `start` is an `INVALID_INPUT` error.
    #[serde(default)]
    pub required: bool,
    /// Default applied when the caller omits the input.
    #[serde(default)]
    pub default: Option<JsonValue>,
    /// Optional validation expression evaluated against the candidate value.
    #[serde(default)]
    pub validation: Option<String>,
}

/// A single authored step: identifier, type tag, and per-type configuration.
///
/// All fields other than `id` and `type` are captured verbatim in
/// `definition`; typed accessors extract the cross-cutting fields
/// (`state_update`, `timeout`, `error_handling`) the engine understands on
/// any step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkflowStep {
    /// Unique identifier within the enclosing scope. Auto-assigned when absent.
    #[serde(default)]
    pub id: String,
    /// Step type tag selecting the processor (`user_message`, `conditional`, ...).
    pub r#type: String,
    /// Remaining per-type configuration, preserved as authored.
    #[serde(flatten)]
    pub definition: JsonMap<String, JsonValue>,
}

impl WorkflowStep {
    /// Builds a step from its parts. Used by engine-side expansion of nested bodies.
    pub fn new(id: impl Into<String>, step_type: impl Into<String>, definition: JsonMap<String, JsonValue>) -> Self {
        Self {
            id: id.into(),
            r#type: step_type.into(),
            definition,
        }
    }

    /// Returns a definition field by name.
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.definition.get(name)
    }

    /// Returns a definition field as a string slice when it is a JSON string.
    pub fn string_field(&self, name: &str) -> Option<&str> {
        self.definition.get(name).and_then(JsonValue::as_str)
    }

    /// The single inline `state_update` side effect, when present and well-formed.
    pub fn state_update(&self) -> Option<StateUpdateSpec> {
        self.definition
            .get("state_update")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// The inline `state_updates` array, when present and well-formed.
    pub fn state_updates(&self) -> Vec<StateUpdateSpec> {
        self.definition
            .get("state_updates")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    /// The declared per-step timeout in seconds.
    pub fn timeout_seconds(&self) -> Option<u64> {
        self.definition.get("timeout").and_then(JsonValue::as_u64)
    }

    /// The declared error-handling policy, defaulting to `fail`.
    pub fn error_handling(&self) -> ErrorHandlingSpec {
        self.definition
            .get("error_handling")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    /// The declared execution context override (`server` or `client`), if any.
    pub fn execution_context(&self) -> Option<&str> {
        self.string_field("execution_context")
    }

    /// Parses a nested step list field (`then_steps`, `else_steps`, `body`).
    pub fn nested_steps(&self, name: &str) -> Result<Vec<WorkflowStep>, WorkflowError> {
        match self.definition.get(name) {
            None => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|parse_error| {
                WorkflowError::constraint_violation(format!(
                    "step '{}' field '{}' is not a valid step list: {}",
                    self.id, name, parse_error
                ))
                .with_step(self.id.clone())
            }),
        }
    }
}

/// A single state mutation carried as a step side effect or API update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateUpdateSpec {
    /// Dot path into a writable tier (`state.*`, or `inputs.*` at initialization).
    pub path: String,
    /// Mutation operator applied at the path.
    #[serde(default)]
    pub operation: UpdateOperation,
    /// Operand value. Interpreted per operation.
    #[serde(default)]
    pub value: JsonValue,
}

impl StateUpdateSpec {
    /// Convenience constructor for a plain `set`.
    pub fn set(path: impl Into<String>, value: JsonValue) -> Self {
        Self {
            path: path.into(),
            operation: UpdateOperation::Set,
            value,
        }
    }
}

/// Mutation operators accepted by the state manager.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOperation {
    /// Replace the value at the path.
    #[default]
    Set,
    /// Numeric addition; the operand defaults to 1 when null.
    Increment,
    /// Push onto the array at the path, creating it when absent.
    Append,
    /// Shallow-merge an object into the object at the path.
    Merge,
}

/// Per-step recovery policy for server-side failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ErrorHandlingSpec {
    /// Recovery strategy. Defaults to `fail`.
    #[serde(default)]
    pub strategy: ErrorStrategy,
    /// Maximum retry attempts when the strategy is `retry`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between retry attempts in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
    /// State update applied instead of the step when the strategy is `fallback`.
    #[serde(default)]
    pub fallback: Option<StateUpdateSpec>,
}

fn default_max_retries() -> u32 {
    3
}

/// Recovery strategies for a failing server step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Propagate the failure and fail the workflow.
    #[default]
    Fail,
    /// Log the failure and skip the step.
    Continue,
    /// Re-queue the step up to `max_retries` times.
    Retry,
    /// Apply the configured fallback state update and skip the step.
    Fallback,
}

/// A named sub-agent task template: a mini workflow definition instantiated
/// per item by `parallel_foreach`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SubAgentTaskDefinition {
    /// Descriptive text for listings and progress callbacks.
    #[serde(default)]
    pub description: Option<String>,
    /// Declared task inputs, beyond the implicit `item`/`index`/`total`.
    #[serde(default)]
    pub inputs: IndexMap<String, WorkflowInputDefinition>,
    /// Initial values for the task's own `state` tier.
    #[serde(default)]
    pub default_state: DefaultState,
    /// Declaration of the task's own `computed` tier.
    #[serde(default)]
    pub state_schema: StateSchema,
    /// Ordered task steps.
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    /// Default per-task timeout in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created but not yet driven.
    #[default]
    Pending,
    /// At least one `get_next_step` call has been made.
    Running,
    /// Suspended by the embedder; resumable.
    Paused,
    /// The top-level queue drained normally.
    Completed,
    /// An unrecovered error bubbled out.
    Failed,
    /// The workflow-level deadline elapsed.
    Timeout,
    /// Cancelled by the embedder or a cascading parent failure.
    Cancelled,
}

impl WorkflowStatus {
    /// True for statuses from which the instance will never advance again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Timeout | WorkflowStatus::Cancelled)
    }
}

/// Terminal or in-flight status of one sub-agent task inside a fan-out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued behind the parallelism bound.
    #[default]
    Pending,
    /// Currently being driven.
    Running,
    /// Ran to completion.
    Completed,
    /// Failed with a terminal error.
    Failed,
    /// Cancelled by its per-task deadline.
    Timeout,
    /// Cancelled by parent unwind.
    Cancelled,
}

/// Outcome of a single sub-agent task, keyed by task id in the fan-out result map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutcome {
    /// Terminal status of the task.
    pub status: TaskStatus,
    /// Final task state projection on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    /// Terminal error on failure or timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowError>,
}

/// A step materialized for the caller: all `{{ ... }}` references substituted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MaterializedStep {
    /// Step identifier, unique within the batch's workflow.
    pub id: String,
    /// Step type tag.
    pub r#type: String,
    /// Fully substituted per-type configuration.
    pub definition: JsonValue,
}

/// The batch of client-bound steps returned by one `get_next_step` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NextStepBatch {
    /// Client steps in queue order. The caller executes them in order.
    pub steps: Vec<MaterializedStep>,
}

/// Snapshot of the three state tiers plus the legacy `raw` alias.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StateSnapshot {
    /// Immutable caller-provided inputs merged with declared defaults.
    pub inputs: JsonMap<String, JsonValue>,
    /// The mutable `state` tier.
    pub state: JsonMap<String, JsonValue>,
    /// The derived `computed` tier.
    pub computed: JsonMap<String, JsonValue>,
    /// Backward-compatibility alias shallow-mirroring `state`.
    pub raw: JsonMap<String, JsonValue>,
}

/// Result of a successful `start` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartResult {
    /// Opaque instance identifier (`wf_` + 8 hex chars).
    pub workflow_id: String,
    /// Initial lifecycle status.
    pub status: WorkflowStatus,
    /// Number of top-level steps in the definition.
    pub total_steps: usize,
    /// Initial state snapshot, computed tier included.
    pub state: StateSnapshot,
    /// Instance creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Full status report for one workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStatusReport {
    /// Opaque instance identifier.
    pub workflow_id: String,
    /// Name from the definition.
    pub workflow_name: String,
    /// Current lifecycle status.
    pub status: WorkflowStatus,
    /// Instance creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Completion timestamp once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of top-level steps in the definition.
    pub total_steps: usize,
    /// Current state snapshot.
    pub state: StateSnapshot,
    /// Identifier of the executing surface (`server` for the engine process).
    pub execution_context: String,
    /// Terminal error for failed instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowError>,
    /// Non-fatal diagnostics accumulated during execution (loop guards etc.).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<WorkflowError>,
}

/// Row in the active-workflow listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSummary {
    /// Opaque instance identifier.
    pub workflow_id: String,
    /// Name from the definition.
    pub workflow_name: String,
    /// Current lifecycle status.
    pub status: WorkflowStatus,
    /// Instance creation timestamp.
    pub created_at: DateTime<Utc>,
}
