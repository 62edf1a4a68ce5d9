//! Static catalog of step types.
//!
//! Maps each step type to its required/optional field sets and its execution
//! location. The executor consults it to classify steps as server- or
//! client-located; runtime field validation lives here too so both the
//! executor and any load-time validation agree on field sets.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use windlass_types::{WorkflowError, WorkflowStep};

/// Where a step executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepLocation {
    /// Processed inside the engine during `get_next_step`.
    Server,
    /// Materialized into the client batch and executed by the caller.
    Client,
}

/// Catalog entry for one step type.
#[derive(Debug, Clone)]
pub struct StepTypeSpec {
    /// Fields that must be present on the step definition.
    pub required_fields: &'static [&'static str],
    /// Fields the engine understands but does not require.
    pub optional_fields: &'static [&'static str],
    /// Default execution location. `shell_command` may be overridden per
    /// step by `execution_context`.
    pub location: StepLocation,
}

/// Step types that were removed in favor of side-effect fields; classification
/// rejects them with a migration hint.
const DEPRECATED_TYPES: &[(&str, &str)] = &[
    ("state_update", "attach a 'state_update' field to another step instead"),
    ("batch_state_update", "attach a 'state_updates' field to another step instead"),
];

static CATALOG: Lazy<HashMap<&'static str, StepTypeSpec>> = Lazy::new(|| {
    let mut catalog = HashMap::new();
    catalog.insert(
        "user_message",
        StepTypeSpec {
            required_fields: &["message"],
            optional_fields: &["format", "message_type", "state_update", "timeout"],
            location: StepLocation::Client,
        },
    );
    catalog.insert(
        "user_input",
        StepTypeSpec {
            required_fields: &["prompt"],
            optional_fields: &["input_type", "validation", "timeout", "state_update", "max_retries"],
            location: StepLocation::Client,
        },
    );
    catalog.insert(
        "mcp_call",
        StepTypeSpec {
            required_fields: &["tool"],
            optional_fields: &["parameters", "timeout", "state_update"],
            location: StepLocation::Client,
        },
    );
    catalog.insert(
        "agent_prompt",
        StepTypeSpec {
            required_fields: &["prompt"],
            optional_fields: &["sub_agent", "timeout", "state_update"],
            location: StepLocation::Client,
        },
    );
    catalog.insert(
        "agent_response",
        StepTypeSpec {
            required_fields: &[],
            optional_fields: &["state_updates", "response_schema"],
            location: StepLocation::Client,
        },
    );
    catalog.insert(
        "shell_command",
        StepTypeSpec {
            required_fields: &["command"],
            optional_fields: &["execution_context", "timeout", "state_update", "error_handling"],
            location: StepLocation::Server,
        },
    );
    catalog.insert(
        "conditional",
        StepTypeSpec {
            required_fields: &["condition"],
            optional_fields: &["then_steps", "else_steps"],
            location: StepLocation::Server,
        },
    );
    catalog.insert(
        "while_loop",
        StepTypeSpec {
            required_fields: &["condition", "body"],
            optional_fields: &["max_iterations"],
            location: StepLocation::Server,
        },
    );
    catalog.insert(
        "foreach",
        StepTypeSpec {
            required_fields: &["items", "body"],
            optional_fields: &["parallel", "max_concurrent"],
            location: StepLocation::Server,
        },
    );
    catalog.insert(
        "parallel_foreach",
        StepTypeSpec {
            required_fields: &["items", "sub_agent_task"],
            optional_fields: &["max_parallel", "timeout_seconds", "wait_for_all", "sub_agent_prompt_override"],
            location: StepLocation::Server,
        },
    );
    catalog.insert(
        "break",
        StepTypeSpec {
            required_fields: &[],
            optional_fields: &[],
            location: StepLocation::Server,
        },
    );
    catalog.insert(
        "continue",
        StepTypeSpec {
            required_fields: &[],
            optional_fields: &[],
            location: StepLocation::Server,
        },
    );
    catalog
});

/// Looks up the catalog entry for a type.
pub fn step_type_spec(step_type: &str) -> Option<&'static StepTypeSpec> {
    CATALOG.get(step_type)
}

/// Classifies a step as server- or client-located.
///
/// Unknown types and the deprecated standalone mutation types are
/// `CONSTRAINT_VIOLATION`s; the deprecated ones carry a migration hint.
/// `shell_command` honors its `execution_context` override.
pub fn classify_step(step: &WorkflowStep) -> Result<StepLocation, WorkflowError> {
    if let Some((_, hint)) = DEPRECATED_TYPES.iter().find(|(name, _)| *name == step.r#type) {
        return Err(WorkflowError::constraint_violation(format!(
            "step type '{}' was removed: {hint}",
            step.r#type
        ))
        .with_step(step.id.clone()));
    }

    let spec = step_type_spec(&step.r#type).ok_or_else(|| {
        WorkflowError::constraint_violation(format!("unknown step type '{}'", step.r#type)).with_step(step.id.clone())
    })?;

    if step.r#type == "shell_command" && step.execution_context() == Some("client") {
        return Ok(StepLocation::Client);
    }
    Ok(spec.location)
}

/// Validates the required fields of a step at runtime.
pub fn validate_step_fields(step: &WorkflowStep) -> Result<(), WorkflowError> {
    let Some(spec) = step_type_spec(&step.r#type) else {
        return Ok(());
    };
    for required in spec.required_fields {
        if !step.definition.contains_key(*required) {
            return Err(WorkflowError::constraint_violation(format!(
                "step '{}' of type '{}' is missing required field '{required}'",
                step.id, step.r#type
            ))
            .with_step(step.id.clone()));
        }
    }
    if let Some(context) = step.execution_context()
        && step.r#type != "shell_command"
    {
        return Err(WorkflowError::constraint_violation(format!(
            "step '{}' of type '{}' does not accept execution_context '{context}'",
            step.id, step.r#type
        ))
        .with_step(step.id.clone()));
    }
    Ok(())
}
