//! The queue-driven step interpreter.
//!
//! `run_until_batch` walks an instance's frame stack, processing server
//! steps in place and coalescing client-bound steps into one batch. Server
//! steps never force a return: they are applied before, between, and after
//! client steps, so each materialized step observes the state produced by
//! everything ahead of it in the same call. The loop exits when the frame
//! stack drains (workflow complete) or a failure surfaces.

use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, warn};
use windlass_types::{ErrorCode, MaterializedStep, StateUpdateSpec, WorkflowError, WorkflowResult, WorkflowStep};

use crate::control::{
    build_scope, process_break, process_conditional, process_continue, process_foreach, process_while_loop,
};
use crate::expr::{JsValue, Scope};
use crate::orchestrator::{AgentDispatcher, ProgressSink, run_parallel_foreach};
use crate::registry::{StepLocation, classify_step, validate_step_fields};
use crate::resources::{CleanupRegistry, EngineConfig};
use crate::state::StateManager;
use crate::template::replace_variables;

use super::instance::WorkflowInstance;
use super::recovery::{RecoveryAction, resolve_failure};
use super::runner::{CommandRunner, ShellOutput};

/// Shared services threaded through the driver and the orchestrator.
#[derive(Clone)]
pub struct ExecutionServices {
    pub config: EngineConfig,
    pub state: Arc<StateManager>,
    pub runner: Arc<dyn CommandRunner>,
    pub dispatcher: Arc<dyn AgentDispatcher>,
    pub progress: Arc<dyn ProgressSink>,
    pub cleanup: Arc<CleanupRegistry>,
}

/// Drives one instance until its queue drains or a failure surfaces,
/// returning the accumulated client batch.
///
/// `allow_fanout` is false when driving sub-agent tasks: fan-out does not
/// nest, so a `parallel_foreach` inside a task template is rejected.
pub async fn run_until_batch(
    services: &ExecutionServices,
    instance: &mut WorkflowInstance,
    allow_fanout: bool,
) -> WorkflowResult<Vec<MaterializedStep>> {
    let mut batch: Vec<MaterializedStep> = Vec::new();

    loop {
        if instance.deadline.expired() {
            return Err(WorkflowError::timeout(format!(
                "workflow '{}' exceeded its time budget",
                instance.workflow_id
            )));
        }

        let flattened = services.state.scope_view(&instance.workflow_id)?;
        let guard_warnings = crate::control::advance_exhausted_frames(&mut instance.frames, &flattened)?;
        instance.warnings.extend(guard_warnings);

        if instance.frames.is_empty() {
            return Ok(batch);
        }

        // Frame advancing may have changed loop bindings; the scope must be
        // rebuilt for the step about to be processed.
        let step = instance.frames.current_step().cloned().expect("non-empty stack has a head step");
        let bindings = instance.frames.merged_bindings();
        let scope = build_scope(&flattened, &bindings);

        match step.r#type.as_str() {
            "conditional" => {
                process_conditional(&step, &mut instance.frames, &scope)?;
                instance.server_completed.push(step.id.clone());
            }
            "while_loop" => {
                process_while_loop(&step, &mut instance.frames, services.config.default_max_iterations)?;
                instance.server_completed.push(step.id.clone());
            }
            "foreach" => {
                process_foreach(&step, &mut instance.frames, &scope)?;
                instance.server_completed.push(step.id.clone());
            }
            "break" => {
                process_break(&step, &mut instance.frames)?;
                instance.server_completed.push(step.id.clone());
            }
            "continue" => {
                process_continue(&step, &mut instance.frames)?;
                instance.server_completed.push(step.id.clone());
            }
            "parallel_foreach" => {
                if !allow_fanout {
                    return Err(WorkflowError::constraint_violation(format!(
                        "step '{}': parallel_foreach is not allowed inside a sub-agent task",
                        step.id
                    ))
                    .with_step(step.id.clone()));
                }
                let summary = run_parallel_foreach(services, instance, &step, &scope).await?;
                services.state.update(
                    &instance.workflow_id,
                    &[StateUpdateSpec::set(format!("state.{}", step.id), summary)],
                    None,
                )?;
                instance.frames.advance();
                instance.server_completed.push(step.id.clone());
            }
            _ => match classify_step(&step)? {
                StepLocation::Server => {
                    execute_shell_step(services, instance, &step, &flattened).await?;
                    instance.frames.advance();
                    instance.server_completed.push(step.id.clone());
                }
                StepLocation::Client => {
                    validate_step_fields(&step)?;
                    let materialized = emit_client_step(services, instance, &step, &scope)?;
                    batch.push(materialized);
                    instance.frames.advance();
                }
            },
        }
    }
}

/// Materializes a client step against the current scope, applying any
/// deterministic inline state updates first so the step (and everything
/// after it in the batch) observes them.
///
/// Only `user_message` updates are applied server-side: its `state_update`
/// is a pure side effect. Result-bearing steps (`user_input`, `mcp_call`,
/// `agent_prompt`, `agent_response`) keep their update specs in the
/// materialized definition; the caller applies them with the actual result
/// through the state API before the next `get_next_step`.
fn emit_client_step(
    services: &ExecutionServices,
    instance: &mut WorkflowInstance,
    step: &WorkflowStep,
    scope: &Scope,
) -> WorkflowResult<MaterializedStep> {
    let mut scope = scope.clone();
    if step.r#type == "user_message" {
        let updates = collect_inline_updates(step, &scope);
        if !updates.is_empty() {
            let snapshot = services.state.update(&instance.workflow_id, &updates, None)?;
            // The step's own templates see its side effects.
            let refreshed = crate::state::scope_maps(&snapshot.inputs, &snapshot.state, &snapshot.computed);
            scope = build_scope(&refreshed, &instance.frames.merged_bindings());
        }
    }

    let mut definition = replace_variables(&JsonValue::Object(step.definition.clone()), &scope);
    if let JsonValue::Object(fields) = &mut definition {
        // Result-bearing steps keep their update specs verbatim: values like
        // `{{ response.verdict }}` resolve at ingest time, against the
        // reported result, not here.
        if step.r#type != "user_message" {
            for spec_field in ["state_update", "state_updates"] {
                if let Some(original) = step.definition.get(spec_field) {
                    fields.insert(spec_field.to_string(), original.clone());
                }
            }
        }
        if step.r#type == "user_input" {
            fields.entry("max_retries".to_string()).or_insert(JsonValue::from(3));
        }
        // The interaction budget is clamped to the workflow's remaining time;
        // a client-side wait cannot outlive its workflow.
        if let Some(declared) = fields.get("timeout").and_then(JsonValue::as_u64) {
            let clamped = instance
                .deadline
                .child_budget(Some(std::time::Duration::from_secs(declared)))
                .as_secs();
            fields.insert("timeout".to_string(), JsonValue::from(clamped));
        }
    }

    debug!(workflow_id = %instance.workflow_id, step_id = %step.id, step_type = %step.r#type, "client step batched");
    Ok(MaterializedStep {
        id: step.id.clone(),
        r#type: step.r#type.clone(),
        definition,
    })
}

/// Gathers a step's `state_update` / `state_updates` with values replaced
/// against the given scope.
fn collect_inline_updates(step: &WorkflowStep, scope: &Scope) -> Vec<StateUpdateSpec> {
    let mut updates = Vec::new();
    if let Some(single) = step.state_update() {
        updates.push(single);
    }
    updates.extend(step.state_updates());
    for update in &mut updates {
        update.value = replace_variables(&update.value, scope);
    }
    updates
}

/// Executes a server-located `shell_command` with its recovery policy,
/// applying its state updates from the captured output on success.
async fn execute_shell_step(
    services: &ExecutionServices,
    instance: &mut WorkflowInstance,
    step: &WorkflowStep,
    flattened: &JsonMap<String, JsonValue>,
) -> WorkflowResult<()> {
    validate_step_fields(step)?;
    let policy = step.error_handling();
    let step_budget = instance
        .deadline
        .child_budget(step.timeout_seconds().map(std::time::Duration::from_secs));

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let mut scope = build_scope(flattened, &instance.frames.merged_bindings());
        // A retry policy exposes its own attempt counter to the step's
        // templates; otherwise an enclosing loop's binding stays visible.
        if policy.strategy == windlass_types::ErrorStrategy::Retry {
            scope.bind("attempt_number", JsValue::Number(attempt as f64));
        }

        let command = match replace_variables(&JsonValue::String(step.string_field("command").unwrap_or_default().to_string()), &scope)
        {
            JsonValue::String(rendered) => rendered,
            other => other.to_string(),
        };

        let failure = match services.runner.run(&command, step_budget).await {
            Ok(output) if output.success() => {
                apply_shell_updates(services, instance, step, &output, &scope)?;
                return Ok(());
            }
            Ok(output) => WorkflowError::new(
                ErrorCode::ShellCommandFailed,
                format!(
                    "step '{}' command exited with code {}: {}",
                    step.id,
                    output.exit_code,
                    output.stderr.trim()
                ),
            )
            .with_step(step.id.clone()),
            Err(run_error) => run_error.with_step(step.id.clone()),
        };

        match resolve_failure(&policy, attempt) {
            RecoveryAction::Propagate => return Err(failure),
            RecoveryAction::Skip => {
                warn!(step_id = %step.id, error = %failure, "step failed; continue policy skips it");
                instance.warnings.push(failure);
                return Ok(());
            }
            RecoveryAction::RetryAfter(delay) => {
                debug!(step_id = %step.id, attempt, error = %failure, "retrying step");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            RecoveryAction::Fallback(fallback_update) => {
                warn!(step_id = %step.id, error = %failure, "step failed; applying fallback");
                instance.warnings.push(failure);
                if let Some(mut update) = fallback_update {
                    update.value = replace_variables(&update.value, &scope);
                    services.state.update(&instance.workflow_id, &[update], None)?;
                }
                return Ok(());
            }
        }
    }
}

/// Applies a shell step's state updates from its captured output.
fn apply_shell_updates(
    services: &ExecutionServices,
    instance: &WorkflowInstance,
    step: &WorkflowStep,
    output: &ShellOutput,
    scope: &Scope,
) -> WorkflowResult<()> {
    let mut updates = Vec::new();
    if let Some(update) = step.state_update() {
        updates.push(update);
    }
    updates.extend(step.state_updates());
    if updates.is_empty() {
        return Ok(());
    }

    let mut scope_with_output = scope.clone();
    scope_with_output.bind_json("this", &output.to_json());
    for update in &mut updates {
        update.value = resolve_shell_update_value(&update.value, output, &scope_with_output);
    }
    services.state.update(&instance.workflow_id, &updates, None)?;
    Ok(())
}

/// Resolves a shell `state_update` value: omitted values and the selector
/// strings capture the command output; anything else interpolates with
/// `this` bound to `{stdout, stderr, exit_code, success}`.
fn resolve_shell_update_value(value: &JsonValue, output: &ShellOutput, scope: &Scope) -> JsonValue {
    match value {
        JsonValue::Null => JsonValue::String(output.stdout.clone()),
        JsonValue::String(selector) => match selector.as_str() {
            "stdout" => JsonValue::String(output.stdout.clone()),
            "stderr" => JsonValue::String(output.stderr.clone()),
            "exit_code" => JsonValue::from(output.exit_code),
            "success" => JsonValue::Bool(output.success()),
            _ => replace_variables(value, scope),
        },
        other => replace_variables(other, scope),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shell_update_value_selectors_capture_output() {
        let output = ShellOutput {
            stdout: "x\n".into(),
            stderr: "boom".into(),
            exit_code: 0,
        };
        let scope = Scope::new();
        assert_eq!(resolve_shell_update_value(&JsonValue::Null, &output, &scope), json!("x\n"));
        assert_eq!(resolve_shell_update_value(&json!("stdout"), &output, &scope), json!("x\n"));
        assert_eq!(resolve_shell_update_value(&json!("stderr"), &output, &scope), json!("boom"));
        assert_eq!(resolve_shell_update_value(&json!("exit_code"), &output, &scope), json!(0));
        assert_eq!(resolve_shell_update_value(&json!("success"), &output, &scope), json!(true));
        assert_eq!(resolve_shell_update_value(&json!(5), &output, &scope), json!(5));
    }

    #[test]
    fn shell_update_values_can_reference_this() {
        let output = ShellOutput {
            stdout: "payload".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        let mut scope = Scope::new();
        scope.bind_json("this", &output.to_json());
        assert_eq!(
            resolve_shell_update_value(&json!("{{ this.stdout }}"), &output, &scope),
            json!("payload")
        );
    }
}
