//! Parallel sub-agent fan-out for `parallel_foreach`.
//!
//! Each item gets a fresh, fully isolated sub-workflow instance bound to the
//! referenced task template: its own state store, its own deadline (clamped
//! to the parent's remaining budget), its own terminal status. Tasks run
//! under a bounded-parallelism pool; one task's failure or timeout never
//! cancels its peers. The step's result is a task-id-keyed outcome map
//! written onto the parent state.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use windlass_types::{
    ErrorCode, MaterializedStep, StateUpdateSpec, SubAgentTaskDefinition, TaskOutcome, TaskStatus, WorkflowDefinition,
    WorkflowError, WorkflowResult, WorkflowStep, WorkflowStatus, validate_input_value,
};

use async_trait::async_trait;

use crate::control::evaluate_items;
use crate::executor::drive::{ExecutionServices, run_until_batch};
use crate::executor::instance::WorkflowInstance;
use crate::expr::Scope;
use crate::resources::DeadlineTracker;

/// Handles the client-bound steps of a sub-agent task.
///
/// The orchestrator drives each task's step loop itself; when a task emits
/// client steps, they go through this seam. Embedders connect it to their
/// agent transport; the default implementation acknowledges steps without
/// producing state.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Executes one materialized client step for `task_id`, returning state
    /// updates to apply to the task's own state.
    async fn dispatch(&self, task_id: &str, step: &MaterializedStep) -> WorkflowResult<Vec<StateUpdateSpec>>;
}

/// Acknowledges client steps without executing anything.
#[derive(Debug, Default)]
pub struct NoopDispatcher;

#[async_trait]
impl AgentDispatcher for NoopDispatcher {
    async fn dispatch(&self, _task_id: &str, _step: &MaterializedStep) -> WorkflowResult<Vec<StateUpdateSpec>> {
        Ok(Vec::new())
    }
}

/// Receives fan-out progress events for monitoring integration.
pub trait ProgressSink: Send + Sync {
    fn task_status(&self, task_id: &str, status: TaskStatus, metadata: &JsonValue);
}

/// Discards progress events.
#[derive(Debug, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn task_status(&self, _task_id: &str, _status: TaskStatus, _metadata: &JsonValue) {}
}

/// Runs a `parallel_foreach` step to completion and returns the summary
/// object recorded on the parent (`state.<step_id>`).
///
/// The summary holds the per-task outcome map keyed by task id plus counts:
/// `{tasks, total, completed, failed, timeout, first_error?}`.
// Returns a boxed future rather than being declared `async fn`: this
// function and `run_until_batch` call each other (a task template's steps
// are driven by `run_until_batch`, which dispatches back here for nested
// fan-out), and the compiler cannot resolve the resulting opaque-type cycle
// unless one edge of it is type-erased.
pub fn run_parallel_foreach<'a>(
    services: &'a ExecutionServices,
    parent: &'a WorkflowInstance,
    step: &'a WorkflowStep,
    scope: &'a Scope,
) -> BoxFuture<'a, WorkflowResult<JsonValue>> {
    Box::pin(run_parallel_foreach_inner(services, parent, step, scope))
}

async fn run_parallel_foreach_inner(
    services: &ExecutionServices,
    parent: &WorkflowInstance,
    step: &WorkflowStep,
    scope: &Scope,
) -> WorkflowResult<JsonValue> {
    crate::registry::validate_step_fields(step)?;
    let items = evaluate_items(step, "items", scope)?;

    let task_name = step.string_field("sub_agent_task").unwrap_or_default().to_string();
    let template = parent.definition.sub_agent_tasks.get(&task_name).cloned().ok_or_else(|| {
        WorkflowError::new(
            ErrorCode::NotFound,
            format!("sub-agent task '{task_name}' is not defined on workflow '{}'", parent.definition.name),
        )
        .with_step(step.id.clone())
    })?;

    let max_parallel = step
        .field("max_parallel")
        .and_then(JsonValue::as_u64)
        .map(|bound| bound as usize)
        .filter(|bound| *bound > 0)
        .unwrap_or(services.config.default_max_parallel);
    let step_timeout = step
        .field("timeout_seconds")
        .and_then(JsonValue::as_u64)
        .or(template.timeout_seconds)
        .map(Duration::from_secs);
    let wait_for_all = step.field("wait_for_all").and_then(JsonValue::as_bool).unwrap_or(true);
    let prompt_override = step.string_field("sub_agent_prompt_override").map(str::to_string);

    if items.is_empty() {
        debug!(step_id = %step.id, "parallel_foreach over empty items; nothing to do");
        return Ok(empty_summary());
    }

    info!(
        step_id = %step.id,
        task = %task_name,
        items = items.len(),
        max_parallel,
        "starting sub-agent fan-out"
    );

    let task_definition = Arc::new(definition_from_template(&parent.definition.name, &task_name, &template));
    let total = items.len();
    let pool = Arc::new(Semaphore::new(max_parallel));
    let parent_view = services.state.scope_view(&parent.workflow_id)?;
    let mut join_set: JoinSet<(String, TaskOutcome)> = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let task_id = format!("{}.item{}", parent.workflow_id, index);
        let budget = parent.deadline.child_budget(step_timeout);
        let metadata = json!({
            "task": task_name,
            "index": index,
            "prompt_override": prompt_override,
        });
        services.progress.task_status(&task_id, TaskStatus::Pending, &metadata);

        let services = services.clone();
        let template = template.clone();
        let task_definition = Arc::clone(&task_definition);
        let pool = Arc::clone(&pool);
        let parent_view = parent_view.clone();

        // Boxed so the sub-task future does not embed the driver's own
        // future type (the driver awaits this orchestrator).
        let task_future: BoxFuture<'static, (String, TaskOutcome)> = Box::pin(async move {
            let _permit = pool.acquire_owned().await.expect("fan-out semaphore closed");
            let outcome = run_sub_task(&services, &task_definition, &template, &task_id, item, index, total, budget, &parent_view, &metadata)
                .await;
            (task_id, outcome)
        });
        join_set.spawn(task_future);
    }

    let mut tasks = JsonMap::new();
    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut timed_out = 0usize;
    let mut first_error: Option<WorkflowError> = None;

    while let Some(joined) = join_set.join_next().await {
        let (task_id, outcome) = match joined {
            Ok(entry) => entry,
            Err(join_error) => {
                warn!(error = %join_error, "sub-agent task panicked");
                continue;
            }
        };
        match outcome.status {
            TaskStatus::Completed => completed += 1,
            TaskStatus::Timeout => timed_out += 1,
            _ => failed += 1,
        }
        if outcome.status != TaskStatus::Completed && first_error.is_none() {
            first_error = outcome.error.clone();
            if !wait_for_all {
                // Conservative reading: the first failure becomes the step
                // result, but every remaining task still drains for cleanup.
                debug!(task_id = %task_id, "wait_for_all=false; recording first failure while draining peers");
            }
        }
        tasks.insert(task_id, serde_json::to_value(&outcome).unwrap_or(JsonValue::Null));
    }

    info!(step_id = %step.id, completed, failed, timed_out, "sub-agent fan-out finished");
    let mut summary = JsonMap::new();
    summary.insert("tasks".to_string(), JsonValue::Object(tasks));
    summary.insert("total".to_string(), JsonValue::from(total));
    summary.insert("completed".to_string(), JsonValue::from(completed));
    summary.insert("failed".to_string(), JsonValue::from(failed));
    summary.insert("timeout".to_string(), JsonValue::from(timed_out));
    if let Some(error) = first_error {
        summary.insert("first_error".to_string(), serde_json::to_value(&error).unwrap_or(JsonValue::Null));
    }
    Ok(JsonValue::Object(summary))
}

fn empty_summary() -> JsonValue {
    json!({"tasks": {}, "total": 0, "completed": 0, "failed": 0, "timeout": 0})
}

/// Expands a task template into a standalone definition for its instances.
fn definition_from_template(parent_name: &str, task_name: &str, template: &SubAgentTaskDefinition) -> WorkflowDefinition {
    let mut definition = WorkflowDefinition {
        name: format!("{parent_name}#{task_name}"),
        description: template.description.clone(),
        version: None,
        inputs: template.inputs.clone(),
        default_state: template.default_state.clone(),
        state_schema: template.state_schema.clone(),
        steps: template.steps.clone(),
        sub_agent_tasks: Default::default(),
    };
    definition.normalize_step_ids();
    definition
}

/// Builds the task's `inputs` tier: the implicit fan-out bindings plus the
/// template's declared inputs mapped from the parent's flattened view.
fn build_task_inputs(
    template: &SubAgentTaskDefinition,
    parent_view: &JsonMap<String, JsonValue>,
    item: &JsonValue,
    index: usize,
    total: usize,
) -> WorkflowResult<JsonMap<String, JsonValue>> {
    let mut inputs = JsonMap::new();
    inputs.insert("item".to_string(), item.clone());
    inputs.insert("index".to_string(), JsonValue::from(index));
    inputs.insert("total".to_string(), JsonValue::from(total));

    for (name, declaration) in &template.inputs {
        let candidate = parent_view.get(name).cloned().or_else(|| declaration.default.clone());
        validate_input_value(name, declaration, candidate.as_ref())?;
        if let Some(value) = candidate {
            inputs.insert(name.clone(), value);
        }
    }
    Ok(inputs)
}

/// Runs one sub-agent task to its terminal status, cleaning up its
/// transient resources regardless of outcome.
#[allow(clippy::too_many_arguments)]
async fn run_sub_task(
    services: &ExecutionServices,
    task_definition: &Arc<WorkflowDefinition>,
    template: &SubAgentTaskDefinition,
    task_id: &str,
    item: JsonValue,
    index: usize,
    total: usize,
    budget: Duration,
    parent_view: &JsonMap<String, JsonValue>,
    metadata: &JsonValue,
) -> TaskOutcome {
    let outcome = match tokio::time::timeout(
        budget,
        drive_sub_task(services, task_definition, template, task_id, item, index, total, budget, parent_view, metadata),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(task_id, budget_secs = budget.as_secs(), "sub-agent task timed out");
            services.progress.task_status(task_id, TaskStatus::Timeout, metadata);
            TaskOutcome {
                status: TaskStatus::Timeout,
                result: None,
                error: Some(WorkflowError::new(
                    ErrorCode::SubagentTimeout,
                    format!("sub-agent task '{task_id}' exceeded its {}s budget", budget.as_secs()),
                )),
            }
        }
    };

    // Cleanup handlers run in reverse registration order; the state cell is
    // released last so handlers may still read it.
    services.cleanup.run_for(task_id, services.config.recovery_timeout);
    services.state.remove(task_id);
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn drive_sub_task(
    services: &ExecutionServices,
    task_definition: &Arc<WorkflowDefinition>,
    template: &SubAgentTaskDefinition,
    task_id: &str,
    item: JsonValue,
    index: usize,
    total: usize,
    budget: Duration,
    parent_view: &JsonMap<String, JsonValue>,
    metadata: &JsonValue,
) -> TaskOutcome {
    let failed = |error: WorkflowError| TaskOutcome {
        status: TaskStatus::Failed,
        result: None,
        error: Some(error),
    };

    let inputs = match build_task_inputs(template, parent_view, &item, index, total) {
        Ok(inputs) => inputs,
        Err(error) => return failed(error),
    };
    if let Err(error) = services
        .state
        .initialize(task_id, inputs.clone(), &template.default_state.state, &template.state_schema)
    {
        return failed(error);
    }

    let mut instance = WorkflowInstance::new(
        task_id.to_string(),
        Arc::clone(task_definition),
        DeadlineTracker::new(budget),
        inputs,
        None,
    );
    instance.status = WorkflowStatus::Running;
    services.progress.task_status(task_id, TaskStatus::Running, metadata);

    loop {
        let batch = match run_until_batch(services, &mut instance, false).await {
            Ok(batch) => batch,
            Err(error) => {
                instance.finish(WorkflowStatus::Failed, Some(error.clone()));
                services.progress.task_status(task_id, TaskStatus::Failed, metadata);
                return failed(WorkflowError::new(ErrorCode::SubagentFailed, error.to_string()).with_step(error.step_id.unwrap_or_default()));
            }
        };

        for step in &batch {
            match services.dispatcher.dispatch(task_id, step).await {
                Ok(updates) => {
                    if !updates.is_empty()
                        && let Err(error) = services.state.update(task_id, &updates, None)
                    {
                        instance.finish(WorkflowStatus::Failed, Some(error.clone()));
                        services.progress.task_status(task_id, TaskStatus::Failed, metadata);
                        return failed(WorkflowError::new(ErrorCode::SubagentFailed, error.to_string()));
                    }
                }
                Err(error) => {
                    instance.finish(WorkflowStatus::Failed, Some(error.clone()));
                    services.progress.task_status(task_id, TaskStatus::Failed, metadata);
                    return failed(WorkflowError::new(ErrorCode::SubagentFailed, error.to_string()));
                }
            }
        }

        if instance.frames.is_empty() {
            break;
        }
    }

    instance.finish(WorkflowStatus::Completed, None);
    services.progress.task_status(task_id, TaskStatus::Completed, metadata);

    let result = services
        .state
        .read(task_id, None)
        .map(|snapshot| {
            let mut projected = snapshot.state;
            for (name, value) in snapshot.computed {
                projected.entry(name).or_insert(value);
            }
            JsonValue::Object(projected)
        })
        .unwrap_or(JsonValue::Null);

    TaskOutcome {
        status: TaskStatus::Completed,
        result: Some(result),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template_of(value: JsonValue) -> SubAgentTaskDefinition {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn task_inputs_carry_item_index_total() {
        let template = template_of(json!({"steps": []}));
        let parent_view = JsonMap::new();
        let inputs = build_task_inputs(&template, &parent_view, &json!("a"), 1, 3).unwrap();
        assert_eq!(inputs.get("item"), Some(&json!("a")));
        assert_eq!(inputs.get("index"), Some(&json!(1)));
        assert_eq!(inputs.get("total"), Some(&json!(3)));
    }

    #[test]
    fn declared_inputs_map_from_parent_view() {
        let template = template_of(json!({
            "inputs": {
                "project": {"type": "string", "required": true},
                "mode": {"type": "string", "default": "fast"}
            },
            "steps": []
        }));
        let parent_view = json!({"project": "windlass", "unrelated": 1}).as_object().unwrap().clone();
        let inputs = build_task_inputs(&template, &parent_view, &json!(0), 0, 1).unwrap();
        assert_eq!(inputs.get("project"), Some(&json!("windlass")));
        assert_eq!(inputs.get("mode"), Some(&json!("fast")));
        assert!(!inputs.contains_key("unrelated"));
    }

    #[test]
    fn missing_required_declared_input_fails_the_task() {
        let template = template_of(json!({
            "inputs": {"needed": {"type": "string", "required": true}},
            "steps": []
        }));
        let parent_view = JsonMap::new();
        let error = build_task_inputs(&template, &parent_view, &json!(0), 0, 1).unwrap_err();
        assert_eq!(error.code, ErrorCode::InvalidInput);
    }

    #[test]
    fn template_expansion_normalizes_step_ids() {
        let template = template_of(json!({
            "steps": [{"type": "user_message", "message": "hi"}]
        }));
        let definition = definition_from_template("test:parent", "work", &template);
        assert_eq!(definition.name, "test:parent#work");
        assert_eq!(definition.steps[0].id, "step_1");
        assert!(definition.sub_agent_tasks.is_empty());
    }
}
