//! Public workflow engine facade.
//!
//! Owns the live instance map and exposes the transport-agnostic API:
//! `start`, `get_next_step`, status/listing queries, and the state
//! read/write surface used by tools. Per-instance access is serialized
//! through an async mutex; the engine never drives the same instance from
//! two places at once.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windlass_types::{
    NextStepBatch, StartResult, StateSnapshot, StateUpdateSpec, WorkflowDefinition, WorkflowError, WorkflowResult,
    WorkflowStatus, WorkflowStatusReport, WorkflowSummary, validate_input_value,
};

use crate::orchestrator::{AgentDispatcher, NoopDispatcher, NoopProgress, ProgressSink};
use crate::resources::{CleanupRegistry, DeadlineTracker, EngineConfig, ResourceCoordinator};
use crate::state::StateManager;

use super::drive::{ExecutionServices, run_until_batch};
use super::instance::WorkflowInstance;
use super::runner::{CommandRunner, ShellCommandRunner};

/// The engine: instance registry plus the shared execution services.
pub struct WorkflowEngine {
    services: ExecutionServices,
    resources: Arc<ResourceCoordinator>,
    instances: RwLock<HashMap<String, Arc<Mutex<WorkflowInstance>>>>,
}

impl WorkflowEngine {
    /// Builds an engine with the given configuration and the default
    /// collaborators (real shell runner, no-op dispatcher and progress sink).
    pub fn new(config: EngineConfig) -> Self {
        let resources = Arc::new(ResourceCoordinator::new(&config));
        Self {
            services: ExecutionServices {
                config,
                state: Arc::new(StateManager::new()),
                runner: Arc::new(ShellCommandRunner),
                dispatcher: Arc::new(NoopDispatcher),
                progress: Arc::new(NoopProgress),
                cleanup: Arc::new(CleanupRegistry::new()),
            },
            resources,
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Substitutes the shell runner (tests, sandboxes, recorders).
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.services.runner = runner;
        self
    }

    /// Substitutes the sub-agent client-step dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        self.services.dispatcher = dispatcher;
        self
    }

    /// Substitutes the fan-out progress sink.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.services.progress = progress;
        self
    }

    /// Creates and registers an instance of `definition`.
    ///
    /// Inputs are validated against the declared schema and merged with
    /// declared defaults; the computed graph is built (rejecting cycles);
    /// admission control applies (`CIRCUIT_BREAKER_OPEN`, active-workflow
    /// cap). The instance starts in `running` with its top-level steps as
    /// the root frame.
    pub async fn start(&self, mut definition: WorkflowDefinition, inputs: Option<JsonMap<String, JsonValue>>) -> WorkflowResult<StartResult> {
        definition.normalize_step_ids();
        let provided = inputs.unwrap_or_default();
        let merged_inputs = merge_inputs(&definition, provided)?;

        let permit = self.resources.admit().await?;
        let workflow_id = self.fresh_workflow_id();

        let timeout = self.services.config.workflow_timeout;
        let snapshot = self.services.state.initialize(
            &workflow_id,
            merged_inputs.clone(),
            &definition.default_state.state,
            &definition.state_schema,
        )?;

        let definition = Arc::new(definition);
        let mut instance = WorkflowInstance::new(
            workflow_id.clone(),
            Arc::clone(&definition),
            DeadlineTracker::new(timeout),
            merged_inputs,
            Some(permit),
        );
        instance.status = WorkflowStatus::Running;
        let created_at = instance.created_at;
        let total_steps = definition.total_steps();

        self.instances
            .write()
            .expect("instance map lock poisoned")
            .insert(workflow_id.clone(), Arc::new(Mutex::new(instance)));

        info!(workflow_id = %workflow_id, workflow = %definition.name, total_steps, "workflow started");
        Ok(StartResult {
            workflow_id,
            status: WorkflowStatus::Running,
            total_steps,
            state: snapshot,
            created_at,
        })
    }

    /// Drives the instance and returns its next client batch, or `None` once
    /// the workflow has completed.
    ///
    /// Calling this again implicitly acknowledges the previous batch: any
    /// state the client steps were expected to produce must have been
    /// written through [`WorkflowEngine::update_state`] in the meantime.
    pub async fn get_next_step(&self, workflow_id: &str) -> WorkflowResult<Option<NextStepBatch>> {
        let handle = self.instance_handle(workflow_id)?;
        let mut instance = handle.lock().await;

        match instance.status {
            WorkflowStatus::Completed => return Ok(None),
            WorkflowStatus::Failed | WorkflowStatus::Timeout | WorkflowStatus::Cancelled => {
                return Err(instance
                    .terminal_error
                    .clone()
                    .unwrap_or_else(|| WorkflowError::internal(format!("workflow '{workflow_id}' already terminal"))));
            }
            WorkflowStatus::Paused => {
                return Err(WorkflowError::constraint_violation(format!("workflow '{workflow_id}' is paused")));
            }
            WorkflowStatus::Pending | WorkflowStatus::Running => {}
        }
        instance.status = WorkflowStatus::Running;

        match run_until_batch(&self.services, &mut instance, true).await {
            Ok(batch) => {
                if instance.frames.is_empty() {
                    instance.finish(WorkflowStatus::Completed, None);
                    self.resources.record_success();
                    self.services.cleanup.run_for(workflow_id, self.services.config.recovery_timeout);
                    info!(workflow_id, "workflow completed");
                }
                if batch.is_empty() {
                    debug_assert!(instance.frames.is_empty(), "an empty batch only occurs at completion");
                    Ok(None)
                } else {
                    Ok(Some(NextStepBatch { steps: batch }))
                }
            }
            Err(error) => {
                let terminal_status = if error.code == windlass_types::ErrorCode::Timeout {
                    WorkflowStatus::Timeout
                } else {
                    WorkflowStatus::Failed
                };
                warn!(workflow_id, error = %error, "workflow failed");
                instance.finish(terminal_status, Some(error.clone()));
                self.resources.record_failure();
                self.services.cleanup.run_for(workflow_id, self.services.config.recovery_timeout);
                Err(error)
            }
        }
    }

    /// Full status report for one instance.
    pub async fn get_workflow_status(&self, workflow_id: &str) -> WorkflowResult<WorkflowStatusReport> {
        let handle = self.instance_handle(workflow_id)?;
        let instance = handle.lock().await;
        let state = self.services.state.read(workflow_id, None)?;
        Ok(WorkflowStatusReport {
            workflow_id: instance.workflow_id.clone(),
            workflow_name: instance.definition.name.clone(),
            status: instance.status,
            created_at: instance.created_at,
            completed_at: instance.completed_at,
            total_steps: instance.definition.total_steps(),
            state,
            execution_context: "server".to_string(),
            error: instance.terminal_error.clone(),
            warnings: instance.warnings.clone(),
        })
    }

    /// Lists all registered instances, newest last.
    pub async fn list_active_workflows(&self) -> Vec<WorkflowSummary> {
        let handles: Vec<Arc<Mutex<WorkflowInstance>>> =
            self.instances.read().expect("instance map lock poisoned").values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let instance = handle.lock().await;
            summaries.push(WorkflowSummary {
                workflow_id: instance.workflow_id.clone(),
                workflow_name: instance.definition.name.clone(),
                status: instance.status,
                created_at: instance.created_at,
            });
        }
        summaries.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        summaries
    }

    /// Reads the three tiers (plus the `raw` alias), optionally narrowed to
    /// tier-qualified paths.
    pub fn read_state(&self, workflow_id: &str, paths: Option<&[String]>) -> WorkflowResult<StateSnapshot> {
        self.services.state.read(workflow_id, paths)
    }

    /// Applies an update batch on behalf of a tool or client step result.
    pub fn update_state(&self, workflow_id: &str, updates: &[StateUpdateSpec]) -> WorkflowResult<StateSnapshot> {
        self.services.state.update(workflow_id, updates, None)
    }

    /// Ingests a `user_input` result: coerces to the step's declared
    /// `input_type`, checks its validation expression, and applies the
    /// step's `state_update` with the accepted value.
    pub fn ingest_user_input(
        &self,
        workflow_id: &str,
        step: &windlass_types::MaterializedStep,
        value: JsonValue,
    ) -> WorkflowResult<StateSnapshot> {
        let accepted = crate::interaction::accept_user_input(step, value)?;
        let updates = crate::interaction::user_input_updates(step, accepted);
        if updates.is_empty() {
            return self.services.state.read(workflow_id, None);
        }
        self.services.state.update(workflow_id, &updates, None)
    }

    /// Ingests an `agent_response` payload: checks the step's
    /// `response_schema` and applies its `state_updates` with `response`
    /// fields substituted.
    pub fn ingest_agent_response(
        &self,
        workflow_id: &str,
        step: &windlass_types::MaterializedStep,
        response: JsonValue,
    ) -> WorkflowResult<StateSnapshot> {
        let updates = crate::interaction::accept_agent_response(step, response)?;
        if updates.is_empty() {
            return self.services.state.read(workflow_id, None);
        }
        self.services.state.update(workflow_id, &updates, None)
    }

    /// Captures an in-memory checkpoint of a workflow's state tiers.
    pub fn checkpoint_state(&self, workflow_id: &str) -> WorkflowResult<crate::state::StateCheckpoint> {
        self.services.state.checkpoint(workflow_id)
    }

    /// Restores a checkpoint previously captured for the same workflow.
    pub fn restore_state(&self, checkpoint: crate::state::StateCheckpoint) -> WorkflowResult<()> {
        self.services.state.restore(checkpoint)
    }

    /// Suspends a running workflow; `resume_workflow` lifts the suspension.
    pub async fn pause_workflow(&self, workflow_id: &str) -> WorkflowResult<()> {
        let handle = self.instance_handle(workflow_id)?;
        let mut instance = handle.lock().await;
        if instance.status.is_terminal() {
            return Err(WorkflowError::constraint_violation(format!(
                "workflow '{workflow_id}' is already terminal"
            )));
        }
        instance.status = WorkflowStatus::Paused;
        Ok(())
    }

    /// Resumes a paused workflow.
    pub async fn resume_workflow(&self, workflow_id: &str) -> WorkflowResult<()> {
        let handle = self.instance_handle(workflow_id)?;
        let mut instance = handle.lock().await;
        if instance.status != WorkflowStatus::Paused {
            return Err(WorkflowError::constraint_violation(format!("workflow '{workflow_id}' is not paused")));
        }
        instance.status = WorkflowStatus::Running;
        Ok(())
    }

    /// Cancels a workflow: terminal `cancelled`, cleanup handlers run,
    /// resources released. The instance remains queryable until removed.
    pub async fn cancel_workflow(&self, workflow_id: &str) -> WorkflowResult<()> {
        let handle = self.instance_handle(workflow_id)?;
        let mut instance = handle.lock().await;
        if instance.status.is_terminal() {
            return Ok(());
        }
        instance.finish(
            WorkflowStatus::Cancelled,
            Some(WorkflowError::constraint_violation("workflow cancelled by caller")),
        );
        self.services.cleanup.run_for(workflow_id, self.services.config.recovery_timeout);
        info!(workflow_id, "workflow cancelled");
        Ok(())
    }

    /// Drops a terminal instance and its state. Running instances are
    /// cancelled first.
    pub async fn remove_workflow(&self, workflow_id: &str) -> WorkflowResult<()> {
        self.cancel_workflow(workflow_id).await?;
        self.instances.write().expect("instance map lock poisoned").remove(workflow_id);
        self.services.state.remove(workflow_id);
        debug!(workflow_id, "workflow removed");
        Ok(())
    }

    /// Manually closes the admission circuit breaker.
    pub fn reset_circuit_breaker(&self) {
        self.resources.reset_breaker();
    }

    fn instance_handle(&self, workflow_id: &str) -> WorkflowResult<Arc<Mutex<WorkflowInstance>>> {
        self.instances
            .read()
            .expect("instance map lock poisoned")
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::workflow_not_found(workflow_id))
    }

    /// `wf_` + 8 lowercase hex chars, re-drawn on the (unlikely) collision.
    fn fresh_workflow_id(&self) -> String {
        loop {
            let candidate = format!("wf_{}", &Uuid::new_v4().simple().to_string()[..8]);
            if !self.instances.read().expect("instance map lock poisoned").contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// Validates caller inputs against the declared schema and merges defaults.
fn merge_inputs(definition: &WorkflowDefinition, provided: JsonMap<String, JsonValue>) -> WorkflowResult<JsonMap<String, JsonValue>> {
    let mut merged = JsonMap::new();
    for (name, declaration) in &definition.inputs {
        let candidate = provided.get(name);
        validate_input_value(name, declaration, candidate)?;
        match candidate {
            Some(value) => {
                merged.insert(name.clone(), value.clone());
            }
            None => {
                if let Some(default) = &declaration.default {
                    merged.insert(name.clone(), default.clone());
                }
            }
        }
    }
    // Undeclared extras pass through; the validator component owns strictness.
    for (name, value) in provided {
        merged.entry(name).or_insert(value);
    }
    Ok(merged)
}
