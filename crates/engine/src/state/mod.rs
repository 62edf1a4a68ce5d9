//! Per-workflow three-tier state management.
//!
//! Each workflow instance owns an isolated store with `inputs`, `state`, and
//! `computed` tiers. Mutation happens only through atomic update batches;
//! computed fields are recomputed after each successful batch in dependency
//! order. Every store sits behind its own lock, so two workflows (or a
//! parent and its sub-agents) never contend with each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::debug;
use windlass_types::{StateSchema, StateSnapshot, StateUpdateSpec, WorkflowError, WorkflowResult};

mod computed;
mod paths;

pub use computed::{ComputedGraph, flatten_tiers, scope_maps};
pub use paths::{ParsedPath, WritableTier, apply_operation, is_writable_path, parse_update_path, read_segments};

/// The three tiers plus the monotonically increasing batch version.
#[derive(Debug, Clone, Default)]
pub struct WorkflowState {
    pub inputs: JsonMap<String, JsonValue>,
    pub state: JsonMap<String, JsonValue>,
    pub computed: JsonMap<String, JsonValue>,
    pub version: u64,
}

impl WorkflowState {
    /// Projects the tiers into the flattened read view
    /// (`computed > state > inputs`).
    pub fn flattened(&self) -> JsonMap<String, JsonValue> {
        flatten_tiers(&self.inputs, &self.state, &self.computed)
    }

    /// Builds the boundary snapshot, including the legacy `raw` alias.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            inputs: self.inputs.clone(),
            state: self.state.clone(),
            computed: self.computed.clone(),
            raw: self.state.clone(),
        }
    }
}

/// One workflow's store: tier data behind a lock, plus its computed graph.
struct StateCell {
    state: Mutex<WorkflowState>,
    graph: ComputedGraph,
}

/// An in-memory checkpoint of one workflow's tiers and version.
#[derive(Debug, Clone)]
pub struct StateCheckpoint {
    workflow_id: String,
    state: WorkflowState,
}

/// Owns the state stores of all live workflow instances.
#[derive(Default)]
pub struct StateManager {
    cells: RwLock<HashMap<String, Arc<StateCell>>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a workflow's store: `inputs` from the caller (already merged
    /// with declared defaults), `state` from `default_state.state`, and a
    /// first full computation pass over `state_schema.computed`.
    ///
    /// Fails with `CIRCULAR_DEPENDENCY` when the computed graph has a cycle
    /// and with `EXPRESSION_ERROR` when a transform does not compile.
    pub fn initialize(
        &self,
        workflow_id: &str,
        inputs: JsonMap<String, JsonValue>,
        default_state: &JsonMap<String, JsonValue>,
        schema: &StateSchema,
    ) -> WorkflowResult<StateSnapshot> {
        let graph = ComputedGraph::build(&schema.computed)?;
        let mut state = WorkflowState {
            inputs,
            state: default_state.clone(),
            computed: JsonMap::new(),
            version: 0,
        };
        graph.recompute(&state.inputs, &state.state, &mut state.computed, None)?;

        let snapshot = state.snapshot();
        let cell = Arc::new(StateCell {
            state: Mutex::new(state),
            graph,
        });
        self.cells.write().expect("state manager lock poisoned").insert(workflow_id.to_string(), cell);
        debug!(workflow_id, "state initialized");
        Ok(snapshot)
    }

    fn cell(&self, workflow_id: &str) -> WorkflowResult<Arc<StateCell>> {
        self.cells
            .read()
            .expect("state manager lock poisoned")
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::workflow_not_found(workflow_id))
    }

    /// Returns a consistent snapshot of all tiers (plus the `raw` alias),
    /// optionally narrowed to the given tier-qualified paths.
    pub fn read(&self, workflow_id: &str, path_filter: Option<&[String]>) -> WorkflowResult<StateSnapshot> {
        let cell = self.cell(workflow_id)?;
        let state = cell.state.lock().expect("state lock poisoned");
        let mut snapshot = state.snapshot();
        drop(state);

        if let Some(requested) = path_filter {
            snapshot.inputs = filter_tier(&snapshot.inputs, "inputs", requested);
            snapshot.state = filter_tier(&snapshot.state, "state", requested);
            snapshot.computed = filter_tier(&snapshot.computed, "computed", requested);
            snapshot.raw = snapshot.state.clone();
        }
        Ok(snapshot)
    }

    /// Returns the flattened view (`computed > state > inputs` precedence).
    pub fn flattened_view(&self, workflow_id: &str) -> WorkflowResult<JsonMap<String, JsonValue>> {
        let cell = self.cell(workflow_id)?;
        let state = cell.state.lock().expect("state lock poisoned");
        Ok(state.flattened())
    }

    /// Returns the expression scope: the flattened view plus the tier
    /// objects (`inputs`, `state`, `computed`, legacy `raw`), so templates
    /// may address values either way.
    pub fn scope_view(&self, workflow_id: &str) -> WorkflowResult<JsonMap<String, JsonValue>> {
        let cell = self.cell(workflow_id)?;
        let state = cell.state.lock().expect("state lock poisoned");
        Ok(scope_maps(&state.inputs, &state.state, &state.computed))
    }

    /// Current batch version.
    pub fn version(&self, workflow_id: &str) -> WorkflowResult<u64> {
        let cell = self.cell(workflow_id)?;
        let state = cell.state.lock().expect("state lock poisoned");
        Ok(state.version)
    }

    /// Applies an update batch atomically.
    ///
    /// The whole batch is validated first: any path outside `inputs.*` /
    /// `state.*` (after `raw.*` normalization) rejects the batch with
    /// `INVALID_PATH` and no tier changes. When `expected_version` is given
    /// and stale, the batch is rejected with `VERSION_CONFLICT`. After the
    /// primary-tier writes, affected computed fields are recomputed once; a
    /// `propagate` transform failure also rejects the whole batch.
    pub fn update(
        &self,
        workflow_id: &str,
        updates: &[StateUpdateSpec],
        expected_version: Option<u64>,
    ) -> WorkflowResult<StateSnapshot> {
        let cell = self.cell(workflow_id)?;
        let mut state = cell.state.lock().expect("state lock poisoned");

        if let Some(expected) = expected_version
            && expected != state.version
        {
            return Err(WorkflowError::version_conflict(expected, state.version));
        }

        // Validate every path before touching anything.
        let mut parsed_paths = Vec::with_capacity(updates.len());
        for update in updates {
            parsed_paths.push(parse_update_path(&update.path)?);
        }

        // Mutate a working copy so a failing operation or propagate-policy
        // transform leaves the committed state untouched.
        let mut working = state.clone();
        let mut changed_paths = Vec::with_capacity(updates.len());
        for (update, parsed) in updates.iter().zip(&parsed_paths) {
            let tier_map = match parsed.tier {
                WritableTier::Inputs => &mut working.inputs,
                WritableTier::State => &mut working.state,
            };
            apply_operation(tier_map, parsed, update.operation, &update.value)?;
            changed_paths.push(parsed.canonical());
        }

        cell.graph
            .recompute(&working.inputs, &working.state, &mut working.computed, Some(&changed_paths))?;

        working.version = state.version + 1;
        *state = working;
        debug!(workflow_id, version = state.version, paths = ?changed_paths, "state updated");
        Ok(state.snapshot())
    }

    /// Captures an in-memory checkpoint of the current tiers and version.
    pub fn checkpoint(&self, workflow_id: &str) -> WorkflowResult<StateCheckpoint> {
        let cell = self.cell(workflow_id)?;
        let state = cell.state.lock().expect("state lock poisoned");
        Ok(StateCheckpoint {
            workflow_id: workflow_id.to_string(),
            state: state.clone(),
        })
    }

    /// Restores a checkpoint previously captured for the same workflow.
    pub fn restore(&self, checkpoint: StateCheckpoint) -> WorkflowResult<()> {
        let cell = self.cell(&checkpoint.workflow_id)?;
        let mut state = cell.state.lock().expect("state lock poisoned");
        *state = checkpoint.state;
        Ok(())
    }

    /// Drops a workflow's store. Safe to call for unknown ids.
    pub fn remove(&self, workflow_id: &str) {
        self.cells.write().expect("state manager lock poisoned").remove(workflow_id);
    }
}

/// Keeps only the tier entries named by tier-qualified filter paths.
fn filter_tier(tier: &JsonMap<String, JsonValue>, tier_name: &str, requested: &[String]) -> JsonMap<String, JsonValue> {
    let prefix = format!("{tier_name}.");
    let mut kept = JsonMap::new();
    for path in requested {
        let Some(rest) = path.strip_prefix(&prefix) else { continue };
        let top_level = rest.split('.').next().unwrap_or(rest);
        if let Some(value) = tier.get(top_level) {
            kept.insert(top_level.to_string(), value.clone());
        }
    }
    kept
}
