//! Runtime record of one workflow instance.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::sync::OwnedSemaphorePermit;
use windlass_types::{WorkflowDefinition, WorkflowError, WorkflowStatus};

use crate::frames::FrameStack;
use crate::resources::DeadlineTracker;

/// One live workflow: status, frame stack, deadlines, and diagnostics.
///
/// The engine serializes access per instance; there is never more than one
/// driver advancing a given instance's queue.
pub struct WorkflowInstance {
    /// Opaque id (`wf_` + 8 hex chars), also the state-store key.
    pub workflow_id: String,
    /// The immutable definition this instance executes.
    pub definition: Arc<WorkflowDefinition>,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Pending-step frame stack.
    pub frames: FrameStack,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Set when the instance reaches a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Workflow-tier deadline; step and interaction budgets derive from it.
    pub deadline: DeadlineTracker,
    /// Caller-provided inputs as accepted at `start`.
    pub input_snapshot: JsonMap<String, JsonValue>,
    /// Non-fatal diagnostics (loop guards and similar).
    pub warnings: Vec<WorkflowError>,
    /// Terminal error for failed instances.
    pub terminal_error: Option<WorkflowError>,
    /// Ids of server-processed steps, newest last. Internal diagnostics only;
    /// completion stays implicit and this list is surfaced nowhere.
    pub server_completed: Vec<String>,
    /// Admission slot held while the instance is active. `None` for
    /// sub-agent task instances, which are bounded by their fan-out instead.
    pub admission_permit: Option<OwnedSemaphorePermit>,
}

impl WorkflowInstance {
    /// Builds a pending instance over a definition's top-level steps.
    pub fn new(
        workflow_id: String,
        definition: Arc<WorkflowDefinition>,
        deadline: DeadlineTracker,
        input_snapshot: JsonMap<String, JsonValue>,
        admission_permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let frames = FrameStack::new(definition.steps.clone());
        Self {
            workflow_id,
            definition,
            status: WorkflowStatus::Pending,
            frames,
            created_at: Utc::now(),
            completed_at: None,
            deadline,
            input_snapshot,
            warnings: Vec::new(),
            terminal_error: None,
            server_completed: Vec::new(),
            admission_permit,
        }
    }

    /// Transitions into a terminal status, stamping `completed_at` and
    /// releasing the admission slot.
    pub fn finish(&mut self, status: WorkflowStatus, error: Option<WorkflowError>) {
        debug_assert!(status.is_terminal(), "finish requires a terminal status");
        self.status = status;
        self.completed_at = Some(Utc::now());
        if self.terminal_error.is_none() {
            self.terminal_error = error;
        }
        self.admission_permit = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use windlass_types::ErrorCode;

    fn minimal_instance() -> WorkflowInstance {
        let definition: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "name": "test:minimal",
            "steps": [{"id": "only", "type": "user_message", "message": "hi"}]
        }))
        .unwrap();
        WorkflowInstance::new(
            "wf_0badcafe".to_string(),
            Arc::new(definition),
            DeadlineTracker::new(Duration::from_secs(10)),
            JsonMap::new(),
            None,
        )
    }

    #[test]
    fn new_instances_are_pending_with_root_frame() {
        let instance = minimal_instance();
        assert_eq!(instance.status, WorkflowStatus::Pending);
        assert_eq!(instance.frames.current_step().unwrap().id, "only");
        assert!(instance.completed_at.is_none());
    }

    #[test]
    fn finish_stamps_completion_and_keeps_first_error() {
        let mut instance = minimal_instance();
        instance.finish(WorkflowStatus::Failed, Some(WorkflowError::timeout("too slow")));
        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert!(instance.completed_at.is_some());
        assert_eq!(instance.terminal_error.as_ref().unwrap().code, ErrorCode::Timeout);

        // A second finish must not overwrite the recorded terminal error.
        instance.finish(WorkflowStatus::Failed, Some(WorkflowError::internal("later")));
        assert_eq!(instance.terminal_error.as_ref().unwrap().code, ErrorCode::Timeout);
    }
}
