//! Execution frames: the interpreter's pending-step stack.
//!
//! Each frame owns a slice of pending steps, an index-based program counter,
//! and the loop bindings visible to steps inside it. Loops are frames;
//! conditionals are not (their selected branch is inlined into the enclosing
//! frame at the program counter). This index-based representation keeps the
//! stack serializable and avoids recursion in the driver loop.

use serde_json::{Map as JsonMap, Value as JsonValue};
use windlass_types::WorkflowStep;

/// What kind of scope a frame represents.
#[derive(Debug, Clone)]
pub enum FrameKind {
    /// The top-level step list.
    Root,
    /// An active `while_loop`.
    While(WhileFrame),
    /// An active `foreach`.
    Foreach(ForeachFrame),
}

/// Loop bookkeeping for `while_loop` frames.
#[derive(Debug, Clone)]
pub struct WhileFrame {
    /// Condition source, re-evaluated before each iteration.
    pub condition: String,
    /// Body template cloned into the frame per iteration.
    pub body: Vec<WorkflowStep>,
    /// Iteration ceiling; reaching it completes the loop with a warning.
    pub max_iterations: u32,
    /// Completed iteration count.
    pub iteration: u32,
}

/// Loop bookkeeping for `foreach` frames.
#[derive(Debug, Clone)]
pub struct ForeachFrame {
    /// Materialized item list.
    pub items: Vec<JsonValue>,
    /// Body template cloned into the frame per item.
    pub body: Vec<WorkflowStep>,
    /// Index of the next item to bind.
    pub next_index: usize,
}

/// One active execution scope.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Pending steps at this scope.
    pub steps: Vec<WorkflowStep>,
    /// Index of the next step to process.
    pub pc: usize,
    /// Scope kind and loop bookkeeping.
    pub kind: FrameKind,
    /// Frame-local bindings (`item`, `loop`, `attempt_number`). Visible to
    /// this frame and its children; inner frames shadow outer ones.
    pub bindings: JsonMap<String, JsonValue>,
}

impl Frame {
    /// Root frame over the top-level step list.
    pub fn root(steps: Vec<WorkflowStep>) -> Self {
        Self {
            steps,
            pc: 0,
            kind: FrameKind::Root,
            bindings: JsonMap::new(),
        }
    }

    /// True when every pending step at this scope has been consumed.
    pub fn exhausted(&self) -> bool {
        self.pc >= self.steps.len()
    }

    /// True for loop scopes, which authorize `break`/`continue`.
    pub fn is_loop(&self) -> bool {
        matches!(self.kind, FrameKind::While(_) | FrameKind::Foreach(_))
    }
}

/// The per-instance stack of active frames.
#[derive(Debug, Clone, Default)]
pub struct FrameStack {
    frames: Vec<Frame>,
}

impl FrameStack {
    /// A stack holding just the root frame.
    pub fn new(top_level_steps: Vec<WorkflowStep>) -> Self {
        Self {
            frames: vec![Frame::root(top_level_steps)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Innermost frame.
    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// The head step of the innermost frame, if any.
    pub fn current_step(&self) -> Option<&WorkflowStep> {
        let frame = self.frames.last()?;
        frame.steps.get(frame.pc)
    }

    /// Consumes the head step of the innermost frame.
    pub fn advance(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc += 1;
        }
    }

    /// Inserts steps at the head of the innermost frame's pending queue.
    /// Used by `conditional` to inline the selected branch.
    pub fn inline_at_head(&mut self, steps: Vec<WorkflowStep>) {
        if let Some(frame) = self.frames.last_mut() {
            frame.steps.splice(frame.pc..frame.pc, steps);
        }
    }

    /// Index of the innermost loop frame, if any.
    pub fn innermost_loop(&self) -> Option<usize> {
        self.frames.iter().rposition(Frame::is_loop)
    }

    /// Pops every frame above (and including, when `inclusive`) the frame at
    /// `index`. Used by `break` (inclusive) and `continue` (exclusive).
    pub fn unwind_to(&mut self, index: usize, inclusive: bool) {
        let keep = if inclusive { index } else { index + 1 };
        self.frames.truncate(keep);
    }

    /// Merged frame bindings, outermost first so inner frames shadow.
    pub fn merged_bindings(&self) -> JsonMap<String, JsonValue> {
        let mut merged = JsonMap::new();
        for frame in &self.frames {
            for (name, value) in &frame.bindings {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }
}

/// Assigns deterministic ids to expanded nested steps that lack one.
///
/// Branch and loop bodies are authored inline and usually unnamed; naming
/// them `<parent>.<branch>.<n>` keeps ids unique within their dynamic scope
/// and traceable in diagnostics.
pub fn name_nested_steps(parent_id: &str, branch: &str, steps: &mut [WorkflowStep]) {
    for (index, step) in steps.iter_mut().enumerate() {
        if step.id.trim().is_empty() {
            step.id = format!("{parent_id}.{branch}.{}", index + 1);
        }
    }
}
