//! Control-flow step processors.
//!
//! Each processor rewrites the frame stack: `conditional` inlines its
//! selected branch into the enclosing frame, `while_loop` and `foreach`
//! push loop frames, `break`/`continue` unwind to the innermost loop frame.
//! None of them emit anything client-visible.

use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, warn};
use windlass_types::{ErrorCode, WorkflowError, WorkflowStep};

use crate::expr::{Scope, evaluate, evaluate_predicate};
use crate::frames::{ForeachFrame, Frame, FrameKind, FrameStack, WhileFrame, name_nested_steps};
use crate::registry::validate_step_fields;

/// Iteration ceiling applied when a `while_loop` declares none.
pub const DEFAULT_MAX_ITERATIONS: u32 = 25;

/// Builds the evaluation scope for a frame stack: the flattened state view
/// plus the merged loop bindings, inner frames shadowing outer ones.
pub fn build_scope(flattened: &JsonMap<String, JsonValue>, bindings: &JsonMap<String, JsonValue>) -> Scope {
    let mut scope = Scope::from_flattened(flattened);
    for (name, value) in bindings {
        scope.bind_json(name, value);
    }
    scope
}

/// Strips an optional `{{ ... }}` wrapper from a condition or items source.
///
/// Authors write both `condition: "{{ state.ready }}"` and
/// `condition: "state.ready"`; both spell the same expression.
pub fn normalize_expression_source(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(stripped) = trimmed.strip_prefix("{{") {
        let inner = stripped.strip_suffix("}}").unwrap_or(stripped);
        inner.trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// Processes a `conditional`: evaluates the condition and inlines the
/// selected branch at the head of the enclosing frame's pending queue.
pub fn process_conditional(step: &WorkflowStep, stack: &mut FrameStack, scope: &Scope) -> Result<(), WorkflowError> {
    validate_step_fields(step)?;
    let condition_source = step
        .string_field("condition")
        .map(normalize_expression_source)
        .unwrap_or_default();
    let selected_branch = match evaluate_predicate(&condition_source, scope) {
        Ok(true) => "then_steps",
        Ok(false) => "else_steps",
        Err(error) => return Err(WorkflowError::from(error).with_step(step.id.clone())),
    };

    let mut branch_steps = step.nested_steps(selected_branch)?;
    name_nested_steps(&step.id, selected_branch.trim_end_matches("_steps"), &mut branch_steps);
    debug!(step_id = %step.id, branch = selected_branch, count = branch_steps.len(), "conditional branch selected");

    stack.advance();
    stack.inline_at_head(branch_steps);
    Ok(())
}

/// Processes a `while_loop`: consumes the step and pushes a loop frame.
/// The first condition check happens on the next frame advance.
pub fn process_while_loop(step: &WorkflowStep, stack: &mut FrameStack, default_max_iterations: u32) -> Result<(), WorkflowError> {
    validate_step_fields(step)?;
    let condition = step
        .string_field("condition")
        .map(normalize_expression_source)
        .unwrap_or_default();
    let mut body = step.nested_steps("body")?;
    name_nested_steps(&step.id, "body", &mut body);
    let max_iterations = step
        .field("max_iterations")
        .and_then(JsonValue::as_u64)
        .map(|ceiling| ceiling as u32)
        .unwrap_or(default_max_iterations);

    stack.advance();
    stack.push(Frame {
        steps: Vec::new(),
        pc: 0,
        kind: FrameKind::While(WhileFrame {
            condition,
            body,
            max_iterations,
            iteration: 0,
        }),
        bindings: JsonMap::new(),
    });
    Ok(())
}

/// Processes a `foreach`: evaluates `items` (must yield an array) and pushes
/// a loop frame. Item binding happens on frame advance.
pub fn process_foreach(step: &WorkflowStep, stack: &mut FrameStack, scope: &Scope) -> Result<(), WorkflowError> {
    validate_step_fields(step)?;
    let items = evaluate_items(step, "items", scope)?;
    let mut body = step.nested_steps("body")?;
    name_nested_steps(&step.id, "body", &mut body);

    if step.field("parallel").and_then(JsonValue::as_bool) == Some(true) {
        // Body steps are driven through the same queue either way; fan-out
        // parallelism is the job of parallel_foreach.
        warn!(step_id = %step.id, "foreach parallel=true executes sequentially; use parallel_foreach for fan-out");
    }

    stack.advance();
    stack.push(Frame {
        steps: Vec::new(),
        pc: 0,
        kind: FrameKind::Foreach(ForeachFrame {
            items,
            body,
            next_index: 0,
        }),
        bindings: JsonMap::new(),
    });
    Ok(())
}

/// Evaluates a step field that must yield an array (`items`).
pub fn evaluate_items(step: &WorkflowStep, field: &str, scope: &Scope) -> Result<Vec<JsonValue>, WorkflowError> {
    let value = match step.field(field) {
        Some(JsonValue::String(source)) => {
            let expression = normalize_expression_source(source);
            evaluate(&expression, scope)
                .map_err(|error| WorkflowError::from(error).with_step(step.id.clone()))?
                .into_json()
        }
        Some(other) => other.clone(),
        None => JsonValue::Null,
    };
    match value {
        JsonValue::Array(items) => Ok(items),
        other => Err(WorkflowError::type_error(format!(
            "step '{}' field '{field}' must evaluate to an array, got {}",
            step.id,
            windlass_types::workflow::validation::json_type_name(&other)
        ))
        .with_step(step.id.clone())),
    }
}

/// Processes a `break`: unwinds through and including the innermost loop
/// frame, clearing its pending queue.
pub fn process_break(step: &WorkflowStep, stack: &mut FrameStack) -> Result<(), WorkflowError> {
    let Some(loop_index) = stack.innermost_loop() else {
        return Err(WorkflowError::control_flow(format!("step '{}': 'break' outside a loop", step.id)).with_step(step.id.clone()));
    };
    stack.unwind_to(loop_index, true);
    Ok(())
}

/// Processes a `continue`: unwinds to the innermost loop frame and clears
/// the remaining body steps of the current iteration.
pub fn process_continue(step: &WorkflowStep, stack: &mut FrameStack) -> Result<(), WorkflowError> {
    let Some(loop_index) = stack.innermost_loop() else {
        return Err(WorkflowError::control_flow(format!("step '{}': 'continue' outside a loop", step.id)).with_step(step.id.clone()));
    };
    stack.unwind_to(loop_index, false);
    if let Some(frame) = stack.top_mut() {
        frame.pc = frame.steps.len();
    }
    Ok(())
}

/// Advances past exhausted frames: re-enters loops whose guard allows
/// another iteration, pops finished scopes. Returns loop-guard warnings.
///
/// Loop conditions are evaluated against the given flattened view merged
/// with the loop frame's own bindings; no state changes happen here, so one
/// snapshot per call is consistent.
pub fn advance_exhausted_frames(stack: &mut FrameStack, flattened: &JsonMap<String, JsonValue>) -> Result<Vec<WorkflowError>, WorkflowError> {
    /// What to do with an exhausted top frame.
    enum FrameAdvance {
        Pop,
        GuardFired(u32),
        WhileCheck(String),
        ForeachNext,
    }

    let mut warnings = Vec::new();

    loop {
        let Some(top) = stack.top() else { break };
        if !top.exhausted() {
            break;
        }

        let advance = match &top.kind {
            FrameKind::Root => FrameAdvance::Pop,
            FrameKind::While(while_frame) => {
                if while_frame.iteration >= while_frame.max_iterations {
                    FrameAdvance::GuardFired(while_frame.max_iterations)
                } else {
                    FrameAdvance::WhileCheck(while_frame.condition.clone())
                }
            }
            FrameKind::Foreach(foreach_frame) => {
                if foreach_frame.next_index < foreach_frame.items.len() {
                    FrameAdvance::ForeachNext
                } else {
                    FrameAdvance::Pop
                }
            }
        };

        match advance {
            FrameAdvance::Pop => {
                stack.pop();
            }
            FrameAdvance::GuardFired(max_iterations) => {
                warn!(max_iterations, "while_loop guard fired; completing loop");
                warnings.push(WorkflowError::new(
                    ErrorCode::MaxIterationsExceeded,
                    format!("while_loop reached max_iterations ({max_iterations})"),
                ));
                stack.pop();
            }
            FrameAdvance::WhileCheck(condition) => {
                let bindings = stack.merged_bindings();
                let scope = build_scope(flattened, &bindings);
                let should_iterate = evaluate_predicate(&condition, &scope).map_err(WorkflowError::from)?;
                let frame = stack.top_mut().expect("top frame checked above");
                if should_iterate {
                    let FrameKind::While(while_frame) = &mut frame.kind else {
                        unreachable!("frame kind checked above")
                    };
                    while_frame.iteration += 1;
                    let iteration = while_frame.iteration;
                    frame.steps = {
                        let FrameKind::While(while_frame) = &frame.kind else {
                            unreachable!("frame kind checked above")
                        };
                        while_frame.body.clone()
                    };
                    frame.pc = 0;
                    frame.bindings.insert("attempt_number".to_string(), JsonValue::from(iteration));
                    frame.bindings.insert("loop".to_string(), serde_json::json!({ "iteration": iteration }));
                } else {
                    stack.pop();
                }
            }
            FrameAdvance::ForeachNext => {
                let frame = stack.top_mut().expect("top frame checked above");
                let FrameKind::Foreach(foreach_frame) = &mut frame.kind else {
                    unreachable!("frame kind checked above")
                };
                let index = foreach_frame.next_index;
                let item = foreach_frame.items[index].clone();
                foreach_frame.next_index += 1;
                let body = foreach_frame.body.clone();
                frame.steps = body;
                frame.pc = 0;
                frame.bindings.insert("item".to_string(), item);
                frame
                    .bindings
                    .insert("loop".to_string(), serde_json::json!({ "index": index, "iteration": index + 1 }));
            }
        }
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_of(value: JsonValue) -> WorkflowStep {
        serde_json::from_value(value).unwrap()
    }

    fn empty_flattened() -> JsonMap<String, JsonValue> {
        JsonMap::new()
    }

    fn drain_ids(stack: &mut FrameStack, flattened: &JsonMap<String, JsonValue>) -> Vec<String> {
        let mut seen = Vec::new();
        loop {
            advance_exhausted_frames(stack, flattened).unwrap();
            match stack.current_step() {
                Some(step) => {
                    seen.push(step.id.clone());
                    stack.advance();
                }
                None => {
                    if stack.is_empty() {
                        break;
                    }
                }
            }
        }
        seen
    }

    #[test]
    fn conditional_inlines_then_branch() {
        let step = step_of(json!({
            "id": "check",
            "type": "conditional",
            "condition": "{{ ready }}",
            "then_steps": [{"type": "user_message", "message": "yes"}],
            "else_steps": [{"type": "user_message", "message": "no"}]
        }));
        let mut stack = FrameStack::new(vec![step.clone(), step_of(json!({"id": "after", "type": "break"}))]);
        let flattened = json!({"ready": true}).as_object().unwrap().clone();
        let scope = build_scope(&flattened, &JsonMap::new());

        process_conditional(&step, &mut stack, &scope).unwrap();
        assert_eq!(stack.current_step().unwrap().id, "check.then.1");
        stack.advance();
        assert_eq!(stack.current_step().unwrap().id, "after");
    }

    #[test]
    fn conditional_with_missing_else_is_empty() {
        let step = step_of(json!({
            "id": "check",
            "type": "conditional",
            "condition": "{{ ready }}",
            "then_steps": [{"type": "user_message", "message": "yes"}]
        }));
        let mut stack = FrameStack::new(vec![step.clone()]);
        let flattened = json!({"ready": false}).as_object().unwrap().clone();
        let scope = build_scope(&flattened, &JsonMap::new());
        process_conditional(&step, &mut stack, &scope).unwrap();
        assert!(stack.current_step().is_none());
    }

    #[test]
    fn while_loop_iterates_until_condition_fails() {
        let step = step_of(json!({
            "id": "spin",
            "type": "while_loop",
            "condition": "(attempt_number || 0) < 3",
            "body": [{"type": "user_message", "message": "tick"}]
        }));
        let mut stack = FrameStack::new(vec![step.clone()]);
        process_while_loop(&step, &mut stack, DEFAULT_MAX_ITERATIONS).unwrap();

        let flattened = empty_flattened();
        let seen = drain_ids(&mut stack, &flattened);
        // attempt_number binds per iteration: the checks see 0, 1, 2, 3 and
        // the loop runs three times.
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|id| id == "spin.body.1"));
    }

    #[test]
    fn while_loop_guard_fires_and_completes() {
        let step = step_of(json!({
            "id": "forever",
            "type": "while_loop",
            "condition": "true",
            "max_iterations": 4,
            "body": [{"type": "user_message", "message": "tick"}]
        }));
        let mut stack = FrameStack::new(vec![step.clone()]);
        process_while_loop(&step, &mut stack, DEFAULT_MAX_ITERATIONS).unwrap();

        let flattened = empty_flattened();
        let mut iterations = 0;
        let mut warnings = Vec::new();
        loop {
            warnings.extend(advance_exhausted_frames(&mut stack, &flattened).unwrap());
            if stack.is_empty() {
                break;
            }
            if stack.current_step().is_some() {
                iterations += 1;
                stack.advance();
            }
        }
        assert_eq!(iterations, 4);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, ErrorCode::MaxIterationsExceeded);
    }

    #[test]
    fn foreach_binds_item_and_loop_index() {
        let step = step_of(json!({
            "id": "scan",
            "type": "foreach",
            "items": "{{ files }}",
            "body": [{"type": "user_message", "message": "{{ item }}"}]
        }));
        let flattened = json!({"files": ["a", "b"]}).as_object().unwrap().clone();
        let scope = build_scope(&flattened, &JsonMap::new());
        let mut stack = FrameStack::new(vec![step.clone()]);
        process_foreach(&step, &mut stack, &scope).unwrap();

        advance_exhausted_frames(&mut stack, &flattened).unwrap();
        let bindings = stack.merged_bindings();
        assert_eq!(bindings.get("item"), Some(&json!("a")));
        assert_eq!(bindings.get("loop"), Some(&json!({"index": 0, "iteration": 1})));
        stack.advance();

        advance_exhausted_frames(&mut stack, &flattened).unwrap();
        let bindings = stack.merged_bindings();
        assert_eq!(bindings.get("item"), Some(&json!("b")));
        assert_eq!(bindings.get("loop"), Some(&json!({"index": 1, "iteration": 2})));
    }

    #[test]
    fn foreach_rejects_non_array_items() {
        let step = step_of(json!({
            "id": "scan",
            "type": "foreach",
            "items": "{{ not_a_list }}",
            "body": []
        }));
        let flattened = json!({"not_a_list": 42}).as_object().unwrap().clone();
        let scope = build_scope(&flattened, &JsonMap::new());
        let mut stack = FrameStack::new(vec![step.clone()]);
        let error = process_foreach(&step, &mut stack, &scope).unwrap_err();
        assert_eq!(error.code, ErrorCode::TypeError);
    }

    #[test]
    fn break_outside_loop_is_a_control_flow_error() {
        let step = step_of(json!({"id": "oops", "type": "break"}));
        let mut stack = FrameStack::new(vec![step.clone()]);
        let error = process_break(&step, &mut stack).unwrap_err();
        assert_eq!(error.code, ErrorCode::ControlFlowError);
    }

    #[test]
    fn break_clears_loop_frame_and_continue_ends_iteration() {
        let foreach = step_of(json!({
            "id": "scan",
            "type": "foreach",
            "items": [1, 2, 3],
            "body": [
                {"id": "first", "type": "user_message", "message": "x"},
                {"id": "second", "type": "user_message", "message": "y"}
            ]
        }));
        let flattened = empty_flattened();
        let scope = build_scope(&flattened, &JsonMap::new());

        // break: the loop frame disappears entirely.
        let mut stack = FrameStack::new(vec![foreach.clone()]);
        process_foreach(&foreach, &mut stack, &scope).unwrap();
        advance_exhausted_frames(&mut stack, &flattened).unwrap();
        let break_step = step_of(json!({"id": "b", "type": "break"}));
        process_break(&break_step, &mut stack).unwrap();
        assert_eq!(stack.innermost_loop(), None);

        // continue: the current iteration ends, the next item binds.
        let mut stack = FrameStack::new(vec![foreach.clone()]);
        process_foreach(&foreach, &mut stack, &scope).unwrap();
        advance_exhausted_frames(&mut stack, &flattened).unwrap();
        assert_eq!(stack.current_step().unwrap().id, "first");
        let continue_step = step_of(json!({"id": "c", "type": "continue"}));
        process_continue(&continue_step, &mut stack).unwrap();
        advance_exhausted_frames(&mut stack, &flattened).unwrap();
        assert_eq!(stack.merged_bindings().get("item"), Some(&json!(2)));
        assert_eq!(stack.current_step().unwrap().id, "first");
    }

    #[test]
    fn normalize_strips_template_wrapper() {
        assert_eq!(normalize_expression_source("{{ state.ready }}"), "state.ready");
        assert_eq!(normalize_expression_source("  state.ready  "), "state.ready");
        assert_eq!(normalize_expression_source("{{nested.deep}}"), "nested.deep");
    }
}
