//! Full-system scenarios: realistic workflows combining inputs, computed
//! fields, control flow, shell side effects, and sub-agent fan-out in one
//! definition, driven end to end through the public API.

use serde_json::json;
use windlass_engine::{EngineConfig, WorkflowEngine};
use windlass_types::{ErrorCode, WorkflowDefinition, WorkflowStatus};

fn definition_of(value: serde_json::Value) -> WorkflowDefinition {
    serde_json::from_value(value).expect("definition parses")
}

/// A standards-enforcement flow: discover files, report progress per file,
/// fan work out to sub-agents, then summarize from computed state.
fn enforcement_workflow() -> WorkflowDefinition {
    definition_of(json!({
        "name": "standards:enforce",
        "description": "Fix style violations in changed files",
        "version": "1.0.0",
        "inputs": {
            "commit": {"type": "string", "required": false, "default": ""},
            "strict": {"type": "boolean", "required": false, "default": false}
        },
        "default_state": {
            "state": {
                "files": [],
                "scanned": 0,
                "log": []
            }
        },
        "state_schema": {
            "computed": {
                "file_count": {"from": "state.files", "transform": "input.length"},
                "has_work": {"from": "computed.file_count", "transform": "input > 0"},
                "banner": {
                    "from": ["computed.file_count", "state.scanned"],
                    "transform": "'scanned ' + input[1] + ' of ' + input[0]"
                }
            }
        },
        "steps": [
            {
                "id": "discover",
                "type": "conditional",
                "condition": "{{ inputs.commit }}",
                "then_steps": [
                    {"type": "user_message", "message": "diffing against {{ inputs.commit }}"}
                ],
                "else_steps": [
                    {"type": "user_message", "message": "scanning working tree"},
                    {
                        "type": "shell_command",
                        "command": "printf 'alpha.rs\\nbeta.rs\\ngamma.rs'",
                        "state_update": {
                            "path": "state.files",
                            "value": "{{ this.stdout.split('\\n') }}"
                        }
                    }
                ]
            },
            {
                "id": "scan",
                "type": "foreach",
                "items": "{{ state.files }}",
                "body": [
                    {
                        "type": "shell_command",
                        "command": "true",
                        "state_update": {"path": "state.scanned", "operation": "increment", "value": 1}
                    },
                    {"type": "user_message", "message": "checking {{ item }} ({{ loop.iteration }}/{{ computed.file_count }})"}
                ]
            },
            {
                "id": "fix",
                "type": "parallel_foreach",
                "items": "{{ state.files }}",
                "sub_agent_task": "fix_file",
                "max_parallel": 2
            },
            {
                "id": "wrap_up",
                "type": "conditional",
                "condition": "{{ computed.has_work }}",
                "then_steps": [
                    {"type": "user_message", "message": "{{ computed.banner }}"}
                ],
                "else_steps": [
                    {"type": "user_message", "message": "nothing to do"}
                ]
            }
        ],
        "sub_agent_tasks": {
            "fix_file": {
                "description": "Fix one file",
                "default_state": {"state": {"fixed": null}},
                "steps": [
                    {
                        "type": "shell_command",
                        "command": "true",
                        "state_update": {"path": "state.fixed", "value": "{{ inputs.item }}"}
                    }
                ]
            }
        }
    }))
}

#[tokio::test]
async fn enforcement_workflow_runs_end_to_end() {
    let engine = WorkflowEngine::new(EngineConfig::default());
    let started = engine.start(enforcement_workflow(), None).await.unwrap();
    assert_eq!(started.status, WorkflowStatus::Running);
    assert_eq!(started.state.computed.get("file_count"), Some(&json!(0)));
    assert_eq!(started.state.computed.get("has_work"), Some(&json!(false)));

    let batch = engine.get_next_step(&started.workflow_id).await.unwrap().expect("one batch");
    let messages: Vec<&str> = batch
        .steps
        .iter()
        .filter(|step| step.r#type == "user_message")
        .filter_map(|step| step.definition["message"].as_str())
        .collect();

    // The discovery shell ran between the first message and the scan loop,
    // so the loop messages already see three files and a live counter.
    assert_eq!(
        messages,
        vec![
            "scanning working tree",
            "checking alpha.rs (1/3)",
            "checking beta.rs (2/3)",
            "checking gamma.rs (3/3)",
            "scanned 3 of 3",
        ]
    );

    assert!(engine.get_next_step(&started.workflow_id).await.unwrap().is_none());

    let report = engine.get_workflow_status(&started.workflow_id).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert!(report.warnings.is_empty());
    assert_eq!(report.state.computed.get("file_count"), Some(&json!(3)));
    assert_eq!(report.state.state.get("scanned"), Some(&json!(3)));

    let fanout = report.state.state.get("fix").expect("fan-out summary");
    assert_eq!(fanout["completed"], json!(3));
    let tasks = fanout["tasks"].as_object().unwrap();
    let fixed: Vec<&str> = tasks.values().filter_map(|outcome| outcome["result"]["fixed"].as_str()).collect();
    assert_eq!(fixed.len(), 3);
    for file in ["alpha.rs", "beta.rs", "gamma.rs"] {
        assert!(fixed.contains(&file), "missing fixed entry for {file}");
    }
}

#[tokio::test]
async fn enforcement_workflow_takes_commit_branch_with_input() {
    let engine = WorkflowEngine::new(EngineConfig::default());
    let mut inputs = serde_json::Map::new();
    inputs.insert("commit".to_string(), json!("abc123"));
    let started = engine.start(enforcement_workflow(), Some(inputs)).await.unwrap();

    let batch = engine.get_next_step(&started.workflow_id).await.unwrap().unwrap();
    let first = batch.steps.first().unwrap();
    assert_eq!(first.definition["message"], json!("diffing against abc123"));

    // No discovery ran, the foreach had nothing to do, and the wrap-up took
    // its else branch.
    let last = batch.steps.last().unwrap();
    assert_eq!(last.definition["message"], json!("nothing to do"));

    let report = engine.get_workflow_status(&started.workflow_id).await.unwrap();
    assert_eq!(report.state.state.get("fix").unwrap()["total"], json!(0));
}

#[tokio::test]
async fn retry_loop_with_state_driven_exit() {
    // A while_loop polling a condition that a shell step flips after three
    // passes, with computed state observing the countdown.
    let definition = definition_of(json!({
        "name": "ops:poll-until-ready",
        "default_state": {"state": {"checks": 0, "ready": false}},
        "state_schema": {
            "computed": {
                "attempts_left": {"from": "state.checks", "transform": "5 - input"}
            }
        },
        "steps": [
            {
                "id": "poll",
                "type": "while_loop",
                "condition": "{{ !state.ready }}",
                "max_iterations": 5,
                "body": [
                    {
                        "type": "shell_command",
                        "command": "true",
                        "state_update": {"path": "state.checks", "operation": "increment", "value": 1}
                    },
                    {
                        "id": "flip",
                        "type": "conditional",
                        "condition": "{{ state.checks >= 3 }}",
                        "then_steps": [
                            {
                                "type": "shell_command",
                                "command": "true",
                                "state_update": {"path": "state.ready", "value": true}
                            }
                        ]
                    }
                ]
            },
            {"id": "done", "type": "user_message", "message": "ready after {{ state.checks }} checks"}
        ]
    }));
    let engine = WorkflowEngine::new(EngineConfig::default());
    let started = engine.start(definition, None).await.unwrap();
    let batch = engine.get_next_step(&started.workflow_id).await.unwrap().unwrap();
    assert_eq!(batch.steps[0].definition["message"], json!("ready after 3 checks"));

    let report = engine.get_workflow_status(&started.workflow_id).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert!(report.warnings.is_empty(), "loop exited by condition, not by guard");
    assert_eq!(report.state.computed.get("attempts_left"), Some(&json!(2)));
}

#[tokio::test]
async fn failing_branch_deep_in_nesting_fails_the_workflow_with_context() {
    let definition = definition_of(json!({
        "name": "ops:nested-failure",
        "default_state": {"state": {"targets": ["one", "two"]}},
        "steps": [
            {
                "id": "sweep",
                "type": "foreach",
                "items": "{{ state.targets }}",
                "body": [
                    {
                        "id": "guarded",
                        "type": "conditional",
                        "condition": "item == 'two'",
                        "then_steps": [
                            {"id": "detonate", "type": "shell_command", "command": "exit 2"}
                        ]
                    }
                ]
            }
        ]
    }));
    let engine = WorkflowEngine::new(EngineConfig::default());
    let started = engine.start(definition, None).await.unwrap();
    let error = engine.get_next_step(&started.workflow_id).await.unwrap_err();
    assert_eq!(error.code, ErrorCode::ShellCommandFailed);
    assert_eq!(error.step_id.as_deref(), Some("detonate"));

    let report = engine.get_workflow_status(&started.workflow_id).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.error.as_ref().unwrap().code, ErrorCode::ShellCommandFailed);
}

#[tokio::test]
async fn status_report_shape_matches_the_contract() {
    let engine = WorkflowEngine::new(EngineConfig::default());
    let started = engine.start(enforcement_workflow(), None).await.unwrap();
    let report = engine.get_workflow_status(&started.workflow_id).await.unwrap();

    assert_eq!(report.workflow_id, started.workflow_id);
    assert_eq!(report.workflow_name, "standards:enforce");
    assert_eq!(report.total_steps, 4);
    assert_eq!(report.execution_context, "server");
    assert!(report.completed_at.is_none());

    // The serialized report exposes snake_case statuses and the raw alias.
    let as_json = serde_json::to_value(&report).unwrap();
    assert_eq!(as_json["status"], json!("running"));
    assert!(as_json["state"]["raw"].is_object());
}
