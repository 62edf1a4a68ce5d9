//! Windlass driver CLI.
//!
//! A thin loop around the engine for running workflow files from a
//! terminal: parse, start, then call `get_next_step` until the workflow
//! completes, rendering each client batch. Client steps are displayed, not
//! executed; `user_input` prompts read from stdin unless `--auto` supplies
//! defaults.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use tracing::Level;
use windlass_engine::{EngineConfig, WorkflowEngine};
use windlass_types::{StateUpdateSpec, WorkflowDefinition, is_canonical_workflow_name};

#[derive(Parser)]
#[command(name = "windlass", about = "Run declarative workflows", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a workflow file to completion.
    Run {
        /// Path to a YAML or JSON workflow file.
        file: PathBuf,
        /// Workflow inputs as `name=value` pairs (values parse as JSON when possible).
        #[arg(long = "input", short = 'i', value_name = "NAME=VALUE")]
        inputs: Vec<String>,
        /// Answer `user_input` steps with their default instead of prompting.
        #[arg(long)]
        auto: bool,
        /// Workflow timeout in seconds.
        #[arg(long, value_name = "SECONDS")]
        timeout: Option<u64>,
    },
    /// Parse a workflow file and report its shape without running it.
    Check {
        /// Path to a YAML or JSON workflow file.
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Run { file, inputs, auto, timeout } => run_workflow(&file, &inputs, auto, timeout).await,
        Command::Check { file } => check_workflow(&file),
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::DEBUG)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_workflow(file: &Path, raw_inputs: &[String], auto: bool, timeout: Option<u64>) -> Result<()> {
    let definition = parse_workflow_file(file)?;
    let inputs = parse_input_pairs(raw_inputs)?;

    let mut config = EngineConfig::default();
    if let Some(seconds) = timeout {
        config.workflow_timeout = std::time::Duration::from_secs(seconds);
    }
    let engine = WorkflowEngine::new(config);
    let started = engine
        .start(definition, Some(inputs))
        .await
        .map_err(|error| anyhow::anyhow!("{error}"))?;
    println!("started {} ({} steps)", started.workflow_id, started.total_steps);

    loop {
        let batch = match engine.get_next_step(&started.workflow_id).await {
            Ok(Some(batch)) => batch,
            Ok(None) => break,
            Err(error) => bail!("workflow failed: {error}"),
        };
        for step in &batch.steps {
            render_step(&engine, &started.workflow_id, step, auto)?;
        }
    }

    let report = engine
        .get_workflow_status(&started.workflow_id)
        .await
        .map_err(|error| anyhow::anyhow!("{error}"))?;
    println!("status: {:?}", report.status);
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    println!("final state: {}", serde_json::to_string_pretty(&report.state.state)?);
    Ok(())
}

fn render_step(
    engine: &WorkflowEngine,
    workflow_id: &str,
    step: &windlass_types::MaterializedStep,
    auto: bool,
) -> Result<()> {
    match step.r#type.as_str() {
        "user_message" => {
            let message = step.definition.get("message").and_then(JsonValue::as_str).unwrap_or_default();
            println!("{message}");
        }
        "user_input" => {
            let prompt = step.definition.get("prompt").and_then(JsonValue::as_str).unwrap_or("input");
            let answer = if auto {
                step.definition
                    .get("default")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string()
            } else {
                print!("{prompt}: ");
                std::io::stdout().flush()?;
                let mut line = String::new();
                std::io::stdin().read_line(&mut line)?;
                line.trim_end().to_string()
            };
            if let Some(update) = step.definition.get("state_update") {
                let mut update: StateUpdateSpec = serde_json::from_value(update.clone()).context("user_input state_update")?;
                update.value = JsonValue::String(answer);
                engine
                    .update_state(workflow_id, &[update])
                    .map_err(|error| anyhow::anyhow!("{error}"))?;
            }
        }
        other => {
            println!("[{other}] {}", serde_json::to_string(&step.definition)?);
        }
    }
    Ok(())
}

fn check_workflow(file: &Path) -> Result<()> {
    let definition = parse_workflow_file(file)?;
    if !is_canonical_workflow_name(&definition.name) {
        eprintln!("warning: workflow name '{}' is not in namespace:identifier form", definition.name);
    }
    println!("name: {}", definition.name);
    println!("steps: {}", definition.steps.len());
    println!("inputs: {}", definition.inputs.keys().cloned().collect::<Vec<_>>().join(", "));
    println!("computed fields: {}", definition.state_schema.computed.len());
    println!("sub-agent tasks: {}", definition.sub_agent_tasks.len());
    Ok(())
}

/// Loads a workflow file with format detection by extension (YAML unless
/// the file ends in `.json`).
fn parse_workflow_file(file: &Path) -> Result<WorkflowDefinition> {
    let contents = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let is_json = file.extension().and_then(|extension| extension.to_str()) == Some("json");
    let mut definition: WorkflowDefinition = if is_json {
        serde_json::from_str(&contents).with_context(|| format!("parsing {} as JSON", file.display()))?
    } else {
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {} as YAML", file.display()))?
    };
    if definition.name.trim().is_empty() {
        bail!("workflow file {} has no name", file.display());
    }
    definition.normalize_step_ids();
    Ok(definition)
}

fn parse_input_pairs(raw_inputs: &[String]) -> Result<serde_json::Map<String, JsonValue>> {
    let mut inputs = serde_json::Map::new();
    for pair in raw_inputs {
        let Some((name, value)) = pair.split_once('=') else {
            bail!("input '{pair}' is not in name=value form");
        };
        // Values that parse as JSON keep their type; everything else is a string.
        let parsed = serde_json::from_str::<JsonValue>(value).unwrap_or_else(|_| JsonValue::String(value.to_string()));
        inputs.insert(name.to_string(), parsed);
    }
    Ok(inputs)
}
