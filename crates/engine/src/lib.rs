//! # Windlass Engine
//!
//! The Windlass engine interprets declarative workflow definitions and
//! drives them through a mixed server/client execution model. Server-side
//! steps (state mutation, control flow, server shell commands, sub-agent
//! fan-out) are processed inside the engine; client-bound steps (user
//! prompts, tool calls, agent interactions) are materialized and batched
//! for the caller to execute between `get_next_step` calls.
//!
//! ## Key Features
//!
//! - **Queue-based execution**: an index-based frame stack drives nested
//!   control flow without recursion; client steps coalesce into batches
//! - **Three-tier reactive state**: `inputs` / `state` / `computed` with
//!   topologically ordered recomputation and load-time cycle detection
//! - **Template interpolation**: `{{ ... }}` substitution at emission time,
//!   so each step observes state produced earlier in the same batch
//! - **Bounded sub-agent fan-out**: isolated per-item instances with
//!   failure isolation and inherited deadlines
//!
//! ## Usage
//!
//! ```rust
//! use windlass_engine::{EngineConfig, WorkflowEngine};
//! use windlass_types::WorkflowDefinition;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let definition: WorkflowDefinition = serde_yaml::from_str(r#"
//! name: "demo:hello"
//! steps:
//!   - type: "user_message"
//!     message: "hello"
//! "#)?;
//!
//! let engine = WorkflowEngine::new(EngineConfig::default());
//! let started = engine.start(definition, None).await?;
//! while let Some(batch) = engine.get_next_step(&started.workflow_id).await? {
//!     for step in &batch.steps {
//!         println!("{}: {}", step.r#type, step.definition);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The engine is organized into several key modules:
//!
//! - **`expr`**: restricted JavaScript-flavored expression evaluation
//! - **`template`**: `{{ ... }}` variable replacement over step definitions
//! - **`state`**: per-workflow three-tier stores and computed-field graphs
//! - **`registry`**: the static step-type catalog (fields + location)
//! - **`control`** / **`frames`**: control-flow processors over the frame stack
//! - **`orchestrator`**: bounded-parallelism sub-agent fan-out
//! - **`executor`**: the queue driver and the public [`WorkflowEngine`]
//! - **`resources`**: deadlines, admission control, and cleanup

pub mod control;
pub mod executor;
pub mod expr;
pub mod frames;
pub mod interaction;
pub mod orchestrator;
pub mod registry;
pub mod resources;
pub mod schema;
pub mod state;
pub mod template;

// Re-export commonly used types for convenience
pub use executor::{CommandRunner, ExecutionServices, NoopRunner, ShellCommandRunner, ShellOutput, WorkflowEngine, WorkflowInstance};
pub use expr::{CompiledExpr, ExprError, ExprErrorKind, JsValue, Scope, compile, evaluate, evaluate_predicate};
pub use interaction::{accept_agent_response, accept_user_input, user_input_updates};
pub use orchestrator::{AgentDispatcher, NoopDispatcher, NoopProgress, ProgressSink};
pub use registry::{StepLocation, StepTypeSpec, classify_step, step_type_spec, validate_step_fields};
pub use resources::{CleanupRegistry, DeadlineTracker, EngineConfig, ResourceCoordinator};
pub use state::{StateManager, WorkflowState};
pub use template::replace_variables;
