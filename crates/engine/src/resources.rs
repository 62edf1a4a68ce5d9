//! Timeouts, admission control, and per-workflow resource cleanup.
//!
//! Three timeout tiers compose (workflow > step > interaction); a child
//! budget is always clamped to its parent's remaining time. Admission is
//! bounded two ways: a cap on concurrently active workflows (excess `start`
//! calls queue on a semaphore) and a consecutive-failure circuit breaker
//! with a cooldown and half-open probing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use windlass_types::{ErrorCode, WorkflowError, WorkflowResult};

/// Engine-wide tunables, mirroring the server configuration surface.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Workflow-level deadline applied when the definition/start omit one.
    pub workflow_timeout: Duration,
    /// `while_loop` iteration ceiling when the step declares none.
    pub default_max_iterations: u32,
    /// Maximum concurrently active workflows; excess `start` calls queue.
    pub max_active_workflows: usize,
    /// `parallel_foreach` bound when the step declares none.
    pub default_max_parallel: usize,
    /// Consecutive workflow failures that open the circuit breaker.
    pub circuit_breaker_threshold: u32,
    /// How long the breaker stays open before a half-open probe is allowed.
    pub circuit_breaker_cooldown: Duration,
    /// Budget for running a workflow's cleanup handlers.
    pub recovery_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workflow_timeout: Duration::from_secs(300),
            default_max_iterations: 25,
            max_active_workflows: 20,
            default_max_parallel: 10,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Tracks one workflow's elapsed time against its budget and derives child
/// budgets for steps and interactions.
#[derive(Debug, Clone)]
pub struct DeadlineTracker {
    started: Instant,
    budget: Duration,
}

impl DeadlineTracker {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// Time left in this tier's budget.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Budget for a child tier: the child's own limit clamped to this tier's
    /// remaining time. A child never outlives its parent.
    pub fn child_budget(&self, own_limit: Option<Duration>) -> Duration {
        let remaining = self.remaining();
        match own_limit {
            Some(limit) => limit.min(remaining),
            None => remaining,
        }
    }
}

/// Circuit breaker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Admission control for new workflow starts.
pub struct ResourceCoordinator {
    admission: Arc<Semaphore>,
    breaker: Mutex<BreakerInner>,
    threshold: u32,
    cooldown: Duration,
}

impl ResourceCoordinator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(config.max_active_workflows.max(1))),
            breaker: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            threshold: config.circuit_breaker_threshold,
            cooldown: config.circuit_breaker_cooldown,
        }
    }

    /// Admits a new workflow: rejects when the breaker is open, then waits
    /// for an active-workflow slot. The returned permit is held for the
    /// instance's lifetime; dropping it frees the slot.
    pub async fn admit(&self) -> WorkflowResult<OwnedSemaphorePermit> {
        self.check_breaker()?;
        let permit = self
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkflowError::internal("admission semaphore closed"))?;
        Ok(permit)
    }

    fn check_breaker(&self) -> WorkflowResult<()> {
        let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
        match breaker.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = breaker.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    info!("circuit breaker half-open; admitting probe workflow");
                    breaker.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(WorkflowError::new(
                        ErrorCode::CircuitBreakerOpen,
                        format!(
                            "workflow admission suspended after {} consecutive failures; retry in {}s",
                            breaker.consecutive_failures,
                            (self.cooldown - elapsed).as_secs().max(1)
                        ),
                    ))
                }
            }
        }
    }

    /// Records a terminal workflow success, closing the breaker.
    pub fn record_success(&self) {
        let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
        breaker.consecutive_failures = 0;
        if breaker.state != BreakerState::Closed {
            info!("circuit breaker closed after successful workflow");
        }
        breaker.state = BreakerState::Closed;
        breaker.opened_at = None;
    }

    /// Records a terminal workflow failure; opens the breaker at the
    /// configured threshold (and re-opens on a failed half-open probe).
    pub fn record_failure(&self) {
        let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
        breaker.consecutive_failures += 1;
        let should_open = breaker.state == BreakerState::HalfOpen || breaker.consecutive_failures >= self.threshold;
        if should_open && breaker.state != BreakerState::Open {
            warn!(failures = breaker.consecutive_failures, "circuit breaker opened");
            breaker.state = BreakerState::Open;
            breaker.opened_at = Some(Instant::now());
        }
    }

    /// Manual reset, closing the breaker immediately.
    pub fn reset_breaker(&self) {
        let mut breaker = self.breaker.lock().expect("breaker lock poisoned");
        breaker.state = BreakerState::Closed;
        breaker.consecutive_failures = 0;
        breaker.opened_at = None;
    }

    /// Number of free active-workflow slots (for diagnostics).
    pub fn available_slots(&self) -> usize {
        self.admission.available_permits()
    }
}

/// Per-workflow cleanup handlers, run in reverse registration order.
#[derive(Default)]
pub struct CleanupRegistry {
    handlers: Mutex<Vec<(String, Box<dyn FnOnce() + Send>)>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler tied to a workflow id.
    pub fn register(&self, workflow_id: &str, handler: impl FnOnce() + Send + 'static) {
        self.handlers
            .lock()
            .expect("cleanup lock poisoned")
            .push((workflow_id.to_string(), Box::new(handler)));
    }

    /// Runs and removes all handlers for a workflow, newest first, bounded by
    /// the recovery budget. Cleanup is best-effort: once the budget elapses
    /// the remaining handlers are dropped with a warning.
    pub fn run_for(&self, workflow_id: &str, recovery_budget: Duration) {
        let mut handlers = self.handlers.lock().expect("cleanup lock poisoned");
        let mut to_run = Vec::new();
        let mut index = 0;
        while index < handlers.len() {
            if handlers[index].0 == workflow_id {
                to_run.push(handlers.remove(index).1);
            } else {
                index += 1;
            }
        }
        drop(handlers);

        let started = std::time::Instant::now();
        let total = to_run.len();
        for (position, handler) in to_run.into_iter().rev().enumerate() {
            if started.elapsed() >= recovery_budget {
                warn!(
                    workflow_id,
                    skipped = total - position,
                    "recovery timeout elapsed; dropping remaining cleanup handlers"
                );
                break;
            }
            handler();
        }
        if total > 0 {
            debug!(workflow_id, handlers = total, "cleanup complete");
        }
    }
}
