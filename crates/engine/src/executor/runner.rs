//! Shell command execution seam.
//!
//! Server-located `shell_command` steps are the one place the engine touches
//! the outside world directly. The [`CommandRunner`] trait keeps that touch
//! point narrow: embedders can substitute recording or sandboxed runners,
//! and tests use [`NoopRunner`] to avoid side effects entirely.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tokio::process::Command;
use tracing::debug;
use windlass_types::{WorkflowError, WorkflowResult};

/// Captured outcome of one shell invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The JSON shape bound as `this` in post-execution state updates.
    pub fn to_json(&self) -> JsonValue {
        json!({
            "stdout": self.stdout,
            "stderr": self.stderr,
            "exit_code": self.exit_code,
            "success": self.success(),
        })
    }
}

/// Executes one server-side shell command.
///
/// Implementations run the command to completion within `timeout` and report
/// the captured output; a non-zero exit is a result, not an error. Errors are
/// reserved for failures to run at all (spawn failure, timeout).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> WorkflowResult<ShellOutput>;
}

/// Runs commands through the platform shell with output capture.
#[derive(Debug, Default)]
pub struct ShellCommandRunner;

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, command: &str, timeout: Duration) -> WorkflowResult<ShellOutput> {
        debug!(command, timeout_secs = timeout.as_secs(), "running shell command");
        let invocation = Command::new("sh").arg("-c").arg(command).kill_on_drop(true).output();
        let output = tokio::time::timeout(timeout, invocation)
            .await
            .map_err(|_| WorkflowError::timeout(format!("shell command timed out after {}s: {command}", timeout.as_secs())))?
            .map_err(|spawn_error| WorkflowError::internal(format!("failed to run shell command '{command}': {spawn_error}")))?;

        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
        })
    }
}

/// A runner that echoes the command as successful output. Lets tests and
/// previews drive workflows without external side effects.
#[derive(Debug, Default)]
pub struct NoopRunner;

#[async_trait]
impl CommandRunner for NoopRunner {
    async fn run(&self, command: &str, _timeout: Duration) -> WorkflowResult<ShellOutput> {
        Ok(ShellOutput {
            stdout: command.to_string(),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shell_runner_captures_stdout_and_exit_code() {
        let runner = ShellCommandRunner;
        let output = runner.run("echo x", Duration::from_secs(5)).await.unwrap();
        assert_eq!(output.stdout, "x\n");
        assert_eq!(output.exit_code, 0);
        assert!(output.success());
    }

    #[tokio::test]
    async fn shell_runner_reports_nonzero_exit_as_result() {
        let runner = ShellCommandRunner;
        let output = runner.run("exit 3", Duration::from_secs(5)).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn shell_runner_times_out() {
        let runner = ShellCommandRunner;
        let error = runner.run("sleep 5", Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(error.code, windlass_types::ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn noop_runner_echoes_without_executing() {
        let runner = NoopRunner;
        let output = runner.run("rm -rf /", Duration::from_secs(1)).await.unwrap();
        assert_eq!(output.stdout, "rm -rf /");
        assert!(output.success());
    }

    #[test]
    fn shell_output_json_shape_is_stable() {
        let output = ShellOutput {
            stdout: "out".into(),
            stderr: "err".into(),
            exit_code: 0,
        };
        assert_eq!(
            output.to_json(),
            json!({"stdout": "out", "stderr": "err", "exit_code": 0, "success": true})
        );
    }
}
