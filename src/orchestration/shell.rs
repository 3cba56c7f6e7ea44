//! Backend that runs tasks as shell commands.
//!
//! A `shell` task carries its command line in the payload:
//!
//! ```json
//! { "command": "make test", "cwd": "/srv/app", "env": { "CI": "1" } }
//! ```
//!
//! Only `command` is required. The task completes with
//! `{ "stdout", "stderr", "exit_code" }` when the command exits zero.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::core::task::{Task, TaskError};
use crate::orchestration::backend::{ExecutionContext, TaskExecutor};

pub const SHELL_KIND: &str = "shell";

#[derive(Debug, Deserialize)]
struct ShellPayload {
    command: String,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
    cwd: Option<PathBuf>,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("sh"),
            cwd: None,
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different shell; it is invoked as `<shell> -c <command>`.
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Working directory for tasks that do not name one.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn payload(task: &Task) -> Result<ShellPayload, TaskError> {
        let payload: ShellPayload = serde_json::from_value(task.payload.clone()).map_err(|e| {
            TaskError::with_kind("invalid_payload", format!("shell task {}: {}", task.id, e))
        })?;
        if payload.command.trim().is_empty() {
            return Err(TaskError::with_kind(
                "invalid_payload",
                format!("shell task {} has an empty command", task.id),
            ));
        }
        Ok(payload)
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, task: &Task, ctx: ExecutionContext) -> Result<Value, TaskError> {
        let payload = Self::payload(task)?;
        debug!(task_id = %task.id, attempt = ctx.attempt, command = %payload.command, "running shell task");

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&payload.command)
            .envs(&payload.env)
            .kill_on_drop(true);
        if let Some(cwd) = payload.cwd.as_ref().or(self.cwd.as_ref()) {
            command.current_dir(cwd);
        }

        // The child is killed if the deadline fires and drops this future.
        let output = command
            .output()
            .await
            .map_err(|e| TaskError::with_kind("spawn", format!("failed to spawn {}: {}", self.shell.display(), e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            let message = if stderr.is_empty() {
                format!("command exited with code {}", exit_code)
            } else {
                stderr
            };
            return Err(TaskError::new(message));
        }

        Ok(json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": exit_code,
        }))
    }

    fn supports(&self, kind: &str) -> bool {
        kind == SHELL_KIND
    }
}
