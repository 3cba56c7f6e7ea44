use std::time::Duration;

use thiserror::Error;

use crate::core::task::TaskId;
use crate::workflow::WorkflowId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cyclic dependency detected at task {task_id}")]
    CyclicDependency { task_id: TaskId },

    #[error("Task not defined: {0}")]
    UnknownTask(TaskId),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("No executor registered for task kind: {0}")]
    UnknownTaskKind(String),

    #[error("Invalid condition `{expr}`: {reason}")]
    InvalidCondition { expr: String, reason: String },

    #[error("Task {task_id} timed out after {timeout:?}")]
    TaskTimeout { task_id: TaskId, timeout: Duration },

    #[error("Task {task_id} failed ({kind}): {message}")]
    TaskExecution {
        task_id: TaskId,
        kind: String,
        message: String,
    },

    #[error("Circuit breaker is open for {resource}")]
    CircuitOpen { resource: String },

    #[error("Could not acquire lock {key} after {attempts} attempts")]
    LockAcquisition { key: String, attempts: u32 },

    #[error("Task {task_id} exceeded max retries after {attempts} attempts")]
    MaxRetriesExceeded { task_id: TaskId, attempts: u32 },

    #[error("State backend error: {0}")]
    Backend(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Timed out after {timeout:?} waiting for task {task_id} in workflow {workflow_id}")]
    WaitTimeout {
        workflow_id: WorkflowId,
        task_id: TaskId,
        timeout: Duration,
    },

    #[error("Timed out after {timeout:?} waiting for workflow {workflow_id} to finish")]
    WorkflowTimeout {
        workflow_id: WorkflowId,
        timeout: Duration,
    },

    #[error("Workflow finished with failed tasks: {}", failed.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", "))]
    TasksFailed { failed: Vec<TaskId> },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Whether a `synchronize` call may retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::LockAcquisition { .. } | Error::Backend(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
