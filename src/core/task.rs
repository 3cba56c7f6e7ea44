//! Task data model for the dependency graph.
//!
//! A `Task` is immutable once submitted to a run. Its execution outcome is
//! tracked separately in a `TaskResult`, which only the executor mutates.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::dag::DependencyType;
use crate::error::Error;

/// Identifier of a task, unique within a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task submitted but not yet dispatched.
    #[default]
    Pending,
    /// Task is executing (possibly between retries).
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed after recovery was exhausted.
    Failed,
    /// Task's final attempt exceeded its deadline.
    TimedOut,
    /// Task was never executed (upstream failure, false condition, cancellation).
    Skipped,
}

impl TaskStatus {
    /// Whether the status can no longer change within a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::TimedOut | TaskStatus::Skipped
        )
    }

    /// Whether the task ended in error (as opposed to completing or being skipped).
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::TimedOut)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::TimedOut => write!(f, "timed_out"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// A single unit of work in a workflow.
///
/// `payload` is opaque to the orchestrator and handed verbatim to the
/// task backend. By convention it is a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Task kind, used to select a recovery strategy and a backend handler.
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Applies to every entry of `depends_on`.
    #[serde(default)]
    pub dependency_type: DependencyType,
    /// Boolean expression over the workflow context; the task is skipped when false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Per-attempt deadline. Falls back to the executor default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Overrides the recovery strategy's retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// External resource guarded by a circuit breaker. Defaults to `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, kind: &str) -> Self {
        Self {
            id: id.into(),
            kind: kind.to_string(),
            payload: Value::Null,
            depends_on: Vec::new(),
            dependency_type: DependencyType::Hard,
            condition: None,
            timeout_ms: None,
            max_retries: None,
            resource: None,
        }
    }

    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn soft(mut self) -> Self {
        self.dependency_type = DependencyType::Soft;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_condition(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_string());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Key of the circuit breaker guarding this task's backend calls.
    pub fn resource_key(&self) -> &str {
        self.resource.as_deref().unwrap_or(&self.kind)
    }
}

/// Outcome of a task within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Number of backend executions performed.
    #[serde(default)]
    pub attempts: u32,
    /// Set when the compensation hook ran instead of a retry.
    #[serde(default)]
    pub compensated: bool,
    /// Soft-dependency warnings recorded at dispatch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl TaskResult {
    pub fn pending(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            output: Value::Null,
            error: None,
            started_at: None,
            ended_at: None,
            attempts: 0,
            compensated: false,
            warnings: Vec::new(),
        }
    }

    /// Transition to Running and record the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn complete(&mut self, output: Value) {
        self.status = TaskStatus::Completed;
        self.output = output;
        self.error = None;
        self.ended_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.to_string());
        self.ended_at = Some(Utc::now());
    }

    pub fn time_out(&mut self, error: &str) {
        self.status = TaskStatus::TimedOut;
        self.error = Some(error.to_string());
        self.ended_at = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: &str) {
        self.status = TaskStatus::Skipped;
        self.error = Some(reason.to_string());
        self.ended_at = Some(Utc::now());
    }

    /// Wall-clock time between start and end, if both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}

/// Error returned by a task backend.
///
/// `kind` is an optional tag (e.g. `"timeout"`, `"rate_limit"`) used ahead of
/// message pattern matching when classifying the failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
        }
    }

    pub fn with_kind(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.to_string()),
            message: message.into(),
        }
    }

    /// Error produced when an attempt exceeds its deadline.
    pub fn deadline_exceeded(timeout: Duration) -> Self {
        Self::with_kind("timeout", format!("deadline of {:?} exceeded", timeout))
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.kind.as_deref() == Some("timeout") && self.message.starts_with("deadline of")
    }

    /// Surface this error as a crate error for `task_id`. `fallback_kind`
    /// is used when the backend gave no kind tag.
    pub fn to_error(&self, task_id: &TaskId, fallback_kind: &str) -> Error {
        Error::TaskExecution {
            task_id: task_id.clone(),
            kind: self.kind.clone().unwrap_or_else(|| fallback_kind.to_string()),
            message: self.message.clone(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Some(kind) => write!(f, "[{}] {}", kind, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<&str> for TaskError {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskError {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
