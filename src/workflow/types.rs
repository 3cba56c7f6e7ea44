//! Workflow run state and the updates that mutate it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::task::{TaskId, TaskResult, TaskStatus};
use crate::error::{Error, Result};

/// Unique identifier for a workflow run.
///
/// Generated fresh for every run, so the same definition can run many times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters, for log lines and CLI output.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Submitted, no task dispatched yet.
    #[default]
    Pending,
    Running,
    /// Every task completed or was skipped without a failure.
    Completed,
    /// At least one task failed after recovery was exhausted.
    Failed,
    /// Cancelled before it finished.
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Valid moves:
    /// - Pending -> Running | Completed | Failed | Cancelled
    /// - Running -> Completed | Failed | Cancelled
    ///
    /// Terminal states are final.
    pub fn can_transition(&self, target: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, target),
            (Pending, Running)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Versioned state of one workflow run.
///
/// Only `StateStore::synchronize` writes it; `version` goes up by exactly one
/// per successful write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    /// Id of the definition this run was started from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_id: Option<String>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub tasks: BTreeMap<TaskId, TaskResult>,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub version: u64,
    pub last_updated: DateTime<Utc>,
}

impl WorkflowState {
    /// Zero-value state used when nothing has been stored yet.
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            definition_id: None,
            status: WorkflowStatus::Pending,
            tasks: BTreeMap::new(),
            context: Map::new(),
            version: 0,
            last_updated: Utc::now(),
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskResult> {
        self.tasks.get(id)
    }

    /// Status of a task, `Pending` when it has no entry yet.
    pub fn task_status(&self, id: &TaskId) -> TaskStatus {
        self.tasks.get(id).map(|r| r.status).unwrap_or_default()
    }

    /// Tasks that ended `Failed` or `TimedOut`.
    pub fn failed_tasks(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|r| r.status.is_failure())
            .map(|r| r.task_id.clone())
            .collect()
    }

    /// Merge an update into this state.
    ///
    /// Scalars overwrite, task entries are replaced whole, and the context
    /// is deep-merged. Does not touch `version` or `last_updated`.
    pub fn apply(&mut self, update: &StateUpdate) -> Result<()> {
        if let Some(status) = update.status {
            if status != self.status && !self.status.can_transition(status) {
                return Err(Error::InvalidStatusTransition {
                    from: self.status.to_string(),
                    to: status.to_string(),
                });
            }
            self.status = status;
        }
        if let Some(definition_id) = &update.definition_id {
            self.definition_id = Some(definition_id.clone());
        }
        for (id, result) in &update.tasks {
            self.tasks.insert(id.clone(), result.clone());
        }
        deep_merge(&mut self.context, &update.context);
        Ok(())
    }

    /// Scope for task conditions: the context, plus `tasks.<id>.status` and
    /// `tasks.<id>.output` for every recorded task.
    pub fn condition_scope(&self) -> Value {
        condition_scope(&self.context, self.tasks.values())
    }
}

/// Build the value task conditions are evaluated against.
pub fn condition_scope<'a, I>(context: &Map<String, Value>, results: I) -> Value
where
    I: IntoIterator<Item = &'a TaskResult>,
{
    let mut scope = context.clone();
    let tasks: Map<String, Value> = results
        .into_iter()
        .map(|result| {
            let entry = serde_json::json!({
                "status": result.status,
                "output": result.output,
            });
            (result.task_id.to_string(), entry)
        })
        .collect();
    scope.insert("tasks".to_string(), Value::Object(tasks));
    Value::Object(scope)
}

/// Recursive merge: nested objects merge key by key, anything else overwrites.
pub fn deep_merge(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        if let (Some(Value::Object(existing)), Value::Object(incoming)) = (target.get_mut(key), value) {
            deep_merge(existing, incoming);
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}

/// A partial state written through `StateStore::synchronize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tasks: BTreeMap<TaskId, TaskResult>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn definition_id(mut self, id: &str) -> Self {
        self.definition_id = Some(id.to_string());
        self
    }

    pub fn task(mut self, result: TaskResult) -> Self {
        self.tasks.insert(result.task_id.clone(), result);
        self
    }

    pub fn context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        deep_merge(&mut self.context, &context);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.definition_id.is_none()
            && self.tasks.is_empty()
            && self.context.is_empty()
    }
}

/// Broadcast after every successful synchronize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub workflow_id: WorkflowId,
    pub updates: StateUpdate,
    /// State version after the update was applied.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}
