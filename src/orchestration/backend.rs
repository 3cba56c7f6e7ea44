//! Task execution backends.
//!
//! The executor knows nothing about what a task does. It hands each attempt
//! to a `TaskExecutor`, which returns the task's output or a `TaskError`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::task::{Task, TaskError};
use crate::workflow::WorkflowId;

/// Per-attempt information passed to a backend.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow_id: Option<WorkflowId>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancelled when the attempt's deadline passes. Backends may watch it
    /// to stop early; the executor never aborts them.
    pub cancel: CancellationToken,
    /// Workflow context plus `tasks.<id>.status` / `tasks.<id>.output` of
    /// the tasks recorded so far.
    pub scope: Arc<Value>,
}

impl ExecutionContext {
    pub fn new(attempt: u32) -> Self {
        Self {
            workflow_id: None,
            attempt,
            cancel: CancellationToken::new(),
            scope: Arc::new(Value::Null),
        }
    }

    /// Output of an upstream task, if it has one.
    pub fn output_of(&self, task_id: &str) -> Option<&Value> {
        self.scope
            .get("tasks")?
            .get(task_id)?
            .get("output")
            .filter(|v| !v.is_null())
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, ctx: ExecutionContext) -> Result<Value, TaskError>;

    /// Undo partial effects after recovery chose compensation.
    async fn compensate(&self, _task: &Task, _error: &TaskError) -> Result<(), TaskError> {
        Ok(())
    }

    /// Whether tasks of `kind` can run on this backend.
    fn supports(&self, _kind: &str) -> bool {
        true
    }
}

type BoxedHandler = Box<
    dyn Fn(Task, ExecutionContext) -> futures::future::BoxFuture<'static, Result<Value, TaskError>>
        + Send
        + Sync,
>;

/// Backend built from an async closure.
///
/// ```
/// use maestro::orchestration::FnExecutor;
/// use serde_json::json;
///
/// let executor = FnExecutor::new(|task, _ctx| async move {
///     Ok(json!({ "echo": task.id.to_string() }))
/// });
/// ```
pub struct FnExecutor {
    handler: BoxedHandler,
}

impl FnExecutor {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Task, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self {
            handler: Box::new(move |task, ctx| Box::pin(f(task, ctx))),
        }
    }
}

impl std::fmt::Debug for FnExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnExecutor").finish_non_exhaustive()
    }
}

#[async_trait]
impl TaskExecutor for FnExecutor {
    async fn execute(&self, task: &Task, ctx: ExecutionContext) -> Result<Value, TaskError> {
        (self.handler)(task.clone(), ctx).await
    }
}

/// Dispatches tasks to a backend registered for their kind.
#[derive(Default)]
pub struct TaskRouter {
    routes: HashMap<String, Arc<dyn TaskExecutor>>,
    fallback: Option<Arc<dyn TaskExecutor>>,
}

impl TaskRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, kind: &str, executor: Arc<dyn TaskExecutor>) -> Self {
        self.routes.insert(kind.to_string(), executor);
        self
    }

    /// Backend for kinds without a route.
    pub fn fallback(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    fn resolve(&self, kind: &str) -> Option<&Arc<dyn TaskExecutor>> {
        self.routes.get(kind).or(self.fallback.as_ref())
    }
}

impl std::fmt::Debug for TaskRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRouter")
            .field("kinds", &self.kinds())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[async_trait]
impl TaskExecutor for TaskRouter {
    async fn execute(&self, task: &Task, ctx: ExecutionContext) -> Result<Value, TaskError> {
        match self.resolve(&task.kind) {
            Some(executor) => executor.execute(task, ctx).await,
            None => Err(TaskError::with_kind(
                "unknown_kind",
                format!("no executor registered for kind {}", task.kind),
            )),
        }
    }

    async fn compensate(&self, task: &Task, error: &TaskError) -> Result<(), TaskError> {
        match self.resolve(&task.kind) {
            Some(executor) => executor.compensate(task, error).await,
            None => Ok(()),
        }
    }

    fn supports(&self, kind: &str) -> bool {
        match self.routes.get(kind) {
            Some(executor) => executor.supports(kind),
            None => self.fallback.as_ref().is_some_and(|f| f.supports(kind)),
        }
    }
}
