//! Orchestration layer.
//!
//! `ParallelExecutor` runs a dependency graph level by level against a
//! `TaskExecutor` backend, applying the recovery policy and circuit breakers
//! to every attempt. `WorkflowCoordinator` wraps it with workflow lifecycle
//! and shared state.

mod backend;
mod coordinator;
mod executor;
mod shell;

pub use backend::{ExecutionContext, FnExecutor, TaskExecutor, TaskRouter};
pub use coordinator::{LoggingSink, NotificationSink, WorkflowCoordinator};
pub use executor::{
    ExecutorConfig, ExecutorEvent, ParallelExecutor, RunReport, RunScope, DEFAULT_MAX_WORKERS,
    DEFAULT_TASK_TIMEOUT,
};
pub use shell::{ShellExecutor, SHELL_KIND};
