//! Core domain models for workflow orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestrator: tasks, their results, the dependency graph and the
//! conditions that gate execution.

pub mod condition;
pub mod dag;
pub mod task;

pub use condition::Condition;
pub use dag::{DependencyGraph, DependencyType, ExecutionLevel, Readiness};
pub use task::{Task, TaskError, TaskId, TaskResult, TaskStatus};
