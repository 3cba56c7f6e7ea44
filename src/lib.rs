//! Workflow orchestration core.
//!
//! A workflow is a set of tasks with declared dependencies. `maestro` levels
//! the dependency graph, runs each level in parallel under a worker limit,
//! retries or compensates failed tasks according to a recovery policy, guards
//! external resources with circuit breakers, and records progress in a
//! versioned, lock-protected state store that observers can subscribe to.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod recovery;
pub mod state;
pub mod workflow;

pub use error::{Error, Result};
