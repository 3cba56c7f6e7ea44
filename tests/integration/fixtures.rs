//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted backends whose outcomes are fixed per task and attempt
//! - Coordinators wired to an in-memory store
//! - Predefined workflow definitions

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use maestro::core::{Task, TaskError};
use maestro::orchestration::{
    ExecutionContext, ExecutorConfig, ParallelExecutor, TaskExecutor, WorkflowCoordinator,
};
use maestro::recovery::{FixedJitter, RecoveryPolicy};
use maestro::state::StateStore;
use maestro::workflow::WorkflowDefinition;

/// Outcome of one scripted attempt.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(Value),
    Fail(&'static str),
}

/// Backend that replays per-task scripts.
///
/// Each attempt of a task pops the next step of its script; once the script
/// is exhausted the task succeeds with its id as output. Every call is
/// recorded, and the number of calls in flight is tracked.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(String, u32)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before returning.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(self, task: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task.to_string(), steps.into());
        self
    }

    /// Fail `task` on every attempt.
    pub fn always_fail(self, task: &str, message: &'static str) -> Self {
        self.script(task, vec![Step::Fail(message); 64])
    }

    /// `(task id, attempt)` in call order.
    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, task: &str) -> usize {
        self.calls().iter().filter(|(id, _)| id == task).count()
    }

    /// Most calls that were ever in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, task: &Task, ctx: ExecutionContext) -> Result<Value, TaskError> {
        self.calls
            .lock()
            .unwrap()
            .push((task.id.to_string(), ctx.attempt));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(task.id.as_str())
            .and_then(VecDeque::pop_front);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match step {
            Some(Step::Succeed(value)) => Ok(value),
            Some(Step::Fail(message)) => Err(TaskError::new(message)),
            None => Ok(json!(task.id.to_string())),
        }
    }
}

/// Recovery policy with jitter disabled, so delays are exact.
pub fn exact_policy() -> RecoveryPolicy {
    RecoveryPolicy::new().with_jitter(Arc::new(FixedJitter::none()))
}

pub fn executor(max_workers: usize) -> ParallelExecutor {
    ParallelExecutor::new(ExecutorConfig {
        max_workers,
        ..ExecutorConfig::default()
    })
    .with_policy(exact_policy())
}

pub fn coordinator(backend: Arc<dyn TaskExecutor>) -> WorkflowCoordinator {
    coordinator_with(executor(8), backend)
}

pub fn coordinator_with(executor: ParallelExecutor, backend: Arc<dyn TaskExecutor>) -> WorkflowCoordinator {
    WorkflowCoordinator::new(executor, backend, StateStore::in_memory())
}

/// `{A: [], B: [], C: [A, B]}`
pub fn fan_in() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "fan-in",
        vec![
            Task::new("A", "default"),
            Task::new("B", "default"),
            Task::new("C", "default").depends_on(["A", "B"]),
        ],
    )
}

/// `{A: [], B: [A]}`
pub fn chain() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "chain",
        vec![Task::new("A", "default"), Task::new("B", "default").depends_on(["A"])],
    )
}
