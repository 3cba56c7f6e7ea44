//! Level-by-level parallel execution of a dependency graph.
//!
//! Each execution level runs as a set of concurrent task units. A single
//! semaphore caps how many units execute at once across the whole run; a
//! unit holds a slot only while its backend call is in flight, never while
//! waiting out a retry backoff or an open circuit. Level `n + 1` starts only
//! once every task of level `n` is terminal.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::{Condition, DependencyGraph, Readiness, Task, TaskError, TaskId, TaskResult, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::backend::{ExecutionContext, TaskExecutor};
use crate::recovery::{
    CircuitBreaker, CircuitBreakerError, CircuitBreakerRegistry, RecoveryAction, RecoveryManager,
    RecoveryPolicy,
};
use crate::workflow::{condition_scope, WorkflowId};

pub const DEFAULT_MAX_WORKERS: usize = 50;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Run-wide cap on concurrently executing tasks.
    pub max_workers: usize,
    /// Per-attempt deadline for tasks without their own timeout.
    pub default_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            default_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }
}

/// Task lifecycle events. Every task gets exactly one terminal event
/// (`TaskCompleted`, `TaskFailed` or `TaskSkipped`) per run.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    /// First dispatch of the task.
    TaskStarted { result: TaskResult },
    /// An attempt failed and another one is scheduled after `delay`.
    TaskRetrying {
        result: TaskResult,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    TaskCompleted { result: TaskResult },
    /// Ended `Failed` or `TimedOut`.
    TaskFailed { result: TaskResult },
    TaskSkipped { result: TaskResult },
}

impl ExecutorEvent {
    pub fn result(&self) -> &TaskResult {
        match self {
            ExecutorEvent::TaskStarted { result }
            | ExecutorEvent::TaskRetrying { result, .. }
            | ExecutorEvent::TaskCompleted { result }
            | ExecutorEvent::TaskFailed { result }
            | ExecutorEvent::TaskSkipped { result } => result,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.result().task_id
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutorEvent::TaskCompleted { .. }
                | ExecutorEvent::TaskFailed { .. }
                | ExecutorEvent::TaskSkipped { .. }
        )
    }
}

/// Per-run inputs: context, cancellation, event sink and recovery history.
#[derive(Debug, Clone, Default)]
pub struct RunScope {
    pub workflow_id: Option<WorkflowId>,
    pub context: Map<String, Value>,
    pub cancel: CancellationToken,
    pub events: Option<mpsc::Sender<ExecutorEvent>>,
    /// Shared attempt history. A fresh one is created when unset.
    pub recovery: Option<Arc<RecoveryManager>>,
}

impl RunScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<ExecutorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_recovery(mut self, recovery: Arc<RecoveryManager>) -> Self {
        self.recovery = Some(recovery);
        self
    }
}

/// Results of a run, in task definition order.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub results: Vec<TaskResult>,
    /// The run was cancelled before every task could be dispatched.
    pub cancelled: bool,
}

impl RunReport {
    pub fn result(&self, id: &TaskId) -> Option<&TaskResult> {
        self.results.iter().find(|r| &r.task_id == id)
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.result(id).map(|r| r.status)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Tasks that ended `Failed` or `TimedOut`.
    pub fn failed(&self) -> Vec<TaskId> {
        self.results
            .iter()
            .filter(|r| r.status.is_failure())
            .map(|r| r.task_id.clone())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.results.iter().all(|r| !r.status.is_failure())
    }

    /// The error a caller should see, if any: failed tasks first, then
    /// cancellation.
    pub fn error(&self) -> Option<Error> {
        let failed = self.failed();
        if !failed.is_empty() {
            return Some(Error::TasksFailed { failed });
        }
        if self.cancelled {
            return Some(Error::Cancelled);
        }
        None
    }

    pub fn into_result(self) -> Result<Vec<TaskResult>> {
        match self.error() {
            Some(e) => Err(e),
            None => Ok(self.results),
        }
    }
}

/// Runs dependency graphs with bounded parallelism and recovery.
#[derive(Debug, Clone, Default)]
pub struct ParallelExecutor {
    config: ExecutorConfig,
    policy: RecoveryPolicy,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
}

impl ParallelExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            policy: RecoveryPolicy::new(),
            breakers: None,
        }
    }

    pub fn with_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Guard backend calls with breakers keyed by `Task::resource_key`.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn breakers(&self) -> Option<&Arc<CircuitBreakerRegistry>> {
        self.breakers.as_ref()
    }

    /// Execute every task of `graph`.
    ///
    /// Fails only when the graph cannot be leveled or a condition does not
    /// parse; task failures are reported in the returned `RunReport`.
    pub async fn run(
        &self,
        graph: &DependencyGraph,
        backend: Arc<dyn TaskExecutor>,
        scope: RunScope,
    ) -> Result<RunReport> {
        let levels = graph.topological_levels()?;
        let conditions = parse_conditions(graph)?;
        let recovery = scope
            .recovery
            .clone()
            .unwrap_or_else(|| Arc::new(RecoveryManager::new(self.policy.clone())));
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));

        let mut ledger = Ledger {
            results: graph
                .task_ids()
                .into_iter()
                .map(|id| (id.clone(), TaskResult::pending(id)))
                .collect(),
            events: scope.events.clone(),
        };

        info!(
            workflow_id = ?scope.workflow_id,
            tasks = graph.task_count(),
            levels = levels.len(),
            max_workers = self.config.max_workers,
            "run started"
        );

        for level in &levels {
            let mut units = JoinSet::new();

            for id in &level.tasks {
                if ledger.status(id).is_terminal() {
                    continue;
                }
                if scope.cancel.is_cancelled() {
                    ledger.skip(id, "workflow cancelled").await;
                    continue;
                }

                let warnings = match graph.readiness(id, |dep| ledger.status(dep)) {
                    Readiness::Ready { warnings } => warnings,
                    Readiness::Blocked { dependency, status } => {
                        let reason = format!("dependency {} ended {}", dependency, status);
                        ledger.skip(id, &reason).await;
                        continue;
                    }
                    Readiness::Waiting => {
                        warn!(task_id = %id, level = level.index, "dependencies unresolved at dispatch");
                        ledger.skip(id, "dependencies unresolved").await;
                        continue;
                    }
                };
                for warning in &warnings {
                    warn!(task_id = %id, "{}", warning);
                }

                if let Some(condition) = conditions.get(id) {
                    let scope_value = condition_scope(&scope.context, ledger.results.values());
                    if !condition.evaluate(&scope_value) {
                        info!(task_id = %id, condition = condition.source(), "condition false, skipping");
                        let reason = format!("condition `{}` evaluated false", condition.source());
                        ledger.skip(id, &reason).await;
                        ledger.skip_dependents(graph, id).await;
                        continue;
                    }
                }

                let Some(task) = graph.task(id).cloned() else {
                    continue;
                };
                let mut result = TaskResult::pending(id.clone());
                result.warnings = warnings;

                let unit = TaskUnit {
                    breaker: self.breakers.as_ref().map(|b| b.get(task.resource_key())),
                    timeout: task.timeout().unwrap_or(self.config.default_timeout),
                    task,
                    result,
                    backend: backend.clone(),
                    semaphore: semaphore.clone(),
                    recovery: recovery.clone(),
                    cancel: scope.cancel.clone(),
                    events: scope.events.clone(),
                    workflow_id: scope.workflow_id,
                    scope: Arc::new(condition_scope(&scope.context, ledger.results.values())),
                };
                units.spawn(unit.run());
            }

            while let Some(joined) = units.join_next().await {
                let result = joined.map_err(|e| Error::TaskJoin(e.to_string()))?;
                let id = result.task_id.clone();
                let completed = result.status == TaskStatus::Completed;
                ledger.results.insert(id.clone(), result);
                if !completed {
                    ledger.skip_dependents(graph, &id).await;
                }
            }
        }

        let results: Vec<TaskResult> = graph
            .task_ids()
            .into_iter()
            .filter_map(|id| ledger.results.remove(&id))
            .collect();
        let report = RunReport {
            results,
            cancelled: scope.cancel.is_cancelled(),
        };

        info!(
            workflow_id = ?scope.workflow_id,
            completed = report.count(TaskStatus::Completed),
            failed = report.failed().len(),
            skipped = report.count(TaskStatus::Skipped),
            cancelled = report.cancelled,
            "run finished"
        );
        Ok(report)
    }
}

fn parse_conditions(graph: &DependencyGraph) -> Result<HashMap<TaskId, Condition>> {
    let mut conditions = HashMap::new();
    for task in graph.tasks() {
        if let Some(source) = &task.condition {
            conditions.insert(task.id.clone(), Condition::parse(source)?);
        }
    }
    Ok(conditions)
}

async fn emit(events: &Option<mpsc::Sender<ExecutorEvent>>, event: ExecutorEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}

/// Results of the tasks the run loop has resolved so far.
struct Ledger {
    results: HashMap<TaskId, TaskResult>,
    events: Option<mpsc::Sender<ExecutorEvent>>,
}

impl Ledger {
    fn status(&self, id: &TaskId) -> TaskStatus {
        self.results.get(id).map(|r| r.status).unwrap_or_default()
    }

    async fn skip(&mut self, id: &TaskId, reason: &str) {
        let Some(result) = self.results.get_mut(id) else {
            return;
        };
        if result.status.is_terminal() {
            return;
        }
        result.skip(reason);
        debug!(task_id = %id, reason, "task skipped");
        let event = ExecutorEvent::TaskSkipped {
            result: result.clone(),
        };
        emit(&self.events, event).await;
    }

    /// Skip everything reachable from `id` over hard edges.
    async fn skip_dependents(&mut self, graph: &DependencyGraph, id: &TaskId) {
        let reason = format!("upstream task {} ended {}", id, self.status(id));
        for dependent in graph.hard_dependents_transitive(id) {
            self.skip(&dependent, &reason).await;
        }
    }
}

/// One task's journey through slot acquisition, execution and recovery.
struct TaskUnit {
    task: Task,
    result: TaskResult,
    backend: Arc<dyn TaskExecutor>,
    semaphore: Arc<Semaphore>,
    recovery: Arc<RecoveryManager>,
    breaker: Option<Arc<CircuitBreaker>>,
    timeout: Duration,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<ExecutorEvent>>,
    workflow_id: Option<WorkflowId>,
    scope: Arc<Value>,
}

impl TaskUnit {
    async fn run(self) -> TaskResult {
        let mut fallback = self.result.clone();
        let events = self.events.clone();

        match AssertUnwindSafe(self.drive()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(task_id = %fallback.task_id, panic = %message, "task unit panicked");
                fallback.fail(&format!("task panicked: {}", message));
                emit(&events, ExecutorEvent::TaskFailed { result: fallback.clone() }).await;
                fallback
            }
        }
    }

    async fn drive(mut self) -> TaskResult {
        loop {
            // Retries of a task already in flight are not interrupted by
            // cancellation.
            let acquired = tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if self.result.attempts == 0 => None,
                permit = self.semaphore.clone().acquire_owned() => Some(permit),
            };
            let permit = match acquired {
                Some(Ok(permit)) => permit,
                Some(Err(_)) => {
                    let failure = Error::TaskExecution {
                        task_id: self.task.id.clone(),
                        kind: "internal".to_string(),
                        message: "worker pool closed".to_string(),
                    };
                    return self.finish_failed(failure, "worker pool closed").await;
                }
                None => return self.finish_skipped("workflow cancelled").await,
            };

            if self.result.status == TaskStatus::Pending {
                self.result.start();
                debug!(task_id = %self.task.id, kind = %self.task.kind, "task started");
                self.emit(ExecutorEvent::TaskStarted {
                    result: self.result.clone(),
                })
                .await;
            }

            let attempt = self.result.attempts + 1;
            let mut admitted = false;
            let outcome = self.execute_once(attempt, &mut admitted).await;
            drop(permit);
            if admitted {
                self.result.attempts = attempt;
            }

            let error = match outcome {
                Ok(output) => {
                    self.recovery.record_success(&self.task.id);
                    self.result.complete(output);
                    info!(task_id = %self.task.id, attempts = self.result.attempts, "task completed");
                    self.emit(ExecutorEvent::TaskCompleted {
                        result: self.result.clone(),
                    })
                    .await;
                    return self.result;
                }
                Err(CircuitBreakerError::CircuitOpen { resource, retry_after }) => {
                    debug!(
                        task_id = %self.task.id,
                        resource = %resource,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "circuit open, waiting"
                    );
                    if self.wait_unless_cancelled(retry_after).await {
                        continue;
                    }
                    if self.result.attempts == 0 {
                        return self.finish_skipped("workflow cancelled while circuit open").await;
                    }
                    let message = format!("circuit breaker open for {}", resource);
                    return self.finish_failed(Error::CircuitOpen { resource }, &message).await;
                }
                Err(CircuitBreakerError::OperationFailed(error)) => error,
            };

            let (action, record) = self.recovery.handle_failure(&self.task, &error);
            let exhausted = self
                .recovery
                .policy()
                .strategy_for(&self.task.kind)
                .is_retryable(record.error_kind);
            match action {
                RecoveryAction::Retry { delay, reason } => {
                    warn!(
                        task_id = %self.task.id,
                        attempt,
                        error_kind = %record.error_kind,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "{}", reason
                    );
                    self.emit(ExecutorEvent::TaskRetrying {
                        result: self.result.clone(),
                        attempt,
                        delay,
                        error: error.to_string(),
                    })
                    .await;
                    tokio::time::sleep(delay).await;
                }
                RecoveryAction::Compensate { reason } => {
                    let mut message = format!("{} ({})", error, reason);
                    match self.backend.compensate(&self.task, &error).await {
                        Ok(()) => {
                            info!(task_id = %self.task.id, "compensation ran");
                            self.result.compensated = true;
                        }
                        Err(e) => {
                            error!(task_id = %self.task.id, error = %e, "compensation failed");
                            message.push_str(&format!("; compensation failed: {}", e));
                        }
                    }
                    let failure = self.failure(&error, &record.error_kind.to_string(), exhausted);
                    return self.finish_failed(failure, &message).await;
                }
                RecoveryAction::Fail { reason } => {
                    let message = format!("{} ({})", error, reason);
                    let failure = self.failure(&error, &record.error_kind.to_string(), exhausted);
                    return self.finish_failed(failure, &message).await;
                }
            }
        }
    }

    /// One backend call under the deadline and, if configured, the breaker.
    /// `admitted` is set when the backend was actually invoked.
    async fn execute_once(
        &self,
        attempt: u32,
        admitted: &mut bool,
    ) -> std::result::Result<Value, CircuitBreakerError<TaskError>> {
        let deadline = CancellationToken::new();
        let ctx = ExecutionContext {
            workflow_id: self.workflow_id,
            attempt,
            cancel: deadline.clone(),
            scope: self.scope.clone(),
        };
        let timeout = self.timeout;
        let exec = async move {
            match tokio::time::timeout(timeout, self.backend.execute(&self.task, ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    deadline.cancel();
                    Err(TaskError::deadline_exceeded(timeout))
                }
            }
        };

        match &self.breaker {
            Some(breaker) => {
                breaker
                    .call(|| {
                        *admitted = true;
                        exec
                    })
                    .await
            }
            None => {
                *admitted = true;
                exec.await.map_err(CircuitBreakerError::OperationFailed)
            }
        }
    }

    /// Sleep for `delay`; `false` if the run was cancelled first.
    async fn wait_unless_cancelled(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Typed error for a task that will not be retried again.
    fn failure(&self, error: &TaskError, error_kind: &str, exhausted: bool) -> Error {
        if error.is_deadline_exceeded() {
            Error::TaskTimeout {
                task_id: self.task.id.clone(),
                timeout: self.timeout,
            }
        } else if exhausted {
            Error::MaxRetriesExceeded {
                task_id: self.task.id.clone(),
                attempts: self.result.attempts,
            }
        } else {
            error.to_error(&self.task.id, error_kind)
        }
    }

    async fn finish_failed(mut self, failure: Error, message: &str) -> TaskResult {
        if matches!(failure, Error::TaskTimeout { .. }) {
            self.result.time_out(message);
        } else {
            self.result.fail(message);
        }
        error!(
            task_id = %self.task.id,
            status = %self.result.status,
            attempts = self.result.attempts,
            error = %failure,
            detail = message,
            "task failed"
        );
        self.emit(ExecutorEvent::TaskFailed {
            result: self.result.clone(),
        })
        .await;
        self.result
    }

    async fn finish_skipped(mut self, reason: &str) -> TaskResult {
        self.result.skip(reason);
        debug!(task_id = %self.task.id, reason, "task skipped");
        self.emit(ExecutorEvent::TaskSkipped {
            result: self.result.clone(),
        })
        .await;
        self.result
    }

    async fn emit(&self, event: ExecutorEvent) {
        emit(&self.events, event).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
