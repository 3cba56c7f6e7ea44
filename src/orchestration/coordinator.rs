//! Workflow coordinator.
//!
//! The coordinator is the entry point for running workflows. `start`
//! validates a definition, records the initial state and returns the new
//! workflow id right away; the run itself proceeds on a background task that
//! feeds every executor event into `StateStore::synchronize`. Callers observe
//! progress through `get_state`, `wait_for_task`, `wait_for_completion` or a
//! subscription.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::{DependencyGraph, TaskId, TaskResult, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::backend::TaskExecutor;
use crate::orchestration::executor::{ExecutorEvent, ParallelExecutor, RunReport, RunScope};
use crate::state::{StateStore, StateSubscription};
use crate::workflow::{
    StateChange, StateUpdate, WorkflowDefinition, WorkflowId, WorkflowState, WorkflowStatus,
};

/// Capacity of the executor-to-state event channel of one run.
const EVENT_BUFFER: usize = 256;

/// Push-only observer of workflow progress.
///
/// Calls for one workflow arrive in the order the changes were made. A sink
/// must not block; hand work off to a channel if it is slow.
pub trait NotificationSink: Send + Sync {
    /// Every committed state change.
    fn on_state_change(&self, _change: &StateChange) {}

    /// A task reached a terminal status.
    fn on_task_result(&self, _workflow_id: &WorkflowId, _result: &TaskResult) {}
}

/// Sink that writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl NotificationSink for LoggingSink {
    fn on_state_change(&self, change: &StateChange) {
        debug!(
            workflow_id = %change.workflow_id,
            version = change.version,
            status = ?change.updates.status,
            tasks = change.updates.tasks.len(),
            "state changed"
        );
    }

    fn on_task_result(&self, workflow_id: &WorkflowId, result: &TaskResult) {
        match result.status {
            TaskStatus::Completed => info!(
                workflow_id = %workflow_id,
                task_id = %result.task_id,
                attempts = result.attempts,
                "task completed"
            ),
            TaskStatus::Skipped => info!(
                workflow_id = %workflow_id,
                task_id = %result.task_id,
                reason = result.error.as_deref().unwrap_or(""),
                "task skipped"
            ),
            status => warn!(
                workflow_id = %workflow_id,
                task_id = %result.task_id,
                status = %status,
                error = result.error.as_deref().unwrap_or(""),
                "task failed"
            ),
        }
    }
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type Sinks = Arc<Vec<Arc<dyn NotificationSink>>>;

pub struct WorkflowCoordinator {
    executor: Arc<ParallelExecutor>,
    backend: Arc<dyn TaskExecutor>,
    store: StateStore,
    sinks: Sinks,
    runs: Arc<Mutex<HashMap<WorkflowId, RunHandle>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for WorkflowCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowCoordinator")
            .field("executor", &self.executor)
            .field("store", &self.store)
            .field("sinks", &self.sinks.len())
            .field("active_runs", &self.runs.lock().len())
            .finish()
    }
}

impl WorkflowCoordinator {
    pub fn new(executor: ParallelExecutor, backend: Arc<dyn TaskExecutor>, store: StateStore) -> Self {
        Self {
            executor: Arc::new(executor),
            backend,
            store,
            sinks: Arc::new(Vec::new()),
            runs: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register an observer. Affects workflows started afterwards.
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        let mut sinks = self.sinks.as_ref().clone();
        sinks.push(sink);
        self.sinks = Arc::new(sinks);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn executor(&self) -> &ParallelExecutor {
        &self.executor
    }

    /// Ids of workflows whose runs have not finished.
    pub fn active(&self) -> Vec<WorkflowId> {
        let mut ids: Vec<WorkflowId> = self.runs.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Submit a workflow and start running it.
    ///
    /// Invalid definitions fail here and nothing runs: cycles, undefined or
    /// duplicate task ids, bad conditions and task kinds the backend does not
    /// support. Everything that goes wrong later is reported through the
    /// workflow's state.
    pub async fn start(&self, definition: &WorkflowDefinition) -> Result<WorkflowId> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Validation("coordinator is closed".to_string()));
        }

        let graph = definition.plan().inspect_err(|e| {
            warn!(definition = %definition.id, error = %e, "workflow rejected");
        })?;
        for task in graph.tasks() {
            if !self.backend.supports(&task.kind) {
                warn!(definition = %definition.id, task_id = %task.id, kind = %task.kind, "workflow rejected");
                return Err(Error::UnknownTaskKind(task.kind.clone()));
            }
        }

        let workflow_id = WorkflowId::new();
        let forwarder = if self.sinks.is_empty() {
            None
        } else {
            Some(self.store.subscribe(&workflow_id).await?)
        };

        let mut initial = StateUpdate::new()
            .definition_id(&definition.id)
            .with_context(definition.context.clone());
        for id in graph.task_ids() {
            initial = initial.task(TaskResult::pending(id));
        }
        self.store.synchronize(&workflow_id, initial).await?;

        if let Some(subscription) = forwarder {
            tokio::spawn(forward_changes(
                subscription,
                self.sinks.clone(),
                self.shutdown.clone(),
            ));
        }

        let cancel = self.shutdown.child_token();
        let run = Run {
            workflow_id,
            graph,
            scope: RunScope::new()
                .workflow(workflow_id)
                .with_context(definition.context.clone())
                .with_cancel(cancel.clone()),
            executor: self.executor.clone(),
            backend: self.backend.clone(),
            store: self.store.clone(),
            sinks: self.sinks.clone(),
            runs: self.runs.clone(),
        };

        // Registered before the run can finish and deregister itself.
        {
            let mut runs = self.runs.lock();
            let task = tokio::spawn(run.drive());
            runs.insert(workflow_id, RunHandle { cancel, task });
        }

        info!(
            workflow_id = %workflow_id,
            definition = %definition.id,
            tasks = definition.tasks.len(),
            "workflow started"
        );
        Ok(workflow_id)
    }

    pub async fn get_state(&self, workflow_id: &WorkflowId) -> Result<WorkflowState> {
        self.store
            .get(workflow_id)
            .await?
            .ok_or(Error::WorkflowNotFound(*workflow_id))
    }

    /// Wait until `task_id` is terminal, up to the store's wait timeout.
    pub async fn wait_for_task(&self, workflow_id: &WorkflowId, task_id: &TaskId) -> Result<TaskResult> {
        self.store
            .wait_for(workflow_id, task_id, self.store.config().wait_timeout)
            .await
    }

    /// Wait until the workflow is terminal, up to the store's wait timeout.
    pub async fn wait_for_completion(&self, workflow_id: &WorkflowId) -> Result<WorkflowState> {
        self.store
            .wait_for_workflow(workflow_id, self.store.config().wait_timeout)
            .await
    }

    pub async fn subscribe(&self, workflow_id: &WorkflowId) -> Result<StateSubscription> {
        self.store.subscribe(workflow_id).await
    }

    /// Stop dispatching new tasks for a workflow. Tasks already running
    /// finish; the rest are skipped and the workflow ends `Cancelled`.
    ///
    /// Returns `false` when the workflow exists but is no longer running.
    pub async fn cancel(&self, workflow_id: &WorkflowId) -> Result<bool> {
        let token = self.runs.lock().get(workflow_id).map(|run| run.cancel.clone());
        match token {
            Some(token) => {
                info!(workflow_id = %workflow_id, "cancelling workflow");
                token.cancel();
                Ok(true)
            }
            None => {
                self.get_state(workflow_id).await?;
                Ok(false)
            }
        }
    }

    /// Cancel every active run and wait for the runs to wind down.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handles: Vec<(WorkflowId, RunHandle)> = self.runs.lock().drain().collect();
        info!(active_runs = handles.len(), "closing coordinator");
        for (workflow_id, handle) in handles {
            if let Err(e) = handle.task.await {
                error!(workflow_id = %workflow_id, error = %e, "workflow run aborted");
            }
        }
    }
}

/// One workflow run, driven on its own tokio task.
struct Run {
    workflow_id: WorkflowId,
    graph: DependencyGraph,
    scope: RunScope,
    executor: Arc<ParallelExecutor>,
    backend: Arc<dyn TaskExecutor>,
    store: StateStore,
    sinks: Sinks,
    runs: Arc<Mutex<HashMap<WorkflowId, RunHandle>>>,
}

impl Run {
    async fn drive(self) {
        let workflow_id = self.workflow_id;
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let scope = self.scope.clone().with_events(tx);

        let run = self.executor.run(&self.graph, self.backend.clone(), scope);
        let apply = async {
            let mut sync_error = None;
            while let Some(event) = rx.recv().await {
                if let Err(e) = self.apply(event).await {
                    error!(workflow_id = %workflow_id, error = %e, "failed to record task event");
                    if sync_error.is_none() {
                        sync_error = Some(e);
                    }
                }
            }
            sync_error
        };
        let (report, sync_error) = tokio::join!(run, apply);

        let status = final_status(&report, sync_error.as_ref());
        let finish = self
            .store
            .synchronize_with(&workflow_id, move |state| {
                if state.status.is_terminal() {
                    Ok(StateUpdate::new())
                } else {
                    Ok(StateUpdate::new().status(status))
                }
            })
            .await;

        match (&finish, &report) {
            (Err(e), _) => error!(workflow_id = %workflow_id, error = %e, "failed to record workflow outcome"),
            (Ok(_), Ok(report)) => info!(
                workflow_id = %workflow_id,
                status = %status,
                completed = report.count(TaskStatus::Completed),
                failed = report.failed().len(),
                skipped = report.count(TaskStatus::Skipped),
                "workflow finished"
            ),
            (Ok(_), Err(e)) => error!(workflow_id = %workflow_id, error = %e, "workflow run failed"),
        }

        self.runs.lock().remove(&workflow_id);
    }

    async fn apply(&self, event: ExecutorEvent) -> Result<()> {
        let result = event.result().clone();
        match &event {
            ExecutorEvent::TaskStarted { .. } => {
                self.store
                    .synchronize_with(&self.workflow_id, |state| {
                        let update = StateUpdate::new().task(result.clone());
                        if state.status == WorkflowStatus::Pending {
                            Ok(update.status(WorkflowStatus::Running))
                        } else {
                            Ok(update)
                        }
                    })
                    .await?;
            }
            _ => {
                self.store
                    .synchronize(&self.workflow_id, StateUpdate::new().task(result.clone()))
                    .await?;
            }
        }

        if event.is_terminal() {
            for sink in self.sinks.iter() {
                sink.on_task_result(&self.workflow_id, &result);
            }
        }
        Ok(())
    }
}

/// Failed tasks win over cancellation; state write failures fail the run.
fn final_status(report: &Result<RunReport>, sync_error: Option<&Error>) -> WorkflowStatus {
    if sync_error.is_some() {
        return WorkflowStatus::Failed;
    }
    match report {
        Ok(report) => match report.error() {
            None => WorkflowStatus::Completed,
            Some(Error::Cancelled) => WorkflowStatus::Cancelled,
            Some(_) => WorkflowStatus::Failed,
        },
        Err(_) => WorkflowStatus::Failed,
    }
}

async fn forward_changes(mut subscription: StateSubscription, sinks: Sinks, shutdown: CancellationToken) {
    loop {
        let change = tokio::select! {
            change = subscription.recv() => change,
            _ = shutdown.cancelled() => None,
        };
        let Some(change) = change else {
            break;
        };
        let finished = change.updates.status.is_some_and(|s| s.is_terminal());
        for sink in sinks.iter() {
            sink.on_state_change(&change);
        }
        if finished {
            break;
        }
    }
}
