//! Versioned, lock-protected workflow state.
//!
//! Every write goes through `synchronize`: take the workflow lock, read the
//! current state, merge the update, bump the version, save, broadcast the
//! change and release the lock. Writes to one workflow never interleave.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::task::{TaskId, TaskResult};
use crate::error::{Error, Result};
use crate::state::backend::{LockToken, MemoryBackend, StateBackend};
use crate::workflow::{StateChange, StateUpdate, WorkflowId, WorkflowState};

const STATE_PREFIX: &str = "maestro:state:";
const LOCK_PREFIX: &str = "maestro:lock:";
const TOPIC_PREFIX: &str = "maestro:changes:";

#[derive(Debug, Clone, PartialEq)]
pub struct StateStoreConfig {
    /// Lock lifetime; a crashed holder loses the lock after this long.
    pub lock_ttl: Duration,
    pub lock_poll_interval: Duration,
    pub lock_max_attempts: u32,
    /// Retries of a whole synchronize after a transient error.
    pub sync_max_retries: u32,
    pub sync_backoff: Duration,
    /// Expiry applied to the stored state on every save.
    pub state_ttl: Option<Duration>,
    pub wait_timeout: Duration,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(50),
            lock_max_attempts: 200,
            sync_max_retries: 3,
            sync_backoff: Duration::from_millis(100),
            state_ttl: None,
            wait_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    config: StateStoreConfig,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StateBackend>, config: StateStoreConfig) -> Self {
        Self { backend, config }
    }

    /// Store backed by a fresh `MemoryBackend`.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), StateStoreConfig::default())
    }

    pub fn config(&self) -> &StateStoreConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    pub async fn get(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowState>> {
        match self.backend.get(&state_key(workflow_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Merge `update` into the workflow's state and return the new state.
    pub async fn synchronize(
        &self,
        workflow_id: &WorkflowId,
        update: StateUpdate,
    ) -> Result<WorkflowState> {
        self.synchronize_with(workflow_id, move |_| Ok(update.clone()))
            .await
    }

    /// Like `synchronize`, computing the update from the current state while
    /// the lock is held. `build` may run more than once if the write is
    /// retried.
    pub async fn synchronize_with<F>(
        &self,
        workflow_id: &WorkflowId,
        build: F,
    ) -> Result<WorkflowState>
    where
        F: Fn(&WorkflowState) -> Result<StateUpdate> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            match self.try_synchronize(workflow_id, &build).await {
                Ok(state) => return Ok(state),
                Err(e) if e.is_transient() && attempt < self.config.sync_max_retries => {
                    let delay = self.config.sync_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        workflow_id = %workflow_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "synchronize failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_synchronize<F>(&self, workflow_id: &WorkflowId, build: &F) -> Result<WorkflowState>
    where
        F: Fn(&WorkflowState) -> Result<StateUpdate> + Send + Sync,
    {
        let lock_key = lock_key(workflow_id);
        let token = self.acquire_lock(&lock_key).await?;

        let outcome = AssertUnwindSafe(self.merge_and_save(workflow_id, build))
            .catch_unwind()
            .await;

        self.release_lock(&lock_key, &token).await;

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn merge_and_save<F>(&self, workflow_id: &WorkflowId, build: &F) -> Result<WorkflowState>
    where
        F: Fn(&WorkflowState) -> Result<StateUpdate> + Send + Sync,
    {
        let current = self
            .get(workflow_id)
            .await?
            .unwrap_or_else(|| WorkflowState::new(*workflow_id));

        let update = build(&current)?;
        let mut next = current.clone();
        next.apply(&update)?;
        next.version = current.version + 1;
        next.last_updated = Utc::now();

        self.backend
            .set(
                &state_key(workflow_id),
                serde_json::to_vec(&next)?,
                self.config.state_ttl,
            )
            .await?;

        let change = StateChange {
            workflow_id: *workflow_id,
            updates: update,
            version: next.version,
            timestamp: next.last_updated,
        };
        // The state is already durable; a lost notification only delays waiters.
        if let Err(e) = self.publish(&change).await {
            warn!(workflow_id = %workflow_id, error = %e, "failed to publish state change");
        }

        debug!(workflow_id = %workflow_id, version = next.version, "state synchronized");
        Ok(next)
    }

    async fn publish(&self, change: &StateChange) -> Result<()> {
        let bytes = serde_json::to_vec(change)?;
        self.backend
            .publish(&topic(&change.workflow_id), bytes)
            .await
    }

    async fn acquire_lock(&self, key: &str) -> Result<LockToken> {
        for attempt in 1..=self.config.lock_max_attempts {
            if let Some(token) = self.backend.acquire(key, self.config.lock_ttl).await? {
                return Ok(token);
            }
            if attempt < self.config.lock_max_attempts {
                debug!(key, attempt, "lock contended");
                tokio::time::sleep(self.config.lock_poll_interval).await;
            }
        }
        Err(Error::LockAcquisition {
            key: key.to_string(),
            attempts: self.config.lock_max_attempts,
        })
    }

    async fn release_lock(&self, key: &str, token: &LockToken) {
        match self.backend.release(key, token).await {
            Ok(true) => {}
            Ok(false) => warn!(key, "lock expired before release"),
            Err(e) => warn!(key, error = %e, "failed to release lock"),
        }
    }

    /// Change notifications for one workflow.
    pub async fn subscribe(&self, workflow_id: &WorkflowId) -> Result<StateSubscription> {
        let rx = self.backend.subscribe(&topic(workflow_id)).await?;
        Ok(StateSubscription {
            workflow_id: *workflow_id,
            rx,
        })
    }

    /// Wait until `task_id` reaches a terminal status.
    ///
    /// Checks the current state first, then re-checks after every change
    /// notification for the workflow.
    pub async fn wait_for(
        &self,
        workflow_id: &WorkflowId,
        task_id: &TaskId,
        timeout: Duration,
    ) -> Result<TaskResult> {
        let deadline = Instant::now() + timeout;
        let mut subscription = self.subscribe(workflow_id).await?;

        loop {
            let state = self
                .get(workflow_id)
                .await?
                .ok_or(Error::WorkflowNotFound(*workflow_id))?;
            match state.task(task_id) {
                Some(result) if result.status.is_terminal() => return Ok(result.clone()),
                None if state.status.is_terminal() => {
                    return Err(Error::UnknownTask(task_id.clone()))
                }
                _ => {}
            }

            let notified = tokio::time::timeout_at(deadline, subscription.changed()).await;
            match notified {
                Ok(true) => continue,
                Ok(false) => {
                    return Err(Error::Backend(format!(
                        "change stream for workflow {} closed",
                        workflow_id
                    )))
                }
                Err(_) => {
                    return Err(Error::WaitTimeout {
                        workflow_id: *workflow_id,
                        task_id: task_id.clone(),
                        timeout,
                    })
                }
            }
        }
    }

    /// Wait until the workflow reaches a terminal status.
    pub async fn wait_for_workflow(
        &self,
        workflow_id: &WorkflowId,
        timeout: Duration,
    ) -> Result<WorkflowState> {
        let deadline = Instant::now() + timeout;
        let mut subscription = self.subscribe(workflow_id).await?;

        loop {
            let state = self
                .get(workflow_id)
                .await?
                .ok_or(Error::WorkflowNotFound(*workflow_id))?;
            if state.status.is_terminal() {
                return Ok(state);
            }

            match tokio::time::timeout_at(deadline, subscription.changed()).await {
                Ok(true) => continue,
                Ok(false) => {
                    return Err(Error::Backend(format!(
                        "change stream for workflow {} closed",
                        workflow_id
                    )))
                }
                Err(_) => {
                    return Err(Error::WorkflowTimeout {
                        workflow_id: *workflow_id,
                        timeout,
                    })
                }
            }
        }
    }

    /// Delete a workflow's state. Returns whether it existed.
    pub async fn cleanup(&self, workflow_id: &WorkflowId) -> Result<bool> {
        let lock_key = lock_key(workflow_id);
        let token = self.acquire_lock(&lock_key).await?;
        let deleted = self.backend.delete(&state_key(workflow_id)).await;
        self.release_lock(&lock_key, &token).await;

        let deleted = deleted?;
        if deleted {
            debug!(workflow_id = %workflow_id, "state cleaned up");
        }
        Ok(deleted)
    }
}

/// Stream of `StateChange`s for one workflow.
#[derive(Debug)]
pub struct StateSubscription {
    workflow_id: WorkflowId,
    rx: broadcast::Receiver<Vec<u8>>,
}

impl StateSubscription {
    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    /// Next decodable change, or `None` once the stream is closed.
    ///
    /// Messages dropped because this subscriber lagged are skipped.
    pub async fn recv(&mut self) -> Option<StateChange> {
        loop {
            match self.rx.recv().await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(change) => return Some(change),
                    Err(e) => warn!(workflow_id = %self.workflow_id, error = %e, "undecodable state change"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(workflow_id = %self.workflow_id, skipped = n, "state subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Resolve on the next notification of any kind. `false` once closed.
    async fn changed(&mut self) -> bool {
        match self.rx.recv().await {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => true,
            Err(broadcast::error::RecvError::Closed) => false,
        }
    }
}

fn state_key(id: &WorkflowId) -> String {
    format!("{}{}", STATE_PREFIX, id)
}

fn lock_key(id: &WorkflowId) -> String {
    format!("{}{}", LOCK_PREFIX, id)
}

fn topic(id: &WorkflowId) -> String {
    format!("{}{}", TOPIC_PREFIX, id)
}
