//! State synchronization tests.
//!
//! Several `StateStore` handles over one backend stand in for processes
//! sharing a store. The tests check that writes stay serializable across
//! handles, that every change reaches subscribers in version order, and
//! that waiters observe results written by a running coordinator.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use maestro::core::{TaskId, TaskResult, TaskStatus};
use maestro::state::{MemoryBackend, StateBackend, StateStore, StateStoreConfig};
use maestro::workflow::{StateUpdate, WorkflowId, WorkflowStatus};
use maestro::Error;

use crate::fixtures::{coordinator, fan_in, ScriptedExecutor};

fn shared_stores(n: usize) -> (Arc<MemoryBackend>, Vec<StateStore>) {
    let backend = Arc::new(MemoryBackend::new());
    let config = StateStoreConfig {
        lock_poll_interval: Duration::from_millis(1),
        lock_max_attempts: 10_000,
        ..StateStoreConfig::default()
    };
    let stores = (0..n)
        .map(|_| StateStore::new(backend.clone(), config.clone()))
        .collect();
    (backend, stores)
}

fn counter(store_state: &maestro::workflow::WorkflowState) -> i64 {
    store_state
        .context
        .get("counter")
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}

/// Test: Read-modify-write across handles
/// Given four store handles on one backend
/// When each handle increments a counter 25 times concurrently
/// Then the counter ends at exactly 100 and the version equals the number
/// of writes
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_increments_serialize_across_handles() {
    let (_backend, stores) = shared_stores(4);
    let id = WorkflowId::new();

    let mut handles = Vec::new();
    for store in stores.iter().cloned() {
        handles.push(tokio::spawn(async move {
            for _ in 0..25 {
                store
                    .synchronize_with(&id, |state| {
                        Ok(StateUpdate::new().context("counter", json!(counter(state) + 1)))
                    })
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let state = stores[0].get(&id).await.unwrap().unwrap();
    assert_eq!(counter(&state), 100);
    assert_eq!(state.version, 100);
}

/// Test: Every handle sees the same ordered stream
/// Given subscribers on two different handles
/// When a third handle writes a run from pending to completed
/// Then both subscribers receive every version in order
#[tokio::test]
async fn test_subscribers_on_other_handles_see_every_version() {
    let (_backend, stores) = shared_stores(3);
    let id = WorkflowId::new();
    let mut first = stores[0].subscribe(&id).await.unwrap();
    let mut second = stores[1].subscribe(&id).await.unwrap();

    let writer = &stores[2];
    writer
        .synchronize(&id, StateUpdate::new().definition_id("report"))
        .await
        .unwrap();
    for status in [WorkflowStatus::Running, WorkflowStatus::Completed] {
        writer
            .synchronize(&id, StateUpdate::new().status(status))
            .await
            .unwrap();
    }

    for sub in [&mut first, &mut second] {
        let mut versions = Vec::new();
        for _ in 0..3 {
            versions.push(sub.recv().await.unwrap().version);
        }
        assert_eq!(versions, vec![1, 2, 3]);
    }
}

/// Test: Waiting from another handle
/// Given a writer and a waiter on different handles
/// When the writer records the task as completed after a delay
/// Then the waiter returns that result
#[tokio::test(start_paused = true)]
async fn test_wait_for_observes_other_handle() {
    let (_backend, stores) = shared_stores(2);
    let (writer, waiter) = (stores[0].clone(), stores[1].clone());
    let id = WorkflowId::new();
    let task = TaskId::from("render");

    writer
        .synchronize(
            &id,
            StateUpdate::new().task(TaskResult::pending(task.clone())),
        )
        .await
        .unwrap();

    let producer = tokio::spawn({
        let task = task.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let mut result = TaskResult::pending(task);
            result.start();
            result.complete(json!({"frames": 240}));
            writer
                .synchronize(&id, StateUpdate::new().task(result))
                .await
                .unwrap();
        }
    });

    let result = waiter
        .wait_for(&id, &task, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.output["frames"], json!(240));
    producer.await.unwrap();
}

/// Test: Waiting gives up
/// Given a task that never finishes
/// When a waiter uses a short timeout
/// Then it fails with WaitTimeout
#[tokio::test(start_paused = true)]
async fn test_wait_for_timeout() {
    let (_backend, stores) = shared_stores(1);
    let id = WorkflowId::new();
    let task = TaskId::from("stuck");
    stores[0]
        .synchronize(&id, StateUpdate::new().task(TaskResult::pending(task.clone())))
        .await
        .unwrap();

    let err = stores[0]
        .wait_for(&id, &task, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WaitTimeout { .. }));
}

/// Test: Stale locks expire
/// Given a lock left behind by a holder that crashed
/// When another handle synchronizes
/// Then it takes the lock over once the lock's ttl has passed
#[tokio::test(start_paused = true)]
async fn test_stale_lock_is_taken_over() {
    let backend = Arc::new(MemoryBackend::new());
    let store = StateStore::new(
        backend.clone(),
        StateStoreConfig {
            lock_ttl: Duration::from_secs(2),
            lock_poll_interval: Duration::from_millis(100),
            lock_max_attempts: 100,
            ..StateStoreConfig::default()
        },
    );
    let id = WorkflowId::new();

    let orphan = backend
        .acquire(&format!("maestro:lock:{}", id), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(orphan.is_some());

    let state = store
        .synchronize(&id, StateUpdate::new().status(WorkflowStatus::Running))
        .await
        .unwrap();
    assert_eq!(state.version, 1);
}

/// Test: Rejected writes leave no trace
/// Given a completed workflow
/// When an update tries to move it back to running
/// Then the write fails and the version is unchanged
#[tokio::test]
async fn test_invalid_transition_is_not_written() {
    let (_backend, stores) = shared_stores(1);
    let store = &stores[0];
    let id = WorkflowId::new();
    store
        .synchronize(&id, StateUpdate::new().status(WorkflowStatus::Completed))
        .await
        .unwrap();

    let err = store
        .synchronize(&id, StateUpdate::new().status(WorkflowStatus::Running))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStatusTransition { .. }));
    assert_eq!(store.get(&id).await.unwrap().unwrap().version, 1);
}

/// Test: Cleanup after completion
/// Given a finished workflow
/// When its state is cleaned up
/// Then it is gone for every handle and a second cleanup reports nothing
#[tokio::test]
async fn test_cleanup_is_visible_to_all_handles() {
    let coordinator = coordinator(Arc::new(ScriptedExecutor::new()));
    let id = coordinator.start(&fan_in()).await.unwrap();
    coordinator.wait_for_completion(&id).await.unwrap();

    let store = coordinator.store().clone();
    assert!(store.cleanup(&id).await.unwrap());
    assert!(store.get(&id).await.unwrap().is_none());
    assert!(!store.cleanup(&id).await.unwrap());
    assert!(matches!(
        coordinator.get_state(&id).await,
        Err(Error::WorkflowNotFound(_))
    ));
}
