//! Parallel execution tests.
//!
//! These tests check the executor's ordering and concurrency guarantees:
//! levels run strictly in order, the worker limit holds across a wide level,
//! and a task never has two attempts in flight.

use std::sync::Arc;
use std::time::Duration;

use maestro::core::{DependencyGraph, Task, TaskId, TaskStatus};
use maestro::orchestration::{ExecutorEvent, RunScope};
use maestro::workflow::{WorkflowDefinition, WorkflowStatus};
use tokio::sync::mpsc;

use crate::fixtures::{coordinator_with, executor, ScriptedExecutor, Step};

/// Three layers of four tasks; every task depends on all of the layer above.
fn layered() -> DependencyGraph {
    let mut tasks = Vec::new();
    for layer in 0..3 {
        for i in 0..4 {
            let id = format!("l{}t{}", layer, i);
            let task = if layer == 0 {
                Task::new(id, "default")
            } else {
                Task::new(id, "default")
                    .depends_on((0..4).map(|j| format!("l{}t{}", layer - 1, j)))
            };
            tasks.push(task);
        }
    }
    DependencyGraph::from_tasks(tasks).unwrap()
}

/// Test: Levels are strictly ordered
/// Given a layered graph
/// When it runs with more workers than tasks
/// Then no task of a layer starts before every task of the previous layer ended
#[tokio::test(start_paused = true)]
async fn test_levels_run_in_order() {
    let graph = layered();
    let backend = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(5)));

    let report = executor(16)
        .run(&graph, backend.clone(), RunScope::new())
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(backend.peak_concurrency(), 4);

    for layer in 1..3 {
        for i in 0..4 {
            let task = report.result(&TaskId::new(format!("l{}t{}", layer, i))).unwrap();
            for j in 0..4 {
                let upstream = report
                    .result(&TaskId::new(format!("l{}t{}", layer - 1, j)))
                    .unwrap();
                assert!(task.started_at.unwrap() >= upstream.ended_at.unwrap());
            }
        }
    }
}

/// Test: The worker limit holds for a wide level
/// Given 200 independent tasks and max_workers = 7
/// When the workflow runs
/// Then all tasks complete and at most 7 ever run at once
#[tokio::test(start_paused = true)]
async fn test_worker_limit_on_wide_level() {
    let tasks: Vec<Task> = (0..200).map(|i| Task::new(format!("t{}", i), "default")).collect();
    let backend = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(20)));
    let coordinator = coordinator_with(executor(7), backend.clone());

    let id = coordinator
        .start(&WorkflowDefinition::new("wide", tasks))
        .await
        .unwrap();
    let state = coordinator.wait_for_completion(&id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(backend.calls().len(), 200);
    assert_eq!(backend.peak_concurrency(), 7);
}

/// Test: Backoff does not hold a worker slot
/// Given one worker, a task that fails once with a retryable error and a
/// sibling task
/// When the first task is waiting out its backoff
/// Then the sibling runs in the meantime
#[tokio::test(start_paused = true)]
async fn test_backoff_releases_worker() {
    let graph = DependencyGraph::from_tasks(vec![
        Task::new("flaky", "default"),
        Task::new("steady", "default"),
    ])
    .unwrap();
    let backend = Arc::new(ScriptedExecutor::new().script("flaky", vec![Step::Fail("503 Service Unavailable")]));

    let report = executor(1)
        .run(&graph, backend.clone(), RunScope::new())
        .await
        .unwrap();

    assert!(report.is_success());
    let order: Vec<(String, u32)> = backend.calls();
    assert_eq!(
        order,
        vec![
            ("flaky".to_string(), 1),
            ("steady".to_string(), 1),
            ("flaky".to_string(), 2),
        ]
    );
}

/// Test: One attempt at a time per task
/// Given a task that fails twice before succeeding
/// When it runs
/// Then attempts are numbered 1, 2, 3 and the events report exactly one
/// start and one completion
#[tokio::test(start_paused = true)]
async fn test_attempts_are_sequential() {
    let graph = DependencyGraph::from_tasks(vec![Task::new("job", "default")]).unwrap();
    let backend = Arc::new(ScriptedExecutor::new().script(
        "job",
        vec![Step::Fail("connection reset"), Step::Fail("connection reset")],
    ));
    let (tx, mut rx) = mpsc::channel(32);

    let report = executor(4)
        .run(&graph, backend.clone(), RunScope::new().with_events(tx))
        .await
        .unwrap();

    assert_eq!(report.status(&TaskId::from("job")), Some(TaskStatus::Completed));
    let attempts: Vec<u32> = backend.calls().into_iter().map(|(_, n)| n).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let mut started = 0;
    let mut retried = 0;
    let mut terminal = 0;
    while let Some(event) = rx.recv().await {
        match event {
            ExecutorEvent::TaskStarted { .. } => started += 1,
            ExecutorEvent::TaskRetrying { .. } => retried += 1,
            e if e.is_terminal() => terminal += 1,
            _ => {}
        }
    }
    assert_eq!((started, retried, terminal), (1, 2, 1));
}
