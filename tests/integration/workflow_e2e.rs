//! End-to-end workflow tests.
//!
//! These tests submit definitions to a coordinator and check the final
//! workflow state, covering the basic scenarios, conditions, soft
//! dependencies, definition files and the shell backend.

use std::sync::Arc;

use serde_json::json;

use maestro::core::{Task, TaskId, TaskStatus};
use maestro::orchestration::{ShellExecutor, TaskRouter, SHELL_KIND};
use maestro::workflow::{WorkflowDefinition, WorkflowStatus};
use maestro::Error;

use crate::fixtures::{chain, coordinator, coordinator_with, executor, fan_in, ScriptedExecutor};

/// Test: Fan-in with a single worker
/// Given {A: [], B: [], C: [A, B]} and max_workers = 1
/// When the workflow runs
/// Then C starts only after both A and B completed
#[tokio::test]
async fn test_fan_in_single_worker() {
    let backend = Arc::new(ScriptedExecutor::new());
    let coordinator = coordinator_with(executor(1), backend.clone());

    let id = coordinator.start(&fan_in()).await.unwrap();
    let state = coordinator.wait_for_completion(&id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    let a = state.task(&TaskId::from("A")).unwrap();
    let b = state.task(&TaskId::from("B")).unwrap();
    let c = state.task(&TaskId::from("C")).unwrap();
    assert!(c.started_at.unwrap() >= a.ended_at.unwrap());
    assert!(c.started_at.unwrap() >= b.ended_at.unwrap());
    assert_eq!(backend.peak_concurrency(), 1);

    let order: Vec<String> = backend.calls().into_iter().map(|(id, _)| id).collect();
    assert_eq!(order.last().map(String::as_str), Some("C"));
}

/// Test: Permanent failure propagates
/// Given {A: [], B: [A]} where A always fails
/// When the workflow runs
/// Then B is skipped without running and the workflow fails
#[tokio::test]
async fn test_failure_skips_dependent() {
    let backend = Arc::new(ScriptedExecutor::new().always_fail("A", "schema validation failed"));
    let coordinator = coordinator(backend.clone());

    let id = coordinator.start(&chain()).await.unwrap();
    let state = coordinator.wait_for_completion(&id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.task_status(&TaskId::from("A")), TaskStatus::Failed);
    assert_eq!(state.task_status(&TaskId::from("B")), TaskStatus::Skipped);
    assert_eq!(backend.calls_for("B"), 0);
    assert!(state
        .task(&TaskId::from("A"))
        .unwrap()
        .error
        .as_deref()
        .unwrap()
        .contains("schema validation failed"));
}

/// Test: Unrelated branches keep going
/// Given two independent chains where the head of one fails
/// When the workflow runs
/// Then the other chain completes
#[tokio::test]
async fn test_failure_is_contained_to_its_branch() {
    let backend = Arc::new(ScriptedExecutor::new().always_fail("left", "bad input"));
    let coordinator = coordinator(backend);
    let definition = WorkflowDefinition::new(
        "branches",
        vec![
            Task::new("left", "default"),
            Task::new("left_child", "default").depends_on(["left"]),
            Task::new("right", "default"),
            Task::new("right_child", "default").depends_on(["right"]),
        ],
    );

    let id = coordinator.start(&definition).await.unwrap();
    let state = coordinator.wait_for_completion(&id).await.unwrap();

    assert_eq!(state.task_status(&TaskId::from("left_child")), TaskStatus::Skipped);
    assert_eq!(state.task_status(&TaskId::from("right_child")), TaskStatus::Completed);
    assert_eq!(state.failed_tasks(), vec![TaskId::from("left")]);
}

/// Test: Soft dependencies only warn
/// Given a report task with a soft dependency on a failing task
/// When the workflow runs
/// Then the report still runs and records the warning
#[tokio::test]
async fn test_soft_dependency_failure_does_not_block() {
    let backend = Arc::new(ScriptedExecutor::new().always_fail("enrich", "bad input"));
    let coordinator = coordinator(backend);
    let definition = WorkflowDefinition::new(
        "soft",
        vec![
            Task::new("enrich", "default"),
            Task::new("report", "default").depends_on(["enrich"]).soft(),
        ],
    );

    let id = coordinator.start(&definition).await.unwrap();
    let report = coordinator
        .wait_for_task(&id, &TaskId::from("report"))
        .await
        .unwrap();

    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("enrich"));
}

/// Test: Conditions see context and upstream results
/// Given tasks guarded by conditions over the context and task outputs
/// When the workflow runs
/// Then tasks with false conditions are skipped along with their dependents
#[tokio::test]
async fn test_conditions_gate_tasks() {
    let backend = Arc::new(ScriptedExecutor::new());
    let coordinator = coordinator(backend.clone());
    let definition = WorkflowDefinition::new(
        "conditional",
        vec![
            Task::new("build", "default"),
            Task::new("deploy", "default")
                .depends_on(["build"])
                .with_condition("env == 'prod' and tasks.build.status == 'completed'"),
            Task::new("smoke", "default").depends_on(["deploy"]),
            Task::new("archive", "default")
                .depends_on(["build"])
                .with_condition("tasks.build.output == 'build' && retain_days >= 7"),
        ],
    )
    .with_context("env", json!("staging"))
    .with_context("retain_days", json!(30));

    let id = coordinator.start(&definition).await.unwrap();
    let state = coordinator.wait_for_completion(&id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.task_status(&TaskId::from("deploy")), TaskStatus::Skipped);
    assert_eq!(state.task_status(&TaskId::from("smoke")), TaskStatus::Skipped);
    assert_eq!(state.task_status(&TaskId::from("archive")), TaskStatus::Completed);
    assert_eq!(backend.calls_for("deploy"), 0);
}

/// Test: Malformed definitions fail synchronously
/// Given definitions with a bad condition, a missing dependency and an
/// unknown task kind
/// When they are submitted
/// Then start returns an error and nothing runs
#[tokio::test]
async fn test_invalid_definitions_fail_fast() {
    let router = TaskRouter::new().route("default", Arc::new(ScriptedExecutor::new()));
    let coordinator = coordinator(Arc::new(router));

    let bad_condition = WorkflowDefinition::new(
        "w",
        vec![Task::new("a", "default").with_condition("count >")],
    );
    assert!(matches!(
        coordinator.start(&bad_condition).await,
        Err(Error::InvalidCondition { .. })
    ));

    let missing = WorkflowDefinition::new("w", vec![Task::new("a", "default").depends_on(["ghost"])]);
    assert!(matches!(
        coordinator.start(&missing).await,
        Err(Error::UnknownTask(_))
    ));

    let unknown_kind = WorkflowDefinition::new("w", vec![Task::new("a", "fax")]);
    assert!(matches!(
        coordinator.start(&unknown_kind).await,
        Err(Error::UnknownTaskKind(_))
    ));
    assert!(coordinator.active().is_empty());
}

/// Test: Definitions load from TOML
/// Given a TOML definition file on disk
/// When it is loaded and run
/// Then every task completes with its payload available to the backend
#[tokio::test]
async fn test_definition_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("etl.toml");
    std::fs::write(
        &path,
        r#"
id = "etl"

[context]
region = "eu"

[[tasks]]
id = "extract"
kind = "default"

[[tasks]]
id = "load"
kind = "default"
depends_on = ["extract"]
condition = "region == 'eu'"
timeout_ms = 5000
"#,
    )
    .unwrap();

    let definition = WorkflowDefinition::load(&path).unwrap();
    assert_eq!(definition.tasks.len(), 2);

    let coordinator = coordinator(Arc::new(ScriptedExecutor::new()));
    let id = coordinator.start(&definition).await.unwrap();
    let state = coordinator.wait_for_completion(&id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.definition_id.as_deref(), Some("etl"));
    assert_eq!(state.context["region"], json!("eu"));
}

/// Test: Shell backend
/// Given shell tasks where one exits non-zero
/// When the workflow runs through the shell router
/// Then stdout is captured and the failing task's dependent is skipped
#[tokio::test]
async fn test_shell_workflow() {
    let router = TaskRouter::new().route(SHELL_KIND, Arc::new(ShellExecutor::new()));
    let coordinator = coordinator(Arc::new(router));
    let definition = WorkflowDefinition::new(
        "shell",
        vec![
            Task::new("greet", SHELL_KIND).with_payload(json!({"command": "echo hello"})),
            Task::new("broken", SHELL_KIND)
                .with_payload(json!({"command": "echo 'no such table' >&2; exit 2"})),
            Task::new("after_broken", SHELL_KIND)
                .depends_on(["broken"])
                .with_payload(json!({"command": "true"})),
        ],
    );

    let id = coordinator.start(&definition).await.unwrap();
    let state = coordinator.wait_for_completion(&id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    let greet = state.task(&TaskId::from("greet")).unwrap();
    assert_eq!(greet.output["stdout"], json!("hello"));
    let broken = state.task(&TaskId::from("broken")).unwrap();
    assert_eq!(broken.status, TaskStatus::Failed);
    assert!(broken.error.as_deref().unwrap().contains("no such table"));
    assert_eq!(state.task_status(&TaskId::from("after_broken")), TaskStatus::Skipped);
}
