//! End-to-end run tests.
//!
//! Drive the coordinator over the scripted worker in both execution modes
//! and check ordering, fail-fast behaviour and cleanup.

use conductor::orchestration::ExecutionMode;
use conductor::{Error, TaskError};

use crate::fixtures::{abc_tasks, names, pipeline_tasks, Behavior, Harness, WorkerEvent};

fn dispatched(task: &str) -> WorkerEvent {
    WorkerEvent::Dispatched(task.to_string())
}

fn stopped(task: &str) -> WorkerEvent {
    WorkerEvent::Stopped(task.to_string())
}

/// Given A -> B -> C and A -> C
/// When all three run
/// Then the redundant edge leaves one task per level and each is dispatched
/// only after its dependencies finished
async fn assert_abc_completes(mode: ExecutionMode) {
    let h = Harness::new(abc_tasks());

    let summary = h.coordinator.run(h.request().with_mode(mode)).await.unwrap();

    assert!(summary.success, "{}", summary);
    assert_eq!(names(&summary.results), vec!["A", "B", "C"]);
    assert_eq!(summary.levels, vec![vec!["A"], vec!["B"], vec!["C"]]);
    for task in ["A", "B", "C"] {
        assert!(h.output(task).exists(), "{} output missing", task);
    }

    let worker = h.worker();
    assert!(worker.position(&stopped("A")) < worker.position(&dispatched("B")));
    assert!(worker.position(&stopped("B")) < worker.position(&dispatched("C")));
    assert!(worker.position(&stopped("A")) < worker.position(&dispatched("C")));
    assert!(h.coordinator.running().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_abc_sequential() {
    assert_abc_completes(ExecutionMode::Sequential).await;
}

#[tokio::test(start_paused = true)]
async fn test_abc_parallel() {
    assert_abc_completes(ExecutionMode::Parallel).await;
}

/// Given the A/B/C chain with B reporting done but writing nothing
/// When the run executes
/// Then A completes, B fails with OutputMissing and C is never spawned
async fn assert_b_failure_stops_run(mode: ExecutionMode) {
    let h = Harness::new(abc_tasks());
    h.worker().set_behavior("B", Behavior::NoOutput);

    let summary = h.coordinator.run(h.request().with_mode(mode)).await.unwrap();

    assert!(!summary.success);
    assert_eq!(names(&summary.results), vec!["A", "B"]);
    assert!(summary.results[0].is_success());
    assert_eq!(
        summary.results[1].error,
        Some(TaskError::OutputMissing(h.output("B")))
    );
    assert_eq!(summary.not_run(), vec!["C"]);
    assert!(!h.worker().spawned().contains(&"C".to_string()));
    assert_eq!(h.worker().stopped(), vec!["A", "B"]);
}

#[tokio::test(start_paused = true)]
async fn test_b_failure_sequential() {
    assert_b_failure_stops_run(ExecutionMode::Sequential).await;
}

#[tokio::test(start_paused = true)]
async fn test_b_failure_parallel() {
    assert_b_failure_stops_run(ExecutionMode::Parallel).await;
}

#[tokio::test(start_paused = true)]
async fn test_parallel_runs_level_concurrently() {
    let h = Harness::new(pipeline_tasks());

    let summary = h
        .coordinator
        .run(h.request().with_mode(ExecutionMode::Parallel))
        .await
        .unwrap();

    assert!(summary.success, "{}", summary);
    assert_eq!(summary.levels.len(), 4);
    assert_eq!(summary.levels[1], vec!["qa", "security"]);
    assert_eq!(h.worker().max_alive(), 2);

    // The level barrier: implementer waits for both of its dependencies.
    let worker = h.worker();
    assert!(worker.position(&stopped("qa")) < worker.position(&dispatched("implementer")));
    assert!(worker.position(&stopped("security")) < worker.position(&dispatched("implementer")));
}

#[tokio::test(start_paused = true)]
async fn test_sequential_runs_one_worker_at_a_time() {
    let h = Harness::new(pipeline_tasks());

    let summary = h.coordinator.run(h.request()).await.unwrap();

    assert!(summary.success, "{}", summary);
    assert_eq!(
        names(&summary.results),
        vec!["architect", "qa", "security", "implementer", "verifier"]
    );
    assert_eq!(h.worker().max_alive(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_level_finishes_before_aborting() {
    let h = Harness::new(pipeline_tasks());
    h.worker().set_behavior("qa", Behavior::Crash);

    let summary = h
        .coordinator
        .run(h.request().with_mode(ExecutionMode::Parallel))
        .await
        .unwrap();

    assert!(!summary.success);
    // security shares the level with qa and still runs to completion.
    assert!(summary.result("security").unwrap().is_success());
    assert_eq!(
        summary.result("qa").unwrap().error,
        Some(TaskError::CrashDetected { failures: 3 })
    );
    assert_eq!(summary.not_run(), vec!["implementer", "verifier"]);
    assert!(!h.worker().spawned().contains(&"implementer".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_requested_task_pulls_in_dependencies() {
    let h = Harness::new(pipeline_tasks());

    let summary = h
        .coordinator
        .run(h.request().with_tasks(&["implementer"]))
        .await
        .unwrap();

    assert!(summary.success);
    assert_eq!(
        names(&summary.results),
        vec!["architect", "qa", "security", "implementer"]
    );
    assert!(summary.result("verifier").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_task_fails_before_any_spawn() {
    let h = Harness::new(abc_tasks());

    let err = h
        .coordinator
        .run(h.request().with_tasks(&["Z"]))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnknownTask(ref name) if name == "Z"));
    assert!(err.is_configuration());
    assert!(h.worker().events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_spawn_failure_reported_in_summary() {
    let h = Harness::new(abc_tasks());
    h.worker().set_behavior("A", Behavior::SpawnFail);

    let summary = h.coordinator.run(h.request()).await.unwrap();

    assert!(!summary.success);
    assert_eq!(summary.results.len(), 1);
    assert!(matches!(summary.results[0].error, Some(TaskError::Spawn(ref msg)) if msg.contains("cannot start A")));
    assert!(h.worker().events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_payload_names_dependency_outputs() {
    let h = Harness::new(abc_tasks());

    h.coordinator.run(h.request()).await.unwrap();

    let payload = h.worker().payload("B").unwrap();
    assert!(payload.contains(&format!("- A: {}", h.output("A").display())));
    assert!(payload.contains(&h.output("B").display().to_string()));

    let payload = h.worker().payload("C").unwrap();
    assert!(payload.contains(&format!("- A: {}", h.output("A").display())));
    assert!(payload.contains(&format!("- B: {}", h.output("B").display())));
}

#[tokio::test(start_paused = true)]
async fn test_every_spawned_worker_is_stopped_once() {
    let h = Harness::new(pipeline_tasks());
    h.worker().set_behavior("verifier", Behavior::NoOutput);

    h.coordinator
        .run(h.request().with_mode(ExecutionMode::Parallel))
        .await
        .unwrap();

    let mut spawned = h.worker().spawned();
    let mut stopped = h.worker().stopped();
    spawned.sort();
    stopped.sort();
    assert_eq!(spawned, stopped);
    assert!(h.coordinator.running().is_empty());
}
