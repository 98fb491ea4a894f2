//! Resume and incremental regeneration tests.
//!
//! Each test runs the pipeline once to record state, changes something on
//! disk or in the settings, and checks which tasks the next run redoes.

use std::fs;

use conductor::orchestration::{CacheMode, ExecutionMode};
use conductor::state::ResumeManager;

use crate::fixtures::{abc_tasks, names, Behavior, Harness};

fn reason<'a>(summary: &'a conductor::orchestration::RunSummary, task: &str) -> &'a str {
    summary
        .result(task)
        .and_then(|r| r.reason.as_deref())
        .unwrap_or("")
}

async fn first_run(h: &Harness) {
    let summary = h.coordinator.run(h.request()).await.unwrap();
    assert!(summary.success, "{}", summary);
    h.worker().clear_events();
}

#[tokio::test(start_paused = true)]
async fn test_resume_skips_up_to_date_tasks() {
    let h = Harness::new(abc_tasks());
    first_run(&h).await;

    let summary = h
        .coordinator
        .run(h.request().with_cache(CacheMode::Resume))
        .await
        .unwrap();

    assert!(summary.success);
    assert_eq!(summary.skipped_count(), 3);
    assert_eq!(reason(&summary, "A"), "up-to-date");
    assert!(h.worker().events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_resume_state_file_written() {
    let h = Harness::new(abc_tasks());
    first_run(&h).await;

    let state_path = ResumeManager::state_path(&h.output_dir);
    assert!(state_path.exists());
    let resume = ResumeManager::load(&h.output_dir);
    assert_eq!(resume.state().task_outputs.len(), 3);
    let b = resume.record("B").unwrap();
    assert_eq!(
        b.dependency_hashes.get("A"),
        Some(&resume.record("A").unwrap().output_hash)
    );
    let c = resume.record("C").unwrap();
    assert_eq!(c.dependency_hashes.len(), 2);
    assert_eq!(
        c.dependency_hashes.get("B"),
        Some(&resume.record("B").unwrap().output_hash)
    );
}

#[tokio::test(start_paused = true)]
async fn test_modified_output_regenerates_downstream() {
    let h = Harness::new(abc_tasks());
    first_run(&h).await;

    fs::write(h.output("B"), "edited by hand").unwrap();

    let summary = h
        .coordinator
        .run(h.request().with_cache(CacheMode::Resume))
        .await
        .unwrap();

    assert!(summary.success, "{}", summary);
    assert!(summary.result("A").unwrap().skipped);
    assert!(!summary.result("B").unwrap().skipped);
    assert_eq!(reason(&summary, "B"), "output file was modified externally");
    // B's new output differs from the hash C was generated against.
    assert!(!summary.result("C").unwrap().skipped);
    assert_eq!(reason(&summary, "C"), "dependency B output changed");
    assert_eq!(h.worker().spawned(), vec!["B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn test_deleted_output_regenerates() {
    let h = Harness::new(abc_tasks());
    first_run(&h).await;

    fs::remove_file(h.output("C")).unwrap();

    let summary = h
        .coordinator
        .run(h.request().with_cache(CacheMode::Resume))
        .await
        .unwrap();

    assert_eq!(reason(&summary, "C"), "output file does not exist");
    assert_eq!(summary.skipped_count(), 2);
    assert_eq!(h.worker().spawned(), vec!["C"]);
}

#[tokio::test(start_paused = true)]
async fn test_input_change_regenerates_everything() {
    let h = Harness::new(abc_tasks());
    let input = h.write_input("src/main.rs", "fn main() {}\n");
    let request = || h.request().with_inputs(h.dir.path(), vec![input.clone()]);

    let summary = h.coordinator.run(request()).await.unwrap();
    assert!(summary.success);

    h.write_input("src/main.rs", "fn main() { println!(\"hi\"); }\n");
    let summary = h
        .coordinator
        .run(request().with_cache(CacheMode::Resume))
        .await
        .unwrap();

    assert_eq!(summary.skipped_count(), 0);
    assert_eq!(reason(&summary, "A"), "input files changed");
}

#[tokio::test(start_paused = true)]
async fn test_settings_change_regenerates() {
    let settings: toml::Table = toml::from_str("persona = \"architect\"").unwrap();
    let h = Harness::with_settings(abc_tasks(), settings);
    first_run(&h).await;

    let changed: toml::Table = toml::from_str("persona = \"reviewer\"").unwrap();
    let h = Harness::in_dir(h.dir, abc_tasks(), changed);
    let summary = h
        .coordinator
        .run(h.request().with_cache(CacheMode::Resume))
        .await
        .unwrap();

    assert_eq!(summary.skipped_count(), 0);
    assert_eq!(reason(&summary, "A"), "configuration changed");
}

#[tokio::test(start_paused = true)]
async fn test_force_runs_everything() {
    let h = Harness::new(abc_tasks());
    first_run(&h).await;

    let summary = h
        .coordinator
        .run(h.request().with_cache(CacheMode::Force))
        .await
        .unwrap();

    assert_eq!(summary.completed_count(), 3);
    assert_eq!(reason(&summary, "A"), "no previous output recorded");
    assert_eq!(h.worker().spawned(), vec!["A", "B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn test_normal_mode_runs_but_reports_decision() {
    let h = Harness::new(abc_tasks());
    first_run(&h).await;

    let summary = h.coordinator.run(h.request()).await.unwrap();

    assert_eq!(summary.completed_count(), 3);
    assert_eq!(reason(&summary, "A"), "up-to-date");
}

#[tokio::test(start_paused = true)]
async fn test_failed_task_is_not_recorded() {
    let h = Harness::new(abc_tasks());
    h.worker().set_behavior("B", Behavior::NoOutput);

    let summary = h.coordinator.run(h.request()).await.unwrap();
    assert!(!summary.success);

    let resume = ResumeManager::load(&h.output_dir);
    assert!(resume.record("A").is_some());
    assert!(resume.record("B").is_none());

    // Fixing B and resuming runs B and C only.
    h.worker().set_behavior("B", Behavior::Succeed);
    h.worker().clear_events();
    let summary = h
        .coordinator
        .run(h.request().with_cache(CacheMode::Resume).with_mode(ExecutionMode::Parallel))
        .await
        .unwrap();
    assert!(summary.success, "{}", summary);
    assert_eq!(names(&summary.results), vec!["A", "B", "C"]);
    assert_eq!(reason(&summary, "B"), "no previous output recorded");
    assert_eq!(h.worker().spawned(), vec!["B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_state_treated_as_empty() {
    let h = Harness::new(abc_tasks());
    first_run(&h).await;

    fs::write(ResumeManager::state_path(&h.output_dir), "{ not json").unwrap();

    let summary = h
        .coordinator
        .run(h.request().with_cache(CacheMode::Resume))
        .await
        .unwrap();

    assert!(summary.success);
    assert_eq!(summary.skipped_count(), 0);
    assert_eq!(reason(&summary, "A"), "no previous output recorded");
}
