//! Run coordinator.
//!
//! Expands the requested tasks with their dependencies, groups them into
//! dependency levels and executes them either one at a time in topological
//! order or level by level with every task of a level running concurrently.
//! Either way a failed task stops the run before anything downstream of it
//! is dispatched.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_BASE_PORT;
use crate::core::{ExecutionResult, TaskDag, TaskRegistry};
use crate::error::TaskError;
use crate::orchestration::lifecycle::{stop_worker, LifecycleConfig, LifecycleExecutor};
use crate::orchestration::render::{PayloadRenderer, RenderContext};
use crate::orchestration::worker::WorkerBackend;
use crate::state::{ResumeManager, RunningRegistry};
use crate::{Error, Result};

/// How the expanded task set is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// One task at a time in topological order.
    #[default]
    Sequential,
    /// All tasks of a dependency level at once, with a barrier per level.
    Parallel,
}

/// How the resume layer is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Consult and record, but run every task.
    #[default]
    Normal,
    /// Skip tasks whose recorded output is up to date.
    Resume,
    /// Discard recorded state and run every task.
    Force,
}

/// Parameters of one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Requested task names. Empty means every task in the registry.
    pub tasks: Vec<String>,
    pub mode: ExecutionMode,
    pub cache: CacheMode,
    /// Overrides the per-task timeout of the lifecycle config.
    pub timeout: Option<Duration>,
    pub output_dir: PathBuf,
    /// Directory input file paths are relative to.
    pub input_root: PathBuf,
    pub input_files: Vec<PathBuf>,
}

impl RunRequest {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks: Vec::new(),
            mode: ExecutionMode::default(),
            cache: CacheMode::default(),
            timeout: None,
            output_dir: output_dir.into(),
            input_root: PathBuf::from("."),
            input_files: Vec::new(),
        }
    }

    pub fn with_tasks<S: AsRef<str>>(mut self, tasks: &[S]) -> Self {
        self.tasks = tasks.iter().map(|t| t.as_ref().to_string()).collect();
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_inputs(mut self, root: impl Into<PathBuf>, files: Vec<PathBuf>) -> Self {
        self.input_root = root.into();
        self.input_files = files;
        self
    }
}

/// Outcome of a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// One result per task that was attempted or skipped, in execution order.
    pub results: Vec<ExecutionResult>,
    /// The dependency levels of the expanded task set.
    pub levels: Vec<Vec<String>>,
    /// True when every expanded task completed or was skipped.
    pub success: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl RunSummary {
    fn new(results: Vec<ExecutionResult>, levels: Vec<Vec<String>>, cancelled: bool, duration: Duration) -> Self {
        let expected: usize = levels.iter().map(Vec::len).sum();
        let success = !cancelled && results.len() == expected && results.iter().all(ExecutionResult::is_success);
        Self {
            results,
            levels,
            success,
            cancelled,
            duration,
        }
    }

    pub fn result(&self, task: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.task == task)
    }

    pub fn completed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success() && !r.skipped).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.results.iter().filter(|r| r.skipped).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.is_success()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| !r.is_success())
    }

    /// Tasks of the expanded set that never produced a result.
    pub fn not_run(&self) -> Vec<&str> {
        self.levels
            .iter()
            .flatten()
            .filter(|name| self.result(name).is_none())
            .map(String::as_str)
            .collect()
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outcome = if self.cancelled {
            "cancelled"
        } else if self.success {
            "succeeded"
        } else {
            "failed"
        };
        writeln!(
            f,
            "Run {} in {:.1?}: {} completed, {} skipped, {} failed",
            outcome,
            self.duration,
            self.completed_count(),
            self.skipped_count(),
            self.failed_count()
        )?;

        let width = self.levels.iter().flatten().map(String::len).max().unwrap_or(0);
        for result in &self.results {
            let (mark, status, detail) = match (&result.error, result.skipped) {
                (Some(err), _) => ("✗", "failed", err.to_string()),
                (None, true) => (
                    "-",
                    "skipped",
                    result.reason.clone().unwrap_or_else(|| "up-to-date".to_string()),
                ),
                (None, false) => ("✓", "completed", result.output_path.display().to_string()),
            };
            writeln!(
                f,
                "  {} {:<width$}  {:<9}  {:>7}  {}",
                mark,
                result.task,
                status,
                format!("{:.1?}", result.duration),
                detail,
                width = width
            )?;
        }
        for name in self.not_run() {
            writeln!(f, "  · {:<width$}  not run", name, width = width)?;
        }
        Ok(())
    }
}

/// Drives runs over one task registry and one worker backend.
pub struct RunCoordinator<W: WorkerBackend, R: PayloadRenderer> {
    registry: Arc<TaskRegistry>,
    dag: TaskDag,
    worker: Arc<W>,
    renderer: Arc<R>,
    settings: Arc<toml::Table>,
    lifecycle: LifecycleConfig,
    running: Arc<RunningRegistry<W::Handle>>,
    cancel: CancellationToken,
}

impl<W: WorkerBackend, R: PayloadRenderer> RunCoordinator<W, R> {
    pub fn new(registry: TaskRegistry, worker: W, renderer: R) -> Self {
        let dag = TaskDag::new(&registry);
        Self {
            registry: Arc::new(registry),
            dag,
            worker: Arc::new(worker),
            renderer: Arc::new(renderer),
            settings: Arc::new(toml::Table::new()),
            lifecycle: LifecycleConfig::default(),
            running: Arc::new(RunningRegistry::new(DEFAULT_BASE_PORT, None)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Pipeline settings passed to the renderer and hashed as the config.
    pub fn with_settings(mut self, settings: toml::Table) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn with_running_registry(mut self, running: Arc<RunningRegistry<W::Handle>>) -> Self {
        self.running = running;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn running(&self) -> &Arc<RunningRegistry<W::Handle>> {
        &self.running
    }

    pub fn worker(&self) -> &Arc<W> {
        &self.worker
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Dependency levels for `tasks` expanded with their dependencies.
    /// Empty `tasks` plans the whole registry.
    pub fn plan<S: AsRef<str>>(&self, tasks: &[S]) -> Result<Vec<Vec<String>>> {
        let expanded = if tasks.is_empty() {
            self.dag.expand_with_dependencies(self.registry.names())?
        } else {
            self.dag.expand_with_dependencies(tasks)?
        };
        self.dag.dependency_levels(&expanded)
    }

    /// Execute a run.
    ///
    /// Task failures are reported in the summary. `Err` is returned only for
    /// problems found before any task runs: unknown tasks, cycles, unreadable
    /// input files or an output directory that cannot be created.
    pub async fn run(&self, request: RunRequest) -> Result<RunSummary> {
        let started = Instant::now();
        let levels = self.plan(request.tasks.as_slice())?;
        info!(
            tasks = levels.iter().map(Vec::len).sum::<usize>(),
            levels = levels.len(),
            mode = ?request.mode,
            cache = ?request.cache,
            "Starting run"
        );

        let resume = {
            let output_dir = request.output_dir.clone();
            let input_root = request.input_root.clone();
            let input_files = request.input_files.clone();
            let settings = Arc::clone(&self.settings);
            let force = request.cache == CacheMode::Force;
            blocking(move || {
                let mut resume = ResumeManager::load(&output_dir);
                if force {
                    if let Err(e) = resume.clear() {
                        warn!(error = %e, "Failed to clear resume state");
                    }
                }
                resume.update_input_hash(&input_root, &input_files)?;
                resume.update_config_hash(&*settings)?;
                Ok(resume)
            })
            .await?
        };
        tokio::fs::create_dir_all(&request.output_dir).await?;

        let mut lifecycle = self.lifecycle.clone();
        if let Some(timeout) = request.timeout {
            lifecycle.task_timeout = timeout;
        }
        let runner = TaskRunner {
            registry: Arc::clone(&self.registry),
            renderer: Arc::clone(&self.renderer),
            settings: Arc::clone(&self.settings),
            executor: LifecycleExecutor::new(
                Arc::clone(&self.worker),
                Arc::clone(&self.running),
                lifecycle,
                self.cancel.clone(),
            ),
            resume: Arc::new(Mutex::new(resume)),
            cache: request.cache,
            output_dir: Arc::new(request.output_dir.clone()),
            input_files: Arc::new(request.input_files.clone()),
        };

        let results = match request.mode {
            ExecutionMode::Sequential => self.run_sequential(&runner, &levels).await,
            ExecutionMode::Parallel => self.run_parallel(&runner, &levels).await,
        };

        self.shutdown().await;
        if let Err(e) = runner.with_resume(|resume| resume.save()).await {
            warn!(error = %e, "Failed to save resume state");
        }
        self.running.remove_snapshot();

        let summary = RunSummary::new(results, levels, self.cancel.is_cancelled(), started.elapsed());
        info!(
            success = summary.success,
            completed = summary.completed_count(),
            skipped = summary.skipped_count(),
            failed = summary.failed_count(),
            "Run finished"
        );
        Ok(summary)
    }

    async fn run_sequential(&self, runner: &TaskRunner<W, R>, levels: &[Vec<String>]) -> Vec<ExecutionResult> {
        let mut results = Vec::new();
        for name in levels.iter().flatten() {
            if self.cancel.is_cancelled() {
                info!("Run cancelled, not starting further tasks");
                break;
            }
            let result = runner.run_task(name).await;
            let failed = !result.is_success();
            results.push(result);
            if failed {
                warn!(task = %name, "Task failed, stopping run");
                break;
            }
        }
        results
    }

    async fn run_parallel(&self, runner: &TaskRunner<W, R>, levels: &[Vec<String>]) -> Vec<ExecutionResult> {
        let mut results = Vec::new();
        for (index, level) in levels.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Run cancelled, not starting further levels");
                break;
            }
            debug!(level = index, tasks = ?level, "Starting level");

            let handles = level.iter().map(|name| {
                let runner = runner.clone();
                let name = name.clone();
                tokio::spawn(async move { runner.run_task(&name).await })
            });
            let joined = join_all(handles).await;

            let mut level_failed = false;
            for (name, joined) in level.iter().zip(joined) {
                let result = joined.unwrap_or_else(|e| {
                    ExecutionResult::failed(
                        name,
                        runner.output_path(name),
                        TaskError::Aborted(e.to_string()),
                        Duration::ZERO,
                    )
                });
                level_failed |= !result.is_success();
                results.push(result);
            }
            if level_failed {
                warn!(level = index, "Level had failures, stopping run");
                break;
            }
        }
        results
    }

    /// Stop every worker still registered.
    ///
    /// Normally empty: each lifecycle cleans up after itself. Entries remain
    /// only when a task's future was dropped before its cleanup ran.
    async fn shutdown(&self) {
        for running in self.running.drain() {
            warn!(task = %running.name, port = running.port, "Stopping leftover worker");
            stop_worker(self.worker.as_ref(), &running).await;
        }
    }
}

/// Per-run state shared by every task of the run.
struct TaskRunner<W: WorkerBackend, R: PayloadRenderer> {
    registry: Arc<TaskRegistry>,
    renderer: Arc<R>,
    settings: Arc<toml::Table>,
    executor: LifecycleExecutor<W>,
    resume: Arc<Mutex<ResumeManager>>,
    cache: CacheMode,
    output_dir: Arc<PathBuf>,
    input_files: Arc<Vec<PathBuf>>,
}

impl<W: WorkerBackend, R: PayloadRenderer> Clone for TaskRunner<W, R> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            renderer: Arc::clone(&self.renderer),
            settings: Arc::clone(&self.settings),
            executor: self.executor.clone(),
            resume: Arc::clone(&self.resume),
            cache: self.cache,
            output_dir: Arc::clone(&self.output_dir),
            input_files: Arc::clone(&self.input_files),
        }
    }
}

impl<W: WorkerBackend, R: PayloadRenderer> TaskRunner<W, R> {
    /// Run `f` against the resume state on the blocking pool. Every call
    /// hashes or writes files.
    async fn with_resume<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ResumeManager) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let resume = Arc::clone(&self.resume);
        blocking(move || {
            let mut resume = resume.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut *resume)
        })
        .await
    }

    fn output_path(&self, name: &str) -> PathBuf {
        match self.registry.get(name) {
            Some(def) => def.output_path(&self.output_dir),
            None => self.output_dir.join(name),
        }
    }

    /// Cache check, render, lifecycle, record. Never fails; the outcome is
    /// in the returned result.
    async fn run_task(&self, name: &str) -> ExecutionResult {
        let started = Instant::now();
        let output_path = self.output_path(name);
        let def = match self.registry.require(name) {
            Ok(def) => def,
            Err(e) => {
                return ExecutionResult::failed(name, output_path, TaskError::Aborted(e.to_string()), Duration::ZERO);
            }
        };

        let decision = {
            let (task, path, deps) = (name.to_string(), output_path.clone(), def.depends_on.clone());
            self.with_resume(move |resume| Ok(resume.should_regenerate(&task, &path, &deps)))
                .await
        };
        let decision = match decision {
            Ok(decision) => decision,
            Err(e) => {
                return ExecutionResult::failed(name, output_path, TaskError::Aborted(e.to_string()), Duration::ZERO);
            }
        };
        let reason = decision.reason.to_string();
        if self.cache == CacheMode::Resume && !decision.regenerate {
            info!(task = name, "Skipping, output is up to date");
            return ExecutionResult::skipped(name, output_path, &reason);
        }
        info!(task = name, reason = %reason, "Running task");

        if let Some(parent) = output_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(task = name, error = %e, "Failed to create output directory");
            }
        }

        let dependency_outputs = def
            .depends_on
            .iter()
            .map(|dep| (dep.clone(), self.output_path(dep)))
            .collect();
        let ctx = RenderContext {
            task: def,
            output_dir: self.output_dir.as_path(),
            output_path: &output_path,
            input_files: &self.input_files,
            dependency_outputs,
            settings: &self.settings,
        };
        let payload = match self.renderer.render(&ctx) {
            Ok(payload) => payload,
            Err(e) => {
                let err = TaskError::Render(e.to_string());
                warn!(task = name, error = %err, "Task failed");
                return ExecutionResult::failed(name, output_path, err, started.elapsed()).with_reason(&reason);
            }
        };

        if let Err(err) = self.executor.execute(name, &output_path, &payload).await {
            return ExecutionResult::failed(name, output_path, err, started.elapsed()).with_reason(&reason);
        }

        self.record(name, &output_path, &def.depends_on).await;
        ExecutionResult::completed(name, output_path, started.elapsed()).with_reason(&reason)
    }

    /// Record and persist a successful output. Failures only cost a rerun
    /// next time, so they are logged.
    async fn record(&self, name: &str, output_path: &Path, dependencies: &[String]) {
        let (task, path, deps) = (name.to_string(), output_path.to_path_buf(), dependencies.to_vec());
        let recorded = self
            .with_resume(move |resume| {
                resume.record_output(&task, &path, &deps)?;
                resume.save()
            })
            .await;
        if let Err(e) = recorded {
            warn!(task = name, error = %e, "Failed to record task output");
        }
    }
}

/// Run blocking filesystem work off the async runtime.
async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}
