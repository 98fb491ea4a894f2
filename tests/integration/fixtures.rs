//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted in-memory worker backend with per-task behaviour
//! - Predefined task sets (A/B/C chain, five-task pipeline)
//! - A harness wiring a coordinator to a temporary output directory

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tempfile::TempDir;

use conductor::core::{TaskDefinition, TaskRegistry};
use conductor::orchestration::{
    LifecycleConfig, PromptRenderer, RunCoordinator, RunRequest, WorkerBackend, WorkerStatus,
};
use conductor::{Error, Result};

/// How a scripted worker behaves for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Idle, then busy, then idle; writes its output when dispatched.
    Succeed,
    /// Goes busy and back to idle without writing anything.
    NoOutput,
    /// Status polls start failing once busy.
    Crash,
    /// Spawn fails.
    SpawnFail,
    /// Busy forever.
    Hang,
}

/// Something the worker was asked to do, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Spawned(String),
    Dispatched(String),
    Stopped(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedHandle {
    pub task: String,
    pub port: u16,
}

/// In-memory worker backend. Never starts a process.
pub struct ScriptedWorker {
    outputs: HashMap<String, PathBuf>,
    behaviors: Mutex<HashMap<String, Behavior>>,
    statuses: Mutex<HashMap<u16, VecDeque<Option<WorkerStatus>>>>,
    events: Mutex<Vec<WorkerEvent>>,
    payloads: Mutex<HashMap<String, String>>,
    dispatch_count: AtomicUsize,
    alive: AtomicUsize,
    max_alive: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new(registry: &TaskRegistry, output_dir: &Path) -> Self {
        let outputs = registry
            .definitions()
            .map(|def| (def.name.clone(), def.output_path(output_dir)))
            .collect();
        Self {
            outputs,
            behaviors: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            payloads: Mutex::new(HashMap::new()),
            dispatch_count: AtomicUsize::new(0),
            alive: AtomicUsize::new(0),
            max_alive: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, task: &str, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(task.to_string(), behavior);
    }

    fn behavior(&self, task: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(task)
            .copied()
            .unwrap_or(Behavior::Succeed)
    }

    pub fn events(&self) -> Vec<WorkerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Tasks spawned, in spawn order.
    pub fn spawned(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::Spawned(task) => Some(task),
                _ => None,
            })
            .collect()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::Stopped(task) => Some(task),
                _ => None,
            })
            .collect()
    }

    pub fn position(&self, event: &WorkerEvent) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub fn payload(&self, task: &str) -> Option<String> {
        self.payloads.lock().unwrap().get(task).cloned()
    }

    /// Highest number of workers alive at the same time.
    pub fn max_alive(&self) -> usize {
        self.max_alive.load(Ordering::SeqCst)
    }

    fn script(behavior: Behavior) -> VecDeque<Option<WorkerStatus>> {
        use WorkerStatus::{Busy, Idle};
        match behavior {
            Behavior::Succeed | Behavior::NoOutput => VecDeque::from([Some(Idle), Some(Busy), Some(Idle)]),
            Behavior::Crash => VecDeque::from([Some(Idle), Some(Busy), None]),
            Behavior::Hang => VecDeque::from([Some(Idle), Some(Busy)]),
            Behavior::SpawnFail => VecDeque::new(),
        }
    }

    fn record(&self, event: WorkerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl WorkerBackend for ScriptedWorker {
    type Handle = ScriptedHandle;

    fn spawn<'a>(&'a self, task: &'a str, port: u16) -> BoxFuture<'a, Result<ScriptedHandle>> {
        async move {
            let behavior = self.behavior(task);
            if behavior == Behavior::SpawnFail {
                return Err(Error::WorkerUnavailable(format!("cannot start {}", task)));
            }
            self.statuses.lock().unwrap().insert(port, Self::script(behavior));
            self.record(WorkerEvent::Spawned(task.to_string()));
            let alive = self.alive.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_alive.fetch_max(alive, Ordering::SeqCst);
            Ok(ScriptedHandle {
                task: task.to_string(),
                port,
            })
        }
        .boxed()
    }

    fn health<'a>(&'a self, _handle: &'a ScriptedHandle) -> BoxFuture<'a, Result<()>> {
        async { Ok(()) }.boxed()
    }

    fn status<'a>(&'a self, handle: &'a ScriptedHandle) -> BoxFuture<'a, Result<WorkerStatus>> {
        async move {
            let next = {
                let mut statuses = self.statuses.lock().unwrap();
                let queue = statuses.entry(handle.port).or_default();
                if queue.len() > 1 {
                    queue.pop_front().flatten()
                } else {
                    queue.front().copied().flatten()
                }
            };
            next.ok_or_else(|| Error::WorkerUnavailable(format!("{} stopped answering", handle.task)))
        }
        .boxed()
    }

    fn dispatch<'a>(&'a self, handle: &'a ScriptedHandle, payload: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let run = self.dispatch_count.fetch_add(1, Ordering::SeqCst);
            self.record(WorkerEvent::Dispatched(handle.task.clone()));
            self.payloads
                .lock()
                .unwrap()
                .insert(handle.task.clone(), payload.to_string());

            if self.behavior(&handle.task) == Behavior::Succeed {
                if let Some(path) = self.outputs.get(&handle.task) {
                    std::fs::write(path, format!("# {}\n\ndispatch {}\n", handle.task, run))?;
                }
            }
            Ok(())
        }
        .boxed()
    }

    fn stop<'a>(&'a self, handle: &'a ScriptedHandle) -> BoxFuture<'a, Result<()>> {
        async move {
            self.record(WorkerEvent::Stopped(handle.task.clone()));
            self.alive.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }
}

/// Quick polling so paused-clock tests advance in few steps.
pub fn fast_lifecycle() -> LifecycleConfig {
    LifecycleConfig {
        health_timeout: Duration::from_secs(5),
        health_interval: Duration::from_millis(10),
        stabilize_timeout: Duration::from_secs(5),
        stabilize_interval: Duration::from_millis(10),
        poll_interval: Duration::from_millis(100),
        crash_threshold: 3,
        task_timeout: Duration::from_secs(600),
    }
}

/// A -> B -> C, with C also depending on A directly
pub fn abc_tasks() -> Vec<TaskDefinition> {
    vec![
        TaskDefinition::new("A", "a.md"),
        TaskDefinition::new("B", "b.md").with_dependencies(&["A"]),
        TaskDefinition::new("C", "c.md").with_dependencies(&["A", "B"]),
    ]
}

/// architect -> {qa, security} -> implementer -> verifier
pub fn pipeline_tasks() -> Vec<TaskDefinition> {
    vec![
        TaskDefinition::new("architect", "docs/architecture.md"),
        TaskDefinition::new("qa", "docs/qa.md").with_dependencies(&["architect"]),
        TaskDefinition::new("security", "docs/security.md").with_dependencies(&["architect"]),
        TaskDefinition::new("implementer", "docs/implementation.md")
            .with_dependencies(&["qa", "security"]),
        TaskDefinition::new("verifier", "docs/verification.md").with_dependencies(&["implementer"]),
    ]
}

/// A coordinator over a scripted worker writing into a temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub output_dir: PathBuf,
    pub coordinator: RunCoordinator<ScriptedWorker, PromptRenderer>,
}

impl Harness {
    pub fn new(tasks: Vec<TaskDefinition>) -> Self {
        Self::with_settings(tasks, toml::Table::new())
    }

    pub fn with_settings(tasks: Vec<TaskDefinition>, settings: toml::Table) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        Self::in_dir(dir, tasks, settings)
    }

    /// Build a fresh coordinator over an existing directory, keeping any
    /// outputs and resume state already there.
    pub fn in_dir(dir: TempDir, tasks: Vec<TaskDefinition>, settings: toml::Table) -> Self {
        let output_dir = dir.path().join("output");
        let registry = TaskRegistry::new(tasks).expect("valid task set");
        let worker = ScriptedWorker::new(&registry, &output_dir);
        let coordinator = RunCoordinator::new(registry, worker, PromptRenderer::new(dir.path()))
            .with_settings(settings)
            .with_lifecycle(fast_lifecycle());
        Self {
            dir,
            output_dir,
            coordinator,
        }
    }

    pub fn worker(&self) -> &ScriptedWorker {
        self.coordinator.worker()
    }

    pub fn request(&self) -> RunRequest {
        RunRequest::new(&self.output_dir).with_inputs(self.dir.path(), Vec::new())
    }

    pub fn output(&self, task: &str) -> PathBuf {
        self.coordinator
            .registry()
            .require(task)
            .expect("known task")
            .output_path(&self.output_dir)
    }

    /// Write a file under the harness directory and return its relative path.
    pub fn write_input(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create input dir");
        }
        std::fs::write(&path, contents).expect("Failed to write input");
        PathBuf::from(name)
    }
}

pub fn names(results: &[conductor::core::ExecutionResult]) -> Vec<&str> {
    results.iter().map(|r| r.task.as_str()).collect()
}
