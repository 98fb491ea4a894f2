//! Task data model for the pipeline DAG.
//!
//! A task is one node in the dependency graph. It wraps exactly one external
//! worker invocation and produces exactly one artifact.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result, TaskError};

/// Static definition of a task, as declared in the pipeline file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique task name.
    pub name: String,
    /// Output artifact path, relative to the run's output directory.
    pub output: PathBuf,
    /// Names of tasks whose outputs this task consumes.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Prompt template used by the default payload renderer.
    #[serde(default)]
    pub prompt: Option<PathBuf>,
    #[serde(default)]
    pub description: Option<String>,
}

impl TaskDefinition {
    pub fn new(name: &str, output: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            output: output.into(),
            depends_on: Vec::new(),
            prompt: None,
            description: None,
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<PathBuf>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Absolute output location for a run writing into `output_dir`.
    pub fn output_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.output)
    }
}

/// Lifecycle phase of a single task within a run.
///
/// ```text
/// Pending -> Spawning -> HealthChecking -> Stabilizing -> Dispatching
///         -> Polling -> Verifying -> Completed
/// ```
///
/// `Failed` is reachable from every non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Pending,
    Spawning,
    HealthChecking,
    Stabilizing,
    Dispatching,
    Polling,
    Verifying,
    Completed,
    Failed,
}

impl Default for TaskPhase {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Completed | TaskPhase::Failed)
    }

    /// The phase that follows this one on the success path.
    pub fn next(&self) -> Option<TaskPhase> {
        match self {
            TaskPhase::Pending => Some(TaskPhase::Spawning),
            TaskPhase::Spawning => Some(TaskPhase::HealthChecking),
            TaskPhase::HealthChecking => Some(TaskPhase::Stabilizing),
            TaskPhase::Stabilizing => Some(TaskPhase::Dispatching),
            TaskPhase::Dispatching => Some(TaskPhase::Polling),
            TaskPhase::Polling => Some(TaskPhase::Verifying),
            TaskPhase::Verifying => Some(TaskPhase::Completed),
            TaskPhase::Completed | TaskPhase::Failed => None,
        }
    }

    pub fn can_transition_to(&self, to: TaskPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == TaskPhase::Failed || self.next() == Some(to)
    }

    /// Validate and perform a transition.
    ///
    /// # Errors
    /// Returns `InvalidPhaseTransition` if `to` is not reachable from `self`.
    pub fn transition(&mut self, to: TaskPhase) -> Result<()> {
        if !self.can_transition_to(to) {
            return Err(Error::InvalidPhaseTransition {
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        *self = to;
        Ok(())
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPhase::Pending => "pending",
            TaskPhase::Spawning => "spawning",
            TaskPhase::HealthChecking => "health_checking",
            TaskPhase::Stabilizing => "stabilizing",
            TaskPhase::Dispatching => "dispatching",
            TaskPhase::Polling => "polling",
            TaskPhase::Verifying => "verifying",
            TaskPhase::Completed => "completed",
            TaskPhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one task in one run.
///
/// Produced exactly once per task and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub task: String,
    pub output_path: PathBuf,
    pub error: Option<TaskError>,
    pub duration: Duration,
    /// True when the cache layer judged the prior output up to date.
    pub skipped: bool,
    /// Cache decision reason, when one was consulted.
    pub reason: Option<String>,
}

impl ExecutionResult {
    pub fn completed(task: &str, output_path: PathBuf, duration: Duration) -> Self {
        Self {
            task: task.to_string(),
            output_path,
            error: None,
            duration,
            skipped: false,
            reason: None,
        }
    }

    pub fn skipped(task: &str, output_path: PathBuf, reason: &str) -> Self {
        Self {
            task: task.to_string(),
            output_path,
            error: None,
            duration: Duration::ZERO,
            skipped: true,
            reason: Some(reason.to_string()),
        }
    }

    pub fn failed(task: &str, output_path: PathBuf, error: TaskError, duration: Duration) -> Self {
        Self {
            task: task.to_string(),
            output_path,
            error: Some(error),
            duration,
            skipped: false,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.error, self.skipped) {
            (Some(err), _) => write!(f, "{}: failed after {:.1?}: {}", self.task, self.duration, err),
            (None, true) => write!(
                f,
                "{}: skipped ({})",
                self.task,
                self.reason.as_deref().unwrap_or("up-to-date")
            ),
            (None, false) => write!(
                f,
                "{}: completed in {:.1?} -> {}",
                self.task,
                self.duration,
                self.output_path.display()
            ),
        }
    }
}
