use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Task {task} depends on undeclared task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Task declared more than once: {0}")]
    DuplicateTask(String),

    #[error("Cyclic dependency among tasks: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Worker not available: {0}")]
    WorkerUnavailable(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error(transparent)]
    Task(#[from] TaskError),
}

impl Error {
    /// Configuration errors are fatal and surface before any task runs.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::UnknownTask(_)
                | Error::UnknownDependency { .. }
                | Error::DuplicateTask(_)
                | Error::CyclicDependency(_)
        )
    }
}

/// Why a single task ended in the Failed state.
///
/// These never abort the coordinator directly; they are carried inside the
/// task's `ExecutionResult` and the run policy decides what happens next.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("worker did not pass health check within {0:?}")]
    HealthCheckTimeout(Duration),

    #[error("worker did not become idle within {0:?}")]
    StabilizeTimeout(Duration),

    #[error("failed to render payload: {0}")]
    Render(String),

    #[error("failed to dispatch payload: {0}")]
    Dispatch(String),

    #[error("task did not complete within {0:?}")]
    PollTimeout(Duration),

    #[error("worker crashed: {failures} consecutive status polls failed")]
    CrashDetected { failures: u32 },

    #[error("worker reported done but produced nothing at {}", .0.display())]
    OutputMissing(PathBuf),

    #[error("cancelled")]
    Cancelled,

    #[error("task aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, Error>;
