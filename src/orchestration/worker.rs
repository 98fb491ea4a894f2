//! Worker backend abstraction.
//!
//! The lifecycle executor talks to a `WorkerBackend` instead of a concrete
//! process. Production uses [`TmuxWorker`](super::TmuxWorker); tests plug in
//! scripted backends that never spawn anything.
//!
//! The protocol is deliberately small and poll based: spawn a worker bound
//! to a port, probe liveness, read a two-state busy/idle status (plus the
//! transient initializing state), dispatch one payload, and stop.

use futures::future::BoxFuture;

use crate::Result;

/// Status reported by a live worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    /// Started but not yet able to accept input.
    Initializing,
    /// Waiting for input.
    Idle,
    /// Working on a payload.
    Busy,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Initializing => write!(f, "initializing"),
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
        }
    }
}

/// Trait abstracting how a task's external worker is driven.
///
/// Every method returns a boxed `Send` future so lifecycles can run on
/// spawned tokio tasks during level-parallel execution.
pub trait WorkerBackend: Send + Sync + 'static {
    /// Opaque handle identifying one spawned worker.
    type Handle: Clone + Send + Sync + std::fmt::Debug + 'static;

    /// Start a worker for `task` bound to `port`.
    fn spawn<'a>(&'a self, task: &'a str, port: u16) -> BoxFuture<'a, Result<Self::Handle>>;

    /// Liveness probe. `Ok` means the worker process answers.
    fn health<'a>(&'a self, handle: &'a Self::Handle) -> BoxFuture<'a, Result<()>>;

    /// Current busy/idle status.
    fn status<'a>(&'a self, handle: &'a Self::Handle) -> BoxFuture<'a, Result<WorkerStatus>>;

    /// Send the rendered payload. Called exactly once per task.
    fn dispatch<'a>(&'a self, handle: &'a Self::Handle, payload: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Stop the worker and release its resources.
    fn stop<'a>(&'a self, handle: &'a Self::Handle) -> BoxFuture<'a, Result<()>>;
}
