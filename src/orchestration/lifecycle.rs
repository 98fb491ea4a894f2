//! Task lifecycle executor.
//!
//! Drives one task's worker through
//! `Spawning → HealthChecking → Stabilizing → Dispatching → Polling → Verifying`
//! and always cleans up afterwards, whichever phase ended the task.
//!
//! Every wait is a sleep-and-poll loop that also watches the run's
//! `CancellationToken`, so an interrupt ends the task within one poll.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::core::TaskPhase;
use crate::error::TaskError;
use crate::orchestration::worker::{WorkerBackend, WorkerStatus};
use crate::state::{RunningRegistry, RunningTask};

pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_STABILIZE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_CRASH_THRESHOLD: u32 = 30;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 1800;

/// Upper bound on a single `stop` call during cleanup.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single health, status or dispatch call. A status call
/// that exceeds it counts as a failed poll.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timing policy for a task lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// How long the worker may take to answer its liveness probe.
    pub health_timeout: Duration,
    pub health_interval: Duration,
    /// How long the worker may stay in its initializing state.
    pub stabilize_timeout: Duration,
    pub stabilize_interval: Duration,
    /// Interval between status polls while the task runs.
    pub poll_interval: Duration,
    /// Consecutive failed polls after which the worker counts as crashed.
    pub crash_threshold: u32,
    /// Overall time allowed for the task once dispatched. Zero polls forever.
    pub task_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(DEFAULT_HEALTH_TIMEOUT_SECS),
            health_interval: Duration::from_millis(500),
            stabilize_timeout: Duration::from_secs(DEFAULT_STABILIZE_TIMEOUT_SECS),
            stabilize_interval: Duration::from_millis(500),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            crash_threshold: DEFAULT_CRASH_THRESHOLD,
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
        }
    }
}

impl LifecycleConfig {
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }
}

/// Result of feeding one status poll into a [`CompletionTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Keep polling.
    Pending,
    /// The worker went busy and has returned to idle.
    Completed,
    /// Too many consecutive polls failed.
    Crashed { failures: u32 },
}

/// Completion detection state for the Polling phase.
///
/// A worker that answers idle before it was ever seen busy has not started
/// the task yet, so completion requires a busy observation first.
#[derive(Debug, Clone)]
pub struct CompletionTracker {
    observed_running: bool,
    consecutive_failures: u32,
    crash_threshold: u32,
}

impl CompletionTracker {
    pub fn new(crash_threshold: u32) -> Self {
        Self {
            observed_running: false,
            consecutive_failures: 0,
            crash_threshold: crash_threshold.max(1),
        }
    }

    pub fn observed_running(&self) -> bool {
        self.observed_running
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Feed one poll. `None` means the status request failed.
    pub fn observe(&mut self, status: Option<WorkerStatus>) -> PollOutcome {
        let Some(status) = status else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.crash_threshold {
                return PollOutcome::Crashed {
                    failures: self.consecutive_failures,
                };
            }
            return PollOutcome::Pending;
        };

        self.consecutive_failures = 0;
        match status {
            WorkerStatus::Busy => {
                self.observed_running = true;
                PollOutcome::Pending
            }
            WorkerStatus::Idle if self.observed_running => PollOutcome::Completed,
            WorkerStatus::Idle | WorkerStatus::Initializing => PollOutcome::Pending,
        }
    }
}

/// Runs task lifecycles against a worker backend.
///
/// Cheap to clone: clones share the backend, the running-task registry and
/// the cancellation token.
pub struct LifecycleExecutor<W: WorkerBackend> {
    worker: Arc<W>,
    running: Arc<RunningRegistry<W::Handle>>,
    config: LifecycleConfig,
    cancel: CancellationToken,
}

impl<W: WorkerBackend> Clone for LifecycleExecutor<W> {
    fn clone(&self) -> Self {
        Self {
            worker: Arc::clone(&self.worker),
            running: Arc::clone(&self.running),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<W: WorkerBackend> LifecycleExecutor<W> {
    pub fn new(
        worker: Arc<W>,
        running: Arc<RunningRegistry<W::Handle>>,
        config: LifecycleConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker,
            running,
            config,
            cancel,
        }
    }

    pub fn running(&self) -> &Arc<RunningRegistry<W::Handle>> {
        &self.running
    }

    /// Run one task to completion.
    ///
    /// On success the worker reported completion and `output_path` exists.
    /// The worker is stopped and unregistered before this returns, on every
    /// path past a successful spawn.
    pub async fn execute(&self, task: &str, output_path: &Path, payload: &str) -> Result<(), TaskError> {
        let mut phase = TaskPhase::Pending;
        let result = self.run_phases(task, output_path, payload, &mut phase).await;

        match &result {
            Ok(()) => {
                advance(task, &mut phase, TaskPhase::Completed);
                info!(task, "Task completed");
            }
            Err(e) => {
                let failed_in = phase;
                advance(task, &mut phase, TaskPhase::Failed);
                warn!(task, phase = %failed_in, error = %e, "Task failed");
            }
        }
        result
    }

    async fn run_phases(
        &self,
        task: &str,
        output_path: &Path,
        payload: &str,
        phase: &mut TaskPhase,
    ) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        advance(task, phase, TaskPhase::Spawning);
        let port = self
            .running
            .allocate_port()
            .map_err(|e| TaskError::Spawn(e.to_string()))?;
        let handle = self
            .worker
            .spawn(task, port)
            .await
            .map_err(|e| TaskError::Spawn(e.to_string()))?;
        self.running.add(RunningTask::new(task, port, handle.clone()));
        debug!(task, port, ?handle, "Worker spawned");

        let result = self.supervise(task, &handle, output_path, payload, phase).await;
        self.cleanup(task).await;
        result
    }

    async fn supervise(
        &self,
        task: &str,
        handle: &W::Handle,
        output_path: &Path,
        payload: &str,
        phase: &mut TaskPhase,
    ) -> Result<(), TaskError> {
        advance(task, phase, TaskPhase::HealthChecking);
        self.wait_healthy(handle).await?;

        advance(task, phase, TaskPhase::Stabilizing);
        self.wait_idle(handle).await?;

        advance(task, phase, TaskPhase::Dispatching);
        let dispatched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TaskError::Cancelled),
            dispatched = tokio::time::timeout(PROBE_TIMEOUT, self.worker.dispatch(handle, payload)) => dispatched,
        };
        match dispatched {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TaskError::Dispatch(e.to_string())),
            Err(_) => return Err(TaskError::Dispatch(format!("no answer after {:?}", PROBE_TIMEOUT))),
        }

        advance(task, phase, TaskPhase::Polling);
        self.wait_for_completion(task, handle).await?;

        advance(task, phase, TaskPhase::Verifying);
        if !output_path.exists() {
            return Err(TaskError::OutputMissing(output_path.to_path_buf()));
        }
        Ok(())
    }

    /// Poll the liveness probe until it answers.
    async fn wait_healthy(&self, handle: &W::Handle) -> Result<(), TaskError> {
        let timeout = self.config.health_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let healthy = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TaskError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(TaskError::HealthCheckTimeout(timeout)),
                probe = tokio::time::timeout(PROBE_TIMEOUT, self.worker.health(handle)) => {
                    matches!(probe, Ok(Ok(())))
                }
            };
            if healthy {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TaskError::HealthCheckTimeout(timeout));
            }
            self.sleep(self.config.health_interval).await?;
        }
    }

    /// Poll status until the worker leaves its initializing state.
    async fn wait_idle(&self, handle: &W::Handle) -> Result<(), TaskError> {
        let timeout = self.config.stabilize_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let status = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TaskError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(TaskError::StabilizeTimeout(timeout)),
                status = tokio::time::timeout(PROBE_TIMEOUT, self.worker.status(handle)) => {
                    status.ok().and_then(|s| s.ok())
                }
            };
            if status == Some(WorkerStatus::Idle) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TaskError::StabilizeTimeout(timeout));
            }
            self.sleep(self.config.stabilize_interval).await?;
        }
    }

    /// Poll status until the worker has gone busy and back to idle.
    async fn wait_for_completion(&self, task: &str, handle: &W::Handle) -> Result<(), TaskError> {
        let timeout = self.config.task_timeout;
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut tracker = CompletionTracker::new(self.config.crash_threshold);

        loop {
            let status = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TaskError::Cancelled),
                _ = until(deadline) => return Err(TaskError::PollTimeout(timeout)),
                status = tokio::time::timeout(PROBE_TIMEOUT, self.worker.status(handle)) => status,
            };
            let status = match status {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    debug!(task, error = %e, "Status poll failed");
                    None
                }
                Err(_) => {
                    debug!(task, "Status poll timed out");
                    None
                }
            };
            trace!(task, ?status, "Status poll");

            match tracker.observe(status) {
                PollOutcome::Completed => return Ok(()),
                PollOutcome::Crashed { failures } => {
                    return Err(TaskError::CrashDetected { failures });
                }
                PollOutcome::Pending => {}
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(TaskError::PollTimeout(timeout));
            }
            self.sleep(self.config.poll_interval).await?;
        }
    }

    /// Stop and unregister the task's worker.
    ///
    /// Removal from the registry decides ownership: if the coordinator
    /// already drained the entry during shutdown, it also stopped the
    /// worker, and this is a no-op.
    async fn cleanup(&self, task: &str) {
        let Some(running) = self.running.remove(task) else {
            debug!(task, "Worker already cleaned up");
            return;
        };
        stop_worker(self.worker.as_ref(), &running).await;
    }

    async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TaskError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Stop a worker with a bounded wait, logging rather than propagating
/// failures.
pub(crate) async fn stop_worker<W: WorkerBackend>(worker: &W, running: &RunningTask<W::Handle>) {
    match tokio::time::timeout(STOP_TIMEOUT, worker.stop(&running.handle)).await {
        Ok(Ok(())) => debug!(task = %running.name, port = running.port, "Worker stopped"),
        Ok(Err(e)) => warn!(task = %running.name, error = %e, "Failed to stop worker"),
        Err(_) => warn!(task = %running.name, "Timed out stopping worker"),
    }
}

/// Resolves at `deadline`, or never when there is none.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn advance(task: &str, phase: &mut TaskPhase, next: TaskPhase) {
    let from = *phase;
    match phase.transition(next) {
        Ok(()) => debug!(task, %from, to = %next, "Phase transition"),
        Err(e) => warn!(task, error = %e, "Ignoring phase transition"),
    }
}
