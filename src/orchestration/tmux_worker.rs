//! Worker backend hosting each worker in its own tmux session.
//!
//! The worker command runs in a detached session named
//! `conductor_<task>_<port>`. Liveness is "session exists and the pane
//! command has not exited"; busy/idle status is read off the pane with
//! [`StatusPatterns`]; the payload is pasted into the pane.

use std::path::PathBuf;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Config;
use crate::orchestration::detection::StatusPatterns;
use crate::orchestration::worker::{WorkerBackend, WorkerStatus};
use crate::tmux::Tmux;
use crate::{Error, Result};

/// Bound on any single tmux invocation.
const TMUX_TIMEOUT: Duration = Duration::from_secs(10);

/// Pane lines captured per status poll.
const CAPTURE_LINES: u16 = 40;

/// Handle to a worker running in tmux.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxHandle {
    pub session: String,
    pub port: u16,
}

pub struct TmuxWorker {
    command: String,
    cwd: PathBuf,
    patterns: StatusPatterns,
}

impl TmuxWorker {
    /// `command` may contain `{port}`, replaced with the allocated port.
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>, patterns: StatusPatterns) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            patterns,
        }
    }

    /// Build from user configuration, compiling its status patterns.
    ///
    /// # Errors
    /// Fails when tmux is not installed or a pattern does not compile.
    pub fn from_config(config: &Config, cwd: impl Into<PathBuf>) -> Result<Self> {
        if !Tmux::is_available() {
            return Err(Error::WorkerUnavailable("tmux not found in PATH".to_string()));
        }
        let patterns = StatusPatterns::new(config.effective_idle_pattern(), config.effective_busy_pattern())?;
        Ok(Self::new(config.effective_command(), cwd, patterns))
    }

    pub fn command_for(&self, port: u16) -> String {
        self.command.replace("{port}", &port.to_string())
    }
}

impl WorkerBackend for TmuxWorker {
    type Handle = TmuxHandle;

    fn spawn<'a>(&'a self, task: &'a str, port: u16) -> BoxFuture<'a, Result<TmuxHandle>> {
        let session = Tmux::session_name(task, port);
        let cmd = self.command_for(port);
        let cwd = self.cwd.clone();
        let task = task.to_string();
        async move {
            debug!(task = %task, %session, port, "TmuxWorker::spawn");
            let name = session.clone();
            blocking_with_timeout(TMUX_TIMEOUT, move || {
                if Tmux::session_exists(&name) {
                    // Leftover from a killed run that reused the same port.
                    Tmux::kill_session(&name)?;
                }
                let env = [
                    ("CONDUCTOR_PORT", port.to_string()),
                    ("CONDUCTOR_TASK", task),
                ];
                Tmux::create_session(&name, &cwd, &cmd, &env)
            })
            .await?;
            Ok(TmuxHandle { session, port })
        }
        .boxed()
    }

    fn health<'a>(&'a self, handle: &'a TmuxHandle) -> BoxFuture<'a, Result<()>> {
        let session = handle.session.clone();
        async move {
            blocking_with_timeout(TMUX_TIMEOUT, move || {
                if !Tmux::session_exists(&session) {
                    return Err(Error::WorkerUnavailable(format!("session {} not found", session)));
                }
                if Tmux::pane_dead(&session)? {
                    return Err(Error::WorkerUnavailable(format!("worker in {} exited", session)));
                }
                Ok(())
            })
            .await
        }
        .boxed()
    }

    fn status<'a>(&'a self, handle: &'a TmuxHandle) -> BoxFuture<'a, Result<WorkerStatus>> {
        let session = handle.session.clone();
        async move {
            let pane = blocking_with_timeout(TMUX_TIMEOUT, move || {
                if Tmux::pane_dead(&session)? {
                    return Err(Error::WorkerUnavailable(format!("worker in {} exited", session)));
                }
                Tmux::capture_pane_tail(&session, CAPTURE_LINES)
            })
            .await?;
            Ok(self.patterns.classify(&pane))
        }
        .boxed()
    }

    fn dispatch<'a>(&'a self, handle: &'a TmuxHandle, payload: &'a str) -> BoxFuture<'a, Result<()>> {
        let session = handle.session.clone();
        let payload = payload.to_string();
        async move {
            debug!(%session, bytes = payload.len(), "TmuxWorker::dispatch");
            let name = session.clone();
            blocking_with_timeout(TMUX_TIMEOUT, move || Tmux::paste_text(&name, &payload)).await?;
            // Let the TUI finish handling the paste before submitting.
            tokio::time::sleep(Duration::from_millis(200)).await;
            blocking_with_timeout(TMUX_TIMEOUT, move || Tmux::send_enter(&session)).await
        }
        .boxed()
    }

    fn stop<'a>(&'a self, handle: &'a TmuxHandle) -> BoxFuture<'a, Result<()>> {
        let session = handle.session.clone();
        async move { blocking_with_timeout(TMUX_TIMEOUT, move || Tmux::kill_session(&session)).await }.boxed()
    }
}

/// Run a blocking tmux call off the runtime with an upper bound.
async fn blocking_with_timeout<F, T>(duration: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match timeout(duration, spawn_blocking(f)).await {
        Ok(Ok(inner)) => inner,
        Ok(Err(join_err)) => Err(Error::TaskJoin(join_err.to_string())),
        Err(_) => Err(Error::Timeout(duration)),
    }
}
