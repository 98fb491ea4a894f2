//! Orchestration layer: worker backends, task lifecycles and runs.
//!
//! [`RunCoordinator`] executes a task set level by level, driving each task
//! through a [`LifecycleExecutor`] against a [`WorkerBackend`].

pub mod coordinator;
pub mod detection;
pub mod lifecycle;
pub mod render;
mod tmux_worker;
pub mod worker;

pub use coordinator::{CacheMode, ExecutionMode, RunCoordinator, RunRequest, RunSummary};
pub use detection::StatusPatterns;
pub use lifecycle::{CompletionTracker, LifecycleConfig, LifecycleExecutor, PollOutcome};
pub use render::{PayloadRenderer, PromptRenderer, RenderContext};
pub use tmux_worker::{TmuxHandle, TmuxWorker};
pub use worker::{WorkerBackend, WorkerStatus};
