//! Persistent and in-flight run state.
//!
//! - [`ResumeManager`]: content-hash resume state under the output directory
//! - [`RunningRegistry`]: workers alive right now, mirrored to a snapshot file

pub mod hash;
mod resume;
mod running;

pub use resume::{
    decide, CurrentTaskState, Decision, RegenerateReason, ResumeManager, ResumeState,
    TaskOutputRecord, STATE_DIR, STATE_FILE, STATE_VERSION,
};
pub use running::{
    default_snapshot_path, RunningRegistry, RunningSnapshot, RunningTask, RunningTaskInfo,
};
