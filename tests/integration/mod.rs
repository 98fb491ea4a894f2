//! Integration test suite for conductor.
//!
//! These tests drive full runs through the coordinator against a scripted
//! in-memory worker, so no tmux or agent process is needed.
//!
//! # Test Categories
//!
//! - `pipeline_e2e`: Sequential and level-parallel execution, fail-fast
//! - `resume`: Content-hash resume and regeneration reasons
//! - `cancellation`: Ctrl-C style cancellation, timeouts, crash detection
//! - `scheduler_props`: Property tests for dependency levels

mod fixtures;

mod pipeline_e2e;
mod resume;
mod scheduler_props;
