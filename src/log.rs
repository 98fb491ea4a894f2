//! Structured logging for debugging conductor.
//!
//! Log levels:
//! - ERROR: Failures that abort a run
//! - WARN: Unexpected conditions that are recoverable (corrupt cache, failed stop)
//! - INFO: Run and task lifecycle milestones
//! - DEBUG: Phase transitions and cache decisions
//! - TRACE: Individual status polls
//!
//! Debug mode can be enabled with `--debug` flag or `CONDUCTOR_DEBUG=1` env var.
//! `CONDUCTOR_LOG` takes a full `EnvFilter` directive and wins over both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

pub const LOG_ENV: &str = "CONDUCTOR_LOG";
pub const DEBUG_ENV: &str = "CONDUCTOR_DEBUG";

/// Initialize logging to ~/.conductor/conductor.log, with debug output when
/// `debug` is set or `CONDUCTOR_DEBUG` is truthy.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var(DEBUG_ENV)
        .map(|v| is_truthy(&v))
        .unwrap_or(false);

    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive(debug_enabled)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false);

    // Keep stdout clean for the run summary: log to file, fall back to stderr.
    let result = match open_log_file() {
        Some(file) => builder.with_writer(Mutex::new(file)).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    // A subscriber may already be installed (tests, embedding applications).
    let _ = result;
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the log file, once logging has been initialized.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

fn open_log_file() -> Option<File> {
    let dir = dirs::home_dir()?.join(".conductor");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("conductor.log");
    // Truncate file on startup
    let file = File::create(&path).ok()?;
    LOG_PATH.set(path).ok();
    Some(file)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "conductor=debug,info"
    } else {
        "conductor=info,warn"
    }
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
