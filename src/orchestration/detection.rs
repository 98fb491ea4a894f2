//! Worker status detection from terminal output.
//!
//! Terminal-hosted workers have no status endpoint, so their state is read
//! off the last lines of the pane:
//! - **Busy**: the busy pattern appears (e.g. an "esc to interrupt" hint)
//! - **Idle**: the idle pattern appears near the bottom (an empty input prompt)
//! - **Initializing**: neither, typically a banner or loading screen
//!
//! ## Example
//!
//! ```
//! use conductor::orchestration::detection::StatusPatterns;
//! use conductor::orchestration::WorkerStatus;
//!
//! let patterns = StatusPatterns::default();
//! assert_eq!(patterns.classify("Welcome!\n\n> \n"), WorkerStatus::Idle);
//! assert_eq!(patterns.classify("✻ Working… (esc to interrupt)\n> \n"), WorkerStatus::Busy);
//! assert_eq!(patterns.classify("Loading..."), WorkerStatus::Initializing);
//! ```

use regex::Regex;
use std::sync::LazyLock;

use crate::config::{DEFAULT_BUSY_PATTERN, DEFAULT_IDLE_PATTERN};
use crate::orchestration::worker::WorkerStatus;
use crate::{Error, Result};

/// Number of trailing non-empty lines considered for the idle prompt.
const IDLE_WINDOW: usize = 4;

/// Number of trailing non-empty lines considered for the busy marker.
const BUSY_WINDOW: usize = 12;

static DEFAULT_IDLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DEFAULT_IDLE_PATTERN).unwrap());

static DEFAULT_BUSY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DEFAULT_BUSY_PATTERN).unwrap());

/// Compiled idle/busy patterns.
#[derive(Debug, Clone)]
pub struct StatusPatterns {
    idle: Regex,
    busy: Regex,
}

impl Default for StatusPatterns {
    fn default() -> Self {
        Self {
            idle: DEFAULT_IDLE_RE.clone(),
            busy: DEFAULT_BUSY_RE.clone(),
        }
    }
}

impl StatusPatterns {
    /// Compile user-supplied patterns.
    ///
    /// # Errors
    /// Returns a validation error naming the pattern that failed to compile.
    pub fn new(idle: &str, busy: &str) -> Result<Self> {
        let idle = Regex::new(idle)
            .map_err(|e| Error::Validation(format!("invalid idle pattern: {}", e)))?;
        let busy = Regex::new(busy)
            .map_err(|e| Error::Validation(format!("invalid busy pattern: {}", e)))?;
        Ok(Self { idle, busy })
    }

    /// Classify captured pane output.
    ///
    /// Busy wins over idle: most agent UIs keep drawing the input box while
    /// they work.
    pub fn classify(&self, pane: &str) -> WorkerStatus {
        let lines: Vec<&str> = pane.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            return WorkerStatus::Initializing;
        }

        let busy_tail = tail(&lines, BUSY_WINDOW);
        if self.busy.is_match(&busy_tail) {
            return WorkerStatus::Busy;
        }

        // Keep the trailing newline so `$`-anchored prompt patterns match
        // on the final line.
        let idle_tail = tail(&lines, IDLE_WINDOW);
        if self.idle.is_match(&idle_tail) {
            return WorkerStatus::Idle;
        }

        WorkerStatus::Initializing
    }
}

fn tail(lines: &[&str], n: usize) -> String {
    let start = lines.len().saturating_sub(n);
    let mut out = lines[start..].join("\n");
    out.push('\n');
    out
}
