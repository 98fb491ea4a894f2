use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::orchestration::lifecycle::{self, LifecycleConfig};
use crate::{Error, Result};

pub const DEFAULT_COMMAND: &str = "claude";
pub const DEFAULT_BASE_PORT: u16 = 4100;
/// Claude's input box renders as `> ` on an otherwise empty line.
pub const DEFAULT_IDLE_PATTERN: &str = r"(?m)^\s*[│|]?\s*>\s*[│|]?\s*$";
pub const DEFAULT_BUSY_PATTERN: &str = r"(?i)esc to interrupt";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Worker command. `{port}` is replaced with the allocated port.
    pub command: Option<String>,
    pub base_port: Option<u16>,
    pub idle_pattern: Option<String>,
    pub busy_pattern: Option<String>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub health_secs: u64,
    pub stabilize_secs: u64,
    pub poll_interval_ms: u64,
    pub crash_threshold: u32,
    /// Overall per-task timeout; 0 polls indefinitely.
    pub task_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            health_secs: lifecycle::DEFAULT_HEALTH_TIMEOUT_SECS,
            stabilize_secs: lifecycle::DEFAULT_STABILIZE_TIMEOUT_SECS,
            poll_interval_ms: lifecycle::DEFAULT_POLL_INTERVAL_MS,
            crash_threshold: lifecycle::DEFAULT_CRASH_THRESHOLD,
            task_secs: lifecycle::DEFAULT_TASK_TIMEOUT_SECS,
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or(DEFAULT_COMMAND)
    }

    pub fn effective_base_port(&self) -> u16 {
        self.base_port.unwrap_or(DEFAULT_BASE_PORT)
    }

    pub fn effective_idle_pattern(&self) -> &str {
        self.idle_pattern.as_deref().unwrap_or(DEFAULT_IDLE_PATTERN)
    }

    pub fn effective_busy_pattern(&self) -> &str {
        self.busy_pattern.as_deref().unwrap_or(DEFAULT_BUSY_PATTERN)
    }

    /// Lifecycle timing derived from the `[timeouts]` table.
    pub fn lifecycle(&self) -> LifecycleConfig {
        let t = &self.timeouts;
        LifecycleConfig {
            health_timeout: Duration::from_secs(t.health_secs),
            stabilize_timeout: Duration::from_secs(t.stabilize_secs),
            poll_interval: Duration::from_millis(t.poll_interval_ms.max(1)),
            crash_threshold: t.crash_threshold.max(1),
            task_timeout: Duration::from_secs(t.task_secs),
            ..LifecycleConfig::default()
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        debug!(
            command = ?config.command,
            base_port = ?config.base_port,
            "Config loaded"
        );
        Ok(config)
    }
}
