//! Registry of tasks whose workers are currently alive.
//!
//! The registry is the only state touched by several task threads at once,
//! so every access goes through one mutex. The same mutex guards the port
//! counter. Each change also rewrites a JSON snapshot in the temp directory
//! so a separate `conductor status` invocation can see an in-flight run.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Error, Result};

/// A task whose worker has been spawned and not yet cleaned up.
#[derive(Debug, Clone)]
pub struct RunningTask<H> {
    pub name: String,
    pub port: u16,
    pub handle: H,
    pub started_at: DateTime<Utc>,
}

impl<H> RunningTask<H> {
    pub fn new(name: &str, port: u16, handle: H) -> Self {
        Self {
            name: name.to_string(),
            port,
            handle,
            started_at: Utc::now(),
        }
    }

    fn info(&self) -> RunningTaskInfo {
        RunningTaskInfo {
            name: self.name.clone(),
            port: self.port,
            started_at: self.started_at,
        }
    }
}

/// Serializable view of a running task, as written to the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTaskInfo {
    pub name: String,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

/// Snapshot file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningSnapshot {
    pub run_id: Uuid,
    pub pid: u32,
    pub updated_at: DateTime<Utc>,
    pub tasks: Vec<RunningTaskInfo>,
}

impl RunningSnapshot {
    /// Read the snapshot written by an in-flight run.
    ///
    /// Returns `Ok(None)` when no run has written one.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }
}

/// Default snapshot location: `<temp_dir>/conductor/running.json`.
pub fn default_snapshot_path() -> PathBuf {
    std::env::temp_dir().join("conductor").join("running.json")
}

struct Inner<H> {
    tasks: BTreeMap<String, RunningTask<H>>,
    next_port: Option<u16>,
}

/// Mutex-guarded registry of running tasks plus the port counter.
pub struct RunningRegistry<H> {
    inner: Mutex<Inner<H>>,
    snapshot_path: Option<PathBuf>,
    run_id: Uuid,
}

impl<H: Clone> RunningRegistry<H> {
    /// Create a registry whose port counter starts at `base_port`.
    ///
    /// With `snapshot_path` set, every add/remove rewrites that file.
    pub fn new(base_port: u16, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: BTreeMap::new(),
                next_port: Some(base_port),
            }),
            snapshot_path,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Allocate the next port.
    ///
    /// Ports are handed out monotonically and never reused within a run. No
    /// check is made that the OS port is actually free; a port in use
    /// surfaces as a spawn failure.
    ///
    /// # Errors
    /// Returns a validation error once the u16 range is exhausted.
    pub fn allocate_port(&self) -> Result<u16> {
        let mut inner = self.lock();
        let port = inner
            .next_port
            .ok_or_else(|| Error::Validation("port range exhausted".to_string()))?;
        inner.next_port = port.checked_add(1);
        Ok(port)
    }

    /// Register a running task, replacing any entry with the same name.
    pub fn add(&self, task: RunningTask<H>) {
        let mut inner = self.lock();
        debug!(task = %task.name, port = task.port, "RunningRegistry::add");
        inner.tasks.insert(task.name.clone(), task);
        self.write_snapshot(&inner);
    }

    /// Remove a task. Returns `None` if it was not registered.
    pub fn remove(&self, name: &str) -> Option<RunningTask<H>> {
        let mut inner = self.lock();
        let removed = inner.tasks.remove(name);
        if removed.is_some() {
            debug!(task = name, "RunningRegistry::remove");
            self.write_snapshot(&inner);
        }
        removed
    }

    /// Copy of every registered task, sorted by name.
    pub fn list(&self) -> Vec<RunningTask<H>> {
        self.lock().tasks.values().cloned().collect()
    }

    /// Remove and return every registered task.
    pub fn drain(&self) -> Vec<RunningTask<H>> {
        let mut inner = self.lock();
        let drained: Vec<_> = std::mem::take(&mut inner.tasks).into_values().collect();
        if !drained.is_empty() {
            self.write_snapshot(&inner);
        }
        drained
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().tasks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tasks.is_empty()
    }

    /// Delete the snapshot file, if this registry writes one.
    pub fn remove_snapshot(&self) {
        if let Some(path) = &self.snapshot_path {
            if path.exists() {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove running snapshot");
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<H>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_snapshot(&self, inner: &Inner<H>) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let snapshot = RunningSnapshot {
            run_id: self.run_id,
            pid: std::process::id(),
            updated_at: Utc::now(),
            tasks: inner.tasks.values().map(RunningTask::info).collect(),
        };
        if let Err(e) = write_atomic(path, &snapshot) {
            warn!(path = %path.display(), error = %e, "Failed to write running snapshot");
        }
    }
}

fn write_atomic(path: &Path, snapshot: &RunningSnapshot) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, serde_json::to_string_pretty(snapshot)?)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}
