//! Resume / incremental state.
//!
//! `ResumeManager` persists, per output directory, the hashes each task's
//! output was generated against. Before a task runs, [`ResumeManager::should_regenerate`]
//! compares the recorded state with the current inputs, configuration and
//! upstream outputs; the comparison itself is the pure function [`decide`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::state::hash::{hash_config, hash_file, hash_files};
use crate::{Error, Result};

pub const STATE_VERSION: u32 = 1;
pub const STATE_DIR: &str = ".conductor";
pub const STATE_FILE: &str = "state.json";

/// Persisted resume state for one output directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub version: u32,
    #[serde(default)]
    pub input_hash: String,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default)]
    pub task_outputs: BTreeMap<String, TaskOutputRecord>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for ResumeState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            input_hash: String::new(),
            config_hash: String::new(),
            task_outputs: BTreeMap::new(),
            updated_at: None,
        }
    }
}

/// What a task's output was generated against.
///
/// Only written after the task completed and its output was verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutputRecord {
    pub output_path: PathBuf,
    pub output_hash: String,
    pub input_hash_at_generation: String,
    pub config_hash_at_generation: String,
    /// Dependency name → that dependency's recorded output hash at the time.
    #[serde(default)]
    pub dependency_hashes: BTreeMap<String, String>,
    pub generated_at: DateTime<Utc>,
}

/// Why a task does or does not need to run again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegenerateReason {
    NoPreviousOutput,
    OutputMissing,
    OutputModified,
    InputsChanged,
    ConfigChanged,
    DependencyUnrecorded(String),
    DependencyChanged(String),
    UpToDate,
}

impl std::fmt::Display for RegenerateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegenerateReason::NoPreviousOutput => write!(f, "no previous output recorded"),
            RegenerateReason::OutputMissing => write!(f, "output file does not exist"),
            RegenerateReason::OutputModified => write!(f, "output file was modified externally"),
            RegenerateReason::InputsChanged => write!(f, "input files changed"),
            RegenerateReason::ConfigChanged => write!(f, "configuration changed"),
            RegenerateReason::DependencyUnrecorded(dep) => {
                write!(f, "dependency {} has no recorded output", dep)
            }
            RegenerateReason::DependencyChanged(dep) => {
                write!(f, "dependency {} output changed", dep)
            }
            RegenerateReason::UpToDate => write!(f, "up-to-date"),
        }
    }
}

/// Outcome of a cache check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub regenerate: bool,
    pub reason: RegenerateReason,
}

impl Decision {
    fn regenerate(reason: RegenerateReason) -> Self {
        Self {
            regenerate: true,
            reason,
        }
    }

    fn up_to_date() -> Self {
        Self {
            regenerate: false,
            reason: RegenerateReason::UpToDate,
        }
    }
}

/// Current observations for one task, gathered before deciding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentTaskState {
    /// Hash of the output file on disk, `None` when it does not exist.
    pub output_hash: Option<String>,
    pub input_hash: String,
    pub config_hash: String,
    /// Each dependency with its currently recorded output hash, if any.
    pub dependency_hashes: Vec<(String, Option<String>)>,
}

/// Decide whether a task must regenerate.
///
/// Checks run in a fixed order and the first mismatch wins: record present,
/// output present, output unchanged, inputs, configuration, then each
/// dependency in the given order.
pub fn decide(current: &CurrentTaskState, recorded: Option<&TaskOutputRecord>) -> Decision {
    let Some(record) = recorded else {
        return Decision::regenerate(RegenerateReason::NoPreviousOutput);
    };

    let Some(output_hash) = current.output_hash.as_deref() else {
        return Decision::regenerate(RegenerateReason::OutputMissing);
    };
    if output_hash != record.output_hash {
        return Decision::regenerate(RegenerateReason::OutputModified);
    }
    if current.input_hash != record.input_hash_at_generation {
        return Decision::regenerate(RegenerateReason::InputsChanged);
    }
    if current.config_hash != record.config_hash_at_generation {
        return Decision::regenerate(RegenerateReason::ConfigChanged);
    }

    for (dep, dep_hash) in &current.dependency_hashes {
        let Some(dep_hash) = dep_hash else {
            return Decision::regenerate(RegenerateReason::DependencyUnrecorded(dep.clone()));
        };
        if record.dependency_hashes.get(dep) != Some(dep_hash) {
            return Decision::regenerate(RegenerateReason::DependencyChanged(dep.clone()));
        }
    }

    Decision::up_to_date()
}

/// Loads, consults, updates and persists the resume state of one output
/// directory.
#[derive(Debug)]
pub struct ResumeManager {
    path: PathBuf,
    state: ResumeState,
}

impl ResumeManager {
    /// Location of the state file for an output directory.
    pub fn state_path(output_dir: &Path) -> PathBuf {
        output_dir.join(STATE_DIR).join(STATE_FILE)
    }

    /// Load the persisted state for `output_dir`.
    ///
    /// A missing, unreadable or corrupt state file, or one written with a
    /// different `version`, is logged and treated as empty state, which
    /// degrades to regenerating everything.
    pub fn load(output_dir: &Path) -> Self {
        let path = Self::state_path(output_dir);
        let state = match Self::read_state(&path) {
            Ok(Some(state)) => {
                debug!(
                    path = %path.display(),
                    tasks = state.task_outputs.len(),
                    "Resume state loaded"
                );
                state
            }
            Ok(None) => {
                debug!(path = %path.display(), "No resume state, starting empty");
                ResumeState::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Resume state unreadable, starting empty");
                ResumeState::default()
            }
        };
        Self { path, state }
    }

    /// Start from empty state without reading anything from disk.
    pub fn empty(output_dir: &Path) -> Self {
        Self {
            path: Self::state_path(output_dir),
            state: ResumeState::default(),
        }
    }

    fn read_state(path: &Path) -> Result<Option<ResumeState>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        let state: ResumeState = serde_json::from_str(&contents)?;
        if state.version != STATE_VERSION {
            return Err(Error::Validation(format!(
                "state version {} is not supported (expected {})",
                state.version, STATE_VERSION
            )));
        }
        Ok(Some(state))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &ResumeState {
        &self.state
    }

    pub fn record(&self, task: &str) -> Option<&TaskOutputRecord> {
        self.state.task_outputs.get(task)
    }

    /// Persist the state atomically (write temp file, then rename).
    pub fn save(&mut self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        self.state.updated_at = Some(Utc::now());
        let contents = serde_json::to_string_pretty(&self.state)?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, &self.path)?;
        debug!(path = %self.path.display(), "Resume state saved");
        Ok(())
    }

    /// Reset in-memory state and delete the persisted file.
    pub fn clear(&mut self) -> Result<()> {
        self.state = ResumeState::default();
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        info!(path = %self.path.display(), "Resume state cleared");
        Ok(())
    }

    /// Hash the run's input files (relative path and content, sorted).
    pub fn update_input_hash<P: AsRef<Path>>(&mut self, root: &Path, files: &[P]) -> Result<()> {
        self.state.input_hash = hash_files(root, files)?;
        Ok(())
    }

    /// Hash the persona/preferences/stack configuration.
    pub fn update_config_hash<T: Serialize + ?Sized>(&mut self, config: &T) -> Result<()> {
        self.state.config_hash = hash_config(config)?;
        Ok(())
    }

    /// Record a freshly produced output.
    ///
    /// Stores the output hash with the current input/config hashes and a
    /// snapshot of each dependency's currently recorded output hash.
    /// Dependencies without a record are left out of the snapshot.
    ///
    /// # Errors
    /// Returns an IO error if the output file cannot be hashed.
    pub fn record_output<S: AsRef<str>>(
        &mut self,
        task: &str,
        output_path: &Path,
        dependencies: &[S],
    ) -> Result<()> {
        let output_hash = hash_file(output_path)?;
        let dependency_hashes = dependencies
            .iter()
            .filter_map(|dep| {
                let dep = dep.as_ref();
                self.state
                    .task_outputs
                    .get(dep)
                    .map(|record| (dep.to_string(), record.output_hash.clone()))
            })
            .collect();

        let record = TaskOutputRecord {
            output_path: output_path.to_path_buf(),
            output_hash,
            input_hash_at_generation: self.state.input_hash.clone(),
            config_hash_at_generation: self.state.config_hash.clone(),
            dependency_hashes,
            generated_at: Utc::now(),
        };
        debug!(task, hash = %record.output_hash, "Recorded task output");
        self.state.task_outputs.insert(task.to_string(), record);
        Ok(())
    }

    /// Observe the current state of a task's output and dependencies.
    pub fn current_state<S: AsRef<str>>(&self, output_path: &Path, dependencies: &[S]) -> CurrentTaskState {
        let output_hash = if output_path.exists() {
            match hash_file(output_path) {
                Ok(hash) => Some(hash),
                Err(e) => {
                    warn!(path = %output_path.display(), error = %e, "Output unreadable");
                    None
                }
            }
        } else {
            None
        };

        CurrentTaskState {
            output_hash,
            input_hash: self.state.input_hash.clone(),
            config_hash: self.state.config_hash.clone(),
            dependency_hashes: dependencies
                .iter()
                .map(|dep| {
                    let dep = dep.as_ref();
                    let hash = self.record(dep).map(|r| r.output_hash.clone());
                    (dep.to_string(), hash)
                })
                .collect(),
        }
    }

    /// Whether `task` must run again, and why.
    pub fn should_regenerate<S: AsRef<str>>(
        &self,
        task: &str,
        output_path: &Path,
        dependencies: &[S],
    ) -> Decision {
        let current = self.current_state(output_path, dependencies);
        let decision = decide(&current, self.record(task));
        debug!(task, regenerate = decision.regenerate, reason = %decision.reason, "Cache decision");
        decision
    }
}
