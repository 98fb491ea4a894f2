//! Task registry: the immutable name → definition map for a run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::core::dag::TaskDag;
use crate::core::task::TaskDefinition;
use crate::error::{Error, Result};

/// Immutable registry of task definitions.
///
/// Construction validates that names are unique, that every declared
/// dependency names a registered task, and that the relation is acyclic.
/// A registry that exists is therefore always schedulable.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, TaskDefinition>,
    /// Declaration order, kept for listing.
    order: Vec<String>,
}

impl TaskRegistry {
    /// Build a registry from definitions.
    ///
    /// # Errors
    /// Returns a configuration error on duplicate names, dependencies on
    /// undeclared tasks, or dependency cycles.
    pub fn new(definitions: Vec<TaskDefinition>) -> Result<Self> {
        let mut tasks = BTreeMap::new();
        let mut order = Vec::with_capacity(definitions.len());

        for def in definitions {
            if def.name.trim().is_empty() {
                return Err(Error::Validation("task name cannot be empty".to_string()));
            }
            if tasks.contains_key(&def.name) {
                return Err(Error::DuplicateTask(def.name));
            }
            order.push(def.name.clone());
            tasks.insert(def.name.clone(), def);
        }

        for def in tasks.values() {
            for dep in &def.depends_on {
                if !tasks.contains_key(dep) {
                    return Err(Error::UnknownDependency {
                        task: def.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let registry = Self { tasks, order };
        TaskDag::new(&registry).check_acyclic()?;
        debug!(tasks = registry.len(), "TaskRegistry validated");
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.get(name)
    }

    /// Look up a task, treating an unknown name as a configuration error.
    pub fn require(&self, name: &str) -> Result<&TaskDefinition> {
        self.get(name)
            .ok_or_else(|| Error::UnknownTask(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Task names in declaration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn definitions(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.order.iter().filter_map(|name| self.tasks.get(name))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// On-disk pipeline file.
///
/// ```toml
/// [settings]
/// persona = "staff engineer"
///
/// [[task]]
/// name = "architect"
/// output = "architecture.md"
/// prompt = "prompts/architect.md"
///
/// [[task]]
/// name = "qa"
/// output = "qa.md"
/// depends_on = ["architect"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineFile {
    /// Persona, preferences and stack settings. Hashed into the config hash.
    #[serde(default)]
    pub settings: toml::Table,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskDefinition>,
}

/// A validated pipeline: registry plus settings.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub registry: TaskRegistry,
    pub settings: toml::Table,
}

impl Pipeline {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: PipelineFile = toml::from_str(contents)?;
        Ok(Self {
            registry: TaskRegistry::new(file.tasks)?,
            settings: file.settings,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Pipeline::load");
        Self::from_toml_str(&fs::read_to_string(path)?)
    }
}
