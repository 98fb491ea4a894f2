//! Payload rendering.
//!
//! Turns a task definition plus run context into the single message sent to
//! the task's worker.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::core::TaskDefinition;
use crate::{Error, Result};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").unwrap());

const DEFAULT_TEMPLATE: &str = "\
You are working on the task `{{task}}`.
{{description}}
Input files:
{{inputs}}

Outputs of upstream tasks:
{{dependencies}}

Write your result to {{output}}. Stop once the file is written.
";

/// Everything a renderer may draw on for one task.
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub task: &'a TaskDefinition,
    pub output_dir: &'a Path,
    /// Resolved output path for this task.
    pub output_path: &'a Path,
    pub input_files: &'a [PathBuf],
    /// `(dependency name, resolved output path)` for each direct dependency.
    pub dependency_outputs: Vec<(String, PathBuf)>,
    pub settings: &'a toml::Table,
}

/// Produces the payload dispatched to a worker.
pub trait PayloadRenderer: Send + Sync + 'static {
    fn render(&self, ctx: &RenderContext<'_>) -> Result<String>;
}

/// Template renderer with `{{placeholder}}` substitution.
///
/// Known placeholders: `task`, `description`, `output`, `output_dir`,
/// `inputs`, `dependencies` and `setting.KEY`. Unknown placeholders are
/// left as written. Prompt paths are relative to `base_dir`.
#[derive(Debug, Clone)]
pub struct PromptRenderer {
    base_dir: PathBuf,
}

impl PromptRenderer {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn template(&self, task: &TaskDefinition) -> Result<String> {
        match &task.prompt {
            Some(prompt) => {
                let path = self.base_dir.join(prompt);
                fs::read_to_string(&path).map_err(|e| {
                    Error::Validation(format!("cannot read prompt {}: {}", path.display(), e))
                })
            }
            None => Ok(DEFAULT_TEMPLATE.to_string()),
        }
    }
}

impl PayloadRenderer for PromptRenderer {
    fn render(&self, ctx: &RenderContext<'_>) -> Result<String> {
        let template = self.template(ctx.task)?;
        Ok(substitute(&template, ctx))
    }
}

fn substitute(template: &str, ctx: &RenderContext<'_>) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures<'_>| {
            lookup(&caps[1], ctx).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn lookup(key: &str, ctx: &RenderContext<'_>) -> Option<String> {
    match key {
        "task" => Some(ctx.task.name.clone()),
        "description" => Some(ctx.task.description.clone().unwrap_or_default()),
        "output" => Some(ctx.output_path.display().to_string()),
        "output_dir" => Some(ctx.output_dir.display().to_string()),
        "inputs" => Some(bullet_list(ctx.input_files.iter().map(|p| p.display().to_string()))),
        "dependencies" => Some(bullet_list(
            ctx.dependency_outputs
                .iter()
                .map(|(name, path)| format!("{}: {}", name, path.display())),
        )),
        _ => {
            let setting = key.strip_prefix("setting.")?;
            ctx.settings.get(setting).map(|value| match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        }
    }
}

fn bullet_list(items: impl Iterator<Item = String>) -> String {
    let mut out = String::new();
    for item in items {
        let _ = writeln!(out, "- {}", item);
    }
    if out.is_empty() {
        out.push_str("(none)");
    } else {
        out.pop();
    }
    out
}
