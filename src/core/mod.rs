//! Core domain models: task definitions, the registry and the DAG.

pub mod dag;
pub mod registry;
pub mod task;

pub use dag::TaskDag;
pub use registry::{Pipeline, PipelineFile, TaskRegistry};
pub use task::{ExecutionResult, TaskDefinition, TaskPhase};
