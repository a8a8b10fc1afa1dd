//! Pipeline scheduling and orchestration for Pipewright.

pub mod dag;
pub mod matrix;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod triggers;

pub use dag::{ExecutionGraph, GraphError, InstanceNode};
pub use matrix::{MatrixError, MatrixExpander, MatrixExpansion};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunHandle, lint_conditions};
pub use scheduler::{RunScheduler, SchedulerConfig};
pub use triggers::TriggerMatcher;
