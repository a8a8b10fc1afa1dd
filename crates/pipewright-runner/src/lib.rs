//! Step execution engine for Pipewright.
//!
//! A [`StepRunner`] executes the ordered steps of one job instance, routing
//! each step to the first [`StepExecutor`] that can handle it: the
//! [`ShellExecutor`] for `run:` steps and the [`ActionStepExecutor`] for
//! `action:` steps.

pub mod actions;
pub mod artifacts;
pub mod runner;
pub mod shell;
pub mod steps;

pub use actions::{Action, ActionRegistry, ActionStepExecutor};
pub use artifacts::{DownloadArtifact, UploadArtifact};
pub use runner::{OutputLine, OutputStream, RunnerConfig, StepContext, StepExecutor, StepResult};
pub use shell::ShellExecutor;
pub use steps::StepRunner;
