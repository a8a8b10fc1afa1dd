//! Core step executor trait and types.

use async_trait::async_trait;
use pipewright_core::Result;
use pipewright_core::cancel::CancelSignal;
use pipewright_core::events::LogStream;
use pipewright_core::pipeline::StepDefinition;
use pipewright_core::{InstanceKey, RunId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl From<OutputStream> for LogStream {
    fn from(stream: OutputStream) -> Self {
        match stream {
            OutputStream::Stdout => LogStream::Stdout,
            OutputStream::Stderr => LogStream::Stderr,
        }
    }
}

/// Result of step execution.
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: u64,
    pub outputs: BTreeMap<String, String>,
    /// Artifacts sealed by the step.
    pub artifacts: Vec<String>,
}

/// Context for step execution. The step definition has already been
/// interpolated.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub instance: InstanceKey,
    pub workspace: PathBuf,
    pub variables: BTreeMap<String, String>,
    pub step: StepDefinition,
    pub timeout: Option<Duration>,
}

/// Trait for step execution.
///
/// Implementations stop early with `Error::StepTimeout` when the step's
/// timeout elapses and with `Error::Cancelled` when `cancel` fires.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Execute a step, streaming output to the provided channel.
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
        cancel: CancelSignal,
    ) -> Result<StepResult>;

    /// Check if this executor can handle the given step.
    fn can_handle(&self, step: &StepDefinition) -> bool;
}

/// Configuration for step execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory job and step working directories are resolved against.
    pub workspace: PathBuf,
    /// Applied to steps that do not set `timeout_minutes`.
    pub default_step_timeout: Option<Duration>,
    /// Capacity of the per-step output channel.
    pub output_buffer: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            default_step_timeout: Some(Duration::from_secs(30 * 60)),
            output_buffer: 256,
        }
    }
}
