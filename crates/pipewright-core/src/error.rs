//! Error types for Pipewright.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors, fatal to a run before anything executes
    #[error("Invalid pipeline configuration: {0}")]
    Configuration(String),

    #[error("Condition evaluation failed: {0}")]
    ConditionEvaluation(String),

    // Step errors
    #[error("Step failed with exit code {exit_code}: {message}")]
    StepFailed { exit_code: i32, message: String },

    #[error("Step timeout after {seconds} seconds")]
    StepTimeout { seconds: u64 },

    // Action errors
    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Action execution failed: {0}")]
    ActionFailed(String),

    // Artifact errors
    #[error("Artifact {name} already exists in run {run_id}")]
    ArtifactConflict { run_id: String, name: String },

    #[error("Artifact {name} not found in run {run_id}")]
    ArtifactNotFound { run_id: String, name: String },

    #[error("Cancelled")]
    Cancelled,

    // Infrastructure errors
    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error was caused by the pipeline definition itself.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
