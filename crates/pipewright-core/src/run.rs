//! Run, job instance and status types.

use crate::ids::{InstanceKey, RunId};
use crate::pipeline::JobDefinition;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Kind of event that created a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(EventKind::Push),
            "pull_request" | "pr" => Ok(EventKind::PullRequest),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// Immutable snapshot of the trigger that created a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunContext {
    pub event: EventKind,
    /// Full ref, e.g. `refs/heads/main`.
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub head_ref: Option<String>,
    #[serde(default)]
    pub base_ref: Option<String>,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
}

impl RunContext {
    pub fn push(git_ref: impl Into<String>) -> Self {
        Self {
            event: EventKind::Push,
            git_ref: qualify_branch(git_ref.into()),
            head_ref: None,
            base_ref: None,
            sha: None,
            actor: None,
        }
    }

    pub fn pull_request(head_ref: impl Into<String>, base_ref: impl Into<String>) -> Self {
        let head_ref = head_ref.into();
        Self {
            event: EventKind::PullRequest,
            git_ref: qualify_branch(head_ref.clone()),
            head_ref: Some(short_branch(&head_ref).to_string()),
            base_ref: Some(short_branch(&base_ref.into()).to_string()),
            sha: None,
            actor: None,
        }
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Short name of the ref: `refs/heads/main` becomes `main`.
    pub fn branch(&self) -> &str {
        short_branch(&self.git_ref)
    }

    /// Branch trigger filters match against: the base branch of a pull
    /// request, the pushed branch otherwise.
    pub fn filter_branch(&self) -> &str {
        match (self.event, &self.base_ref) {
            (EventKind::PullRequest, Some(base)) => base,
            _ => self.branch(),
        }
    }
}

fn qualify_branch(name: String) -> String {
    if name.starts_with("refs/") {
        name
    } else {
        format!("refs/heads/{name}")
    }
}

fn short_branch(name: &str) -> &str {
    name.strip_prefix("refs/heads/")
        .or_else(|| name.strip_prefix("refs/tags/"))
        .unwrap_or(name)
}

/// One concrete assignment of matrix axis values, in axis order.
///
/// Equality ignores order: two assignments are equal when they bind the same
/// axes to the same values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct MatrixAssignment(IndexMap<String, serde_json::Value>);

impl MatrixAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, axis: impl Into<String>, value: serde_json::Value) {
        self.0.insert(axis.into(), value);
    }

    pub fn get(&self, axis: &str) -> Option<&serde_json::Value> {
        self.0.get(axis)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every entry of `partial` is bound to the same value here.
    pub fn contains_all(&self, partial: &IndexMap<String, serde_json::Value>) -> bool {
        partial
            .iter()
            .all(|(axis, value)| self.0.get(axis) == Some(value))
    }

    /// Instance key for a template expanded with this assignment.
    pub fn instance_key(&self, template: &str) -> InstanceKey {
        if self.0.is_empty() {
            return InstanceKey::new(template);
        }
        InstanceKey::new(format!("{template}[{}]", self.describe()))
    }

    /// `os=linux, toolchain=stable`
    pub fn describe(&self) -> String {
        self.0
            .iter()
            .map(|(axis, value)| format!("{axis}={}", display_value(value)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Values rendered as plain strings, for environments and interpolation.
    pub fn to_strings(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(axis, value)| (axis.clone(), display_value(value)))
            .collect()
    }
}

impl From<IndexMap<String, serde_json::Value>> for MatrixAssignment {
    fn from(map: IndexMap<String, serde_json::Value>) -> Self {
        Self(map)
    }
}

/// Render a matrix value without JSON quoting for strings.
pub fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Status of a job instance.
///
/// `Blocked` → `Pending` → `Running` → {`Succeeded`, `Failed`, `Cancelled`}.
/// `Skipped` is reachable only before dispatch; `Cancelled` from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Blocked,
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Succeeded
                | InstanceStatus::Failed
                | InstanceStatus::Skipped
                | InstanceStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Blocked, Pending | Skipped | Cancelled)
                | (Pending, Running | Skipped | Cancelled)
                | (Running, Succeeded | Failed | Cancelled)
        )
    }

    /// Result word exposed to expressions as `needs.<job>.result`.
    pub fn result_str(&self) -> &'static str {
        match self {
            InstanceStatus::Succeeded => "success",
            InstanceStatus::Failed => "failure",
            InstanceStatus::Skipped => "skipped",
            InstanceStatus::Cancelled => "cancelled",
            InstanceStatus::Blocked | InstanceStatus::Pending | InstanceStatus::Running => {
                "pending"
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Blocked => "blocked",
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Succeeded => "succeeded",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Skipped => "skipped",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn result_str(&self) -> &'static str {
        match self {
            StepStatus::Succeeded => "success",
            StepStatus::Failed => "failure",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
            StepStatus::Pending | StepStatus::Running => "pending",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Terminal status of a run from the terminal statuses of its instances.
    pub fn from_instances<'a>(statuses: impl IntoIterator<Item = &'a InstanceStatus>) -> Self {
        let mut failed = false;
        let mut cancelled = false;
        for status in statuses {
            match status {
                InstanceStatus::Failed => failed = true,
                InstanceStatus::Succeeded | InstanceStatus::Skipped => {}
                _ => cancelled = true,
            }
        }
        if failed {
            RunStatus::Failed
        } else if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why an instance or step did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    StepFailed {
        step: String,
        exit_code: Option<i32>,
    },
    Timeout,
    ArtifactConflict {
        name: String,
    },
    ActionError {
        message: String,
    },
    /// A dependency did not succeed and the guard required it to.
    DependencyNotSatisfied,
    ConditionFalse,
    /// Cancelled because a sibling or another job failed first.
    FailFast,
    RunCancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StepFailed {
                step,
                exit_code: Some(code),
            } => write!(f, "step {step} exited with code {code}"),
            FailureReason::StepFailed {
                step,
                exit_code: None,
            } => write!(f, "step {step} failed"),
            FailureReason::Timeout => f.write_str("timed out"),
            FailureReason::ArtifactConflict { name } => {
                write!(f, "artifact {name} was already published")
            }
            FailureReason::ActionError { message } => write!(f, "action error: {message}"),
            FailureReason::DependencyNotSatisfied => f.write_str("dependency did not succeed"),
            FailureReason::ConditionFalse => f.write_str("condition not met"),
            FailureReason::FailFast => f.write_str("cancelled by fail-fast"),
            FailureReason::RunCancelled => f.write_str("run cancelled"),
        }
    }
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepOutcome {
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub reason: Option<FailureReason>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub continue_on_error: bool,
    pub duration_ms: u64,
}

impl StepOutcome {
    pub fn skipped(name: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Skipped,
            exit_code: None,
            reason: Some(reason),
            outputs: BTreeMap::new(),
            continue_on_error: false,
            duration_ms: 0,
        }
    }

    /// A failed step that does not fail its instance.
    pub fn is_tolerated_failure(&self) -> bool {
        self.status == StepStatus::Failed && self.continue_on_error
    }
}

/// Result of executing one job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InstanceOutcome {
    pub status: InstanceStatus,
    #[serde(default)]
    pub reason: Option<FailureReason>,
    #[serde(default)]
    pub steps: Vec<StepOutcome>,
    /// Names of artifacts sealed by this instance.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl InstanceOutcome {
    pub fn succeeded(steps: Vec<StepOutcome>) -> Self {
        Self {
            status: InstanceStatus::Succeeded,
            reason: None,
            steps,
            artifacts: vec![],
        }
    }

    pub fn failed(reason: FailureReason, steps: Vec<StepOutcome>) -> Self {
        Self {
            status: InstanceStatus::Failed,
            reason: Some(reason),
            steps,
            artifacts: vec![],
        }
    }

    pub fn cancelled(reason: FailureReason, steps: Vec<StepOutcome>) -> Self {
        Self {
            status: InstanceStatus::Cancelled,
            reason: Some(reason),
            steps,
            artifacts: vec![],
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// One concrete execution unit: a template bound to one matrix assignment.
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub key: InstanceKey,
    pub template: String,
    /// Position in the template's expansion.
    pub index: usize,
    pub display_name: String,
    pub matrix: MatrixAssignment,
    pub definition: Arc<JobDefinition>,
    /// Pipeline variables overlaid with the job's own.
    pub variables: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

/// Final state of one instance, as reported at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InstanceReport {
    pub key: InstanceKey,
    pub template: String,
    pub display_name: String,
    pub matrix: MatrixAssignment,
    pub status: InstanceStatus,
    #[serde(default)]
    pub reason: Option<FailureReason>,
    #[serde(default)]
    pub steps: Vec<StepOutcome>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    pub context: RunContext,
    pub status: RunStatus,
    pub instances: Vec<InstanceReport>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn instance(&self, key: &str) -> Option<&InstanceReport> {
        self.instances.iter().find(|i| i.key.as_str() == key)
    }

    pub fn instances_of<'a>(&'a self, template: &'a str) -> impl Iterator<Item = &'a InstanceReport> {
        self.instances.iter().filter(move |i| i.template == template)
    }

    pub fn count(&self, status: InstanceStatus) -> usize {
        self.instances.iter().filter(|i| i.status == status).count()
    }
}
