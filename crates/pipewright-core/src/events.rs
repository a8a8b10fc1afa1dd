//! Run status events.
//!
//! Every state change a run goes through is published as an [`Event`] on the
//! event bus. Each event has a dotted subject used for routing and filtering.

use crate::ids::{InstanceKey, RunId};
use crate::run::{EventKind, FailureReason, InstanceStatus, RunStatus, StepStatus};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Run lifecycle
    RunQueued(RunQueuedPayload),
    RunStarted(RunStartedPayload),
    RunCompleted(RunCompletedPayload),
    RunCancelled(RunCancelledPayload),

    // Matrix
    MatrixExpanded(MatrixExpandedPayload),

    // Instance lifecycle
    InstanceStatusChanged(InstanceStatusPayload),

    // Step lifecycle
    StepStarted(StepStartedPayload),
    StepOutput(StepOutputPayload),
    StepCompleted(StepCompletedPayload),

    // Artifacts
    ArtifactSealed(ArtifactSealedPayload),
}

impl Event {
    /// Returns the subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::RunQueued(p) => format!("run.{}.queued", p.run_id),
            Event::RunStarted(p) => format!("run.{}.started", p.run_id),
            Event::RunCompleted(p) => format!("run.{}.completed", p.run_id),
            Event::RunCancelled(p) => format!("run.{}.cancelled", p.run_id),
            Event::MatrixExpanded(p) => format!("run.{}.matrix.{}.expanded", p.run_id, p.template),
            Event::InstanceStatusChanged(p) => {
                format!("run.{}.instance.{}.{}", p.run_id, p.instance, p.status)
            }
            Event::StepStarted(p) => {
                format!("run.{}.instance.{}.step.{}.started", p.run_id, p.instance, p.step)
            }
            Event::StepOutput(p) => {
                format!("run.{}.instance.{}.step.{}.output", p.run_id, p.instance, p.step)
            }
            Event::StepCompleted(p) => {
                format!("run.{}.instance.{}.step.{}.completed", p.run_id, p.instance, p.step)
            }
            Event::ArtifactSealed(p) => format!("run.{}.artifact.{}.sealed", p.run_id, p.name),
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Event::RunQueued(p) => p.run_id,
            Event::RunStarted(p) => p.run_id,
            Event::RunCompleted(p) => p.run_id,
            Event::RunCancelled(p) => p.run_id,
            Event::MatrixExpanded(p) => p.run_id,
            Event::InstanceStatusChanged(p) => p.run_id,
            Event::StepStarted(p) => p.run_id,
            Event::StepOutput(p) => p.run_id,
            Event::StepCompleted(p) => p.run_id,
            Event::ArtifactSealed(p) => p.run_id,
        }
    }
}

/// Match a subject against a pattern.
///
/// `*` matches exactly one token, a trailing `>` matches one or more tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunQueuedPayload {
    pub run_id: RunId,
    pub pipeline: String,
    pub event: EventKind,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub pipeline: String,
    pub instance_count: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub pipeline: String,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCancelledPayload {
    pub run_id: RunId,
    pub pipeline: String,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatrixExpandedPayload {
    pub run_id: RunId,
    pub template: String,
    pub instances: Vec<InstanceKey>,
    pub fail_fast: bool,
    pub max_parallel: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InstanceStatusPayload {
    pub run_id: RunId,
    pub instance: InstanceKey,
    pub template: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub reason: Option<FailureReason>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepStartedPayload {
    pub run_id: RunId,
    pub instance: InstanceKey,
    pub step: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepOutputPayload {
    pub run_id: RunId,
    pub instance: InstanceKey,
    pub step: String,
    pub stream: LogStream,
    pub line: String,
    pub line_number: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepCompletedPayload {
    pub run_id: RunId,
    pub instance: InstanceKey,
    pub step: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactSealedPayload {
    pub run_id: RunId,
    pub name: String,
    pub producer: InstanceKey,
    pub size_bytes: u64,
    pub checksum: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_wildcards() {
        assert!(subject_matches("run.*.completed", "run.run_1.completed"));
        assert!(!subject_matches("run.*.completed", "run.run_1.started"));
        assert!(subject_matches("run.>", "run.run_1.instance.build.running"));
        assert!(!subject_matches("run.>", "run"));
        assert!(subject_matches(">", "anything.at.all"));
        assert!(!subject_matches("run.*", "run.run_1.started"));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = Event::RunCancelled(RunCancelledPayload {
            run_id: RunId::new(),
            pipeline: "ci".to_string(),
            cancelled_at: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run_cancelled");
        assert!(event.subject().ends_with(".cancelled"));
    }
}
