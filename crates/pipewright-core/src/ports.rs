//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and the
//! collaborators it drives: step backends, artifact storage and status
//! consumers.

use crate::artifact::{Artifact, ArtifactMeta};
use crate::cancel::CancelSignal;
use crate::events::Event;
use crate::ids::{InstanceKey, RunId};
use crate::run::{InstanceOutcome, InstanceStatus, JobInstance, RunContext};
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to run status events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `run.*.completed`, `run.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Run-scoped, write-once artifact storage.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Seal a new artifact. Fails with `ArtifactConflict` if the name is
    /// already taken in this run.
    async fn put(
        &self,
        run_id: RunId,
        name: &str,
        payload: Vec<u8>,
        producer: &InstanceKey,
    ) -> Result<ArtifactMeta>;

    /// Fetch an artifact. Fails with `ArtifactNotFound` if absent.
    async fn get(&self, run_id: RunId, name: &str) -> Result<Artifact>;

    /// List the artifacts of a run, ordered by name.
    async fn list(&self, run_id: RunId) -> Result<Vec<ArtifactMeta>>;

    /// Drop every artifact of a run. Returns how many were removed.
    async fn purge_run(&self, run_id: RunId) -> Result<usize>;
}

/// A call to an external action.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub action_id: String,
    pub inputs: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub workdir: PathBuf,
    pub run_id: RunId,
    pub instance: InstanceKey,
}

impl ActionRequest {
    pub fn input(&self, name: &str) -> Option<&str> {
        self.inputs.get(name).map(String::as_str)
    }
}

/// What an external action reported back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    pub exit_code: i32,
    pub outputs: BTreeMap<String, String>,
    /// Artifacts the action sealed on behalf of the calling instance.
    pub artifacts: Vec<String>,
}

impl ActionOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Uniform invocation contract for external actions.
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    async fn invoke(&self, request: ActionRequest) -> Result<ActionOutcome>;
}

/// Everything an instance executor needs to know about the surrounding run.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    pub run_id: RunId,
    pub context: Arc<RunContext>,
    /// Aggregated status of each needed template.
    pub needs: BTreeMap<String, InstanceStatus>,
    /// Fires when the instance must stop.
    pub cancel: CancelSignal,
    /// Whether cancellation of the whole run has been requested.
    pub run_cancelled: CancelSignal,
}

/// Executes one job instance to completion.
#[async_trait]
pub trait InstanceExecutor: Send + Sync {
    async fn execute(&self, instance: &JobInstance, scope: ExecutionScope)
    -> Result<InstanceOutcome>;
}
