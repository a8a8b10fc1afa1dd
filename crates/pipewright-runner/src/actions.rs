//! Action registry and `action:` step execution.

use crate::runner::{OutputLine, StepContext, StepExecutor, StepResult};
use async_trait::async_trait;
use dashmap::DashMap;
use pipewright_core::cancel::CancelSignal;
use pipewright_core::pipeline::StepDefinition;
use pipewright_core::ports::{ActionInvoker, ActionOutcome, ActionRequest, ArtifactStore, EventBus};
use pipewright_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A named operation a step can call with `action: <name>[@version]`.
#[async_trait]
pub trait Action: Send + Sync {
    /// Get the action name.
    fn name(&self) -> &str;

    /// Run the action.
    async fn run(&self, request: &ActionRequest) -> Result<ActionOutcome>;
}

/// Actions keyed by name. Version suffixes are ignored on lookup.
#[derive(Default)]
pub struct ActionRegistry {
    actions: DashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `artifact/upload` and `artifact/download`
    /// actions.
    pub fn with_builtins(store: Arc<dyn ArtifactStore>, event_bus: Arc<dyn EventBus>) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(crate::artifacts::UploadArtifact::new(
            store.clone(),
            event_bus,
        )));
        registry.register(Arc::new(crate::artifacts::DownloadArtifact::new(store)));
        registry
    }

    pub fn register(&self, action: Arc<dyn Action>) {
        debug!(action = %action.name(), "Registering action");
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn get(&self, action_id: &str) -> Option<Arc<dyn Action>> {
        self.actions
            .get(base_name(action_id))
            .map(|entry| entry.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ActionInvoker for ActionRegistry {
    async fn invoke(&self, request: ActionRequest) -> Result<ActionOutcome> {
        let action = self
            .get(&request.action_id)
            .ok_or_else(|| Error::ActionNotFound(request.action_id.clone()))?;
        info!(action = %request.action_id, instance = %request.instance, "Invoking action");
        action.run(&request).await
    }
}

/// `artifact/upload@v1` resolves to `artifact/upload`.
fn base_name(action_id: &str) -> &str {
    action_id.split_once('@').map_or(action_id, |(name, _)| name)
}

/// Routes `action:` steps through an [`ActionInvoker`].
pub struct ActionStepExecutor {
    invoker: Arc<dyn ActionInvoker>,
}

impl ActionStepExecutor {
    pub fn new(invoker: Arc<dyn ActionInvoker>) -> Self {
        Self { invoker }
    }

    fn request(ctx: &StepContext, action_id: &str) -> ActionRequest {
        let inputs: BTreeMap<String, String> = ctx
            .step
            .with
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect();

        let workdir = match &ctx.step.working_directory {
            Some(dir) => ctx.workspace.join(dir),
            None => ctx.workspace.clone(),
        };

        ActionRequest {
            action_id: action_id.to_string(),
            inputs,
            env: ctx.variables.clone(),
            workdir,
            run_id: ctx.run_id,
            instance: ctx.instance.clone(),
        }
    }
}

#[async_trait]
impl StepExecutor for ActionStepExecutor {
    async fn execute(
        &self,
        ctx: &StepContext,
        _output_tx: mpsc::Sender<OutputLine>,
        cancel: CancelSignal,
    ) -> Result<StepResult> {
        let action_id = ctx
            .step
            .action
            .as_deref()
            .ok_or_else(|| Error::Internal("No action to invoke".to_string()))?;
        let request = Self::request(ctx, action_id);
        let start = std::time::Instant::now();

        let deadline = async {
            match ctx.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            outcome = self.invoker.invoke(request) => outcome?,
            _ = deadline => {
                return Err(Error::StepTimeout {
                    seconds: ctx.timeout.map(|t| t.as_secs()).unwrap_or_default(),
                });
            }
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        Ok(StepResult {
            exit_code: outcome.exit_code,
            success: outcome.is_success(),
            duration_ms: start.elapsed().as_millis() as u64,
            outputs: outcome.outputs,
            artifacts: outcome.artifacts,
        })
    }

    fn can_handle(&self, step: &StepDefinition) -> bool {
        step.action.is_some()
    }
}
