//! Sequential step execution for one job instance.

use crate::actions::ActionStepExecutor;
use crate::runner::{OutputLine, RunnerConfig, StepContext, StepExecutor, StepResult};
use crate::shell::ShellExecutor;
use async_trait::async_trait;
use chrono::Utc;
use pipewright_core::events::{
    Event, StepCompletedPayload, StepOutputPayload, StepStartedPayload,
};
use pipewright_core::expression::{ExpressionContext, StatusScope, condition_passes};
use pipewright_core::interpolation::{interpolate, interpolate_map};
use pipewright_core::pipeline::StepDefinition;
use pipewright_core::ports::{ActionInvoker, EventBus, ExecutionScope, InstanceExecutor};
use pipewright_core::run::{
    FailureReason, InstanceOutcome, JobInstance, StepOutcome, StepStatus,
};
use pipewright_core::{Error, InstanceKey, Result, RunId};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Runs a job instance's steps in order, dispatching each to the first
/// executor that can handle it.
pub struct StepRunner {
    config: RunnerConfig,
    executors: Vec<Arc<dyn StepExecutor>>,
    event_bus: Arc<dyn EventBus>,
}

impl StepRunner {
    pub fn new(
        config: RunnerConfig,
        invoker: Arc<dyn ActionInvoker>,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        let executors: Vec<Arc<dyn StepExecutor>> = vec![
            Arc::new(ShellExecutor::new(config.clone())),
            Arc::new(ActionStepExecutor::new(invoker)),
        ];
        Self {
            config,
            executors,
            event_bus,
        }
    }

    /// Register an executor ahead of the built-in ones.
    pub fn with_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executors.insert(0, executor);
        self
    }

    fn executor_for(&self, step: &StepDefinition) -> Option<&Arc<dyn StepExecutor>> {
        self.executors.iter().find(|e| e.can_handle(step))
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.event_bus.publish(event).await {
            warn!(error = %e, "Failed to publish step event");
        }
    }

    /// Variables every step of the instance sees.
    fn base_env(instance: &JobInstance, scope: &ExecutionScope) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("CI".to_string(), "true".to_string());
        env.insert("PIPEWRIGHT_RUN_ID".to_string(), scope.run_id.to_string());
        env.insert("PIPEWRIGHT_JOB".to_string(), instance.template.clone());
        env.insert("PIPEWRIGHT_INSTANCE".to_string(), instance.key.to_string());
        env.insert("PIPEWRIGHT_EVENT".to_string(), scope.context.event.to_string());
        env.insert("PIPEWRIGHT_REF".to_string(), scope.context.git_ref.clone());
        if let Some(sha) = &scope.context.sha {
            env.insert("PIPEWRIGHT_SHA".to_string(), sha.clone());
        }
        env.extend(instance.variables.clone());
        env
    }

    fn stop_reason(scope: &ExecutionScope) -> FailureReason {
        if scope.run_cancelled.is_cancelled() {
            FailureReason::RunCancelled
        } else {
            FailureReason::FailFast
        }
    }

    async fn run_step(
        &self,
        instance: &JobInstance,
        scope: &ExecutionScope,
        workspace: &Path,
        step: StepDefinition,
        variables: BTreeMap<String, String>,
    ) -> (StepOutcome, Vec<String>) {
        let name = step.name.clone();
        let continue_on_error = step.continue_on_error;

        let Some(executor) = self.executor_for(&step).cloned() else {
            let outcome = StepOutcome {
                name: name.clone(),
                status: StepStatus::Failed,
                exit_code: None,
                reason: Some(FailureReason::ActionError {
                    message: format!("no executor can run step {name}"),
                }),
                outputs: BTreeMap::new(),
                continue_on_error,
                duration_ms: 0,
            };
            return (outcome, vec![]);
        };

        let ctx = StepContext {
            run_id: scope.run_id,
            instance: instance.key.clone(),
            workspace: workspace.to_path_buf(),
            variables,
            timeout: step.timeout().or(self.config.default_step_timeout),
            step,
        };

        self.publish(Event::StepStarted(StepStartedPayload {
            run_id: scope.run_id,
            instance: instance.key.clone(),
            step: name.clone(),
            started_at: Utc::now(),
        }))
        .await;

        let (tx, rx) = mpsc::channel(self.config.output_buffer.max(1));
        let forwarder = tokio::spawn(forward_output(
            self.event_bus.clone(),
            scope.run_id,
            instance.key.clone(),
            name.clone(),
            rx,
        ));

        let start = std::time::Instant::now();
        let result = executor.execute(&ctx, tx, scope.cancel.clone()).await;
        let _ = forwarder.await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (outcome, artifacts) = step_outcome(&name, continue_on_error, duration_ms, result, scope);

        info!(
            instance = %instance.key,
            step = %name,
            status = %outcome.status.result_str(),
            exit_code = ?outcome.exit_code,
            duration_ms,
            "Step finished"
        );

        self.publish(Event::StepCompleted(StepCompletedPayload {
            run_id: scope.run_id,
            instance: instance.key.clone(),
            step: name,
            status: outcome.status,
            exit_code: outcome.exit_code,
            duration_ms,
        }))
        .await;

        (outcome, artifacts)
    }
}

fn step_outcome(
    name: &str,
    continue_on_error: bool,
    duration_ms: u64,
    result: Result<StepResult>,
    scope: &ExecutionScope,
) -> (StepOutcome, Vec<String>) {
    let mut outcome = StepOutcome {
        name: name.to_string(),
        status: StepStatus::Succeeded,
        exit_code: None,
        reason: None,
        outputs: BTreeMap::new(),
        continue_on_error,
        duration_ms,
    };

    let mut artifacts = vec![];
    match result {
        Ok(result) => {
            outcome.exit_code = Some(result.exit_code);
            outcome.outputs = result.outputs;
            artifacts = result.artifacts;
            if !result.success {
                outcome.status = StepStatus::Failed;
                outcome.reason = Some(FailureReason::StepFailed {
                    step: name.to_string(),
                    exit_code: Some(result.exit_code),
                });
            }
        }
        Err(Error::Cancelled) => {
            outcome.status = StepStatus::Cancelled;
            outcome.reason = Some(StepRunner::stop_reason(scope));
        }
        Err(Error::StepTimeout { seconds }) => {
            debug!(step = %name, seconds, "Step timed out");
            outcome.status = StepStatus::Failed;
            outcome.reason = Some(FailureReason::Timeout);
        }
        Err(Error::ArtifactConflict { name: artifact, .. }) => {
            outcome.status = StepStatus::Failed;
            outcome.reason = Some(FailureReason::ArtifactConflict { name: artifact });
        }
        Err(e) => {
            outcome.status = StepStatus::Failed;
            outcome.reason = Some(FailureReason::ActionError {
                message: e.to_string(),
            });
        }
    }
    (outcome, artifacts)
}

async fn forward_output(
    event_bus: Arc<dyn EventBus>,
    run_id: RunId,
    instance: InstanceKey,
    step: String,
    mut rx: mpsc::Receiver<OutputLine>,
) {
    while let Some(line) = rx.recv().await {
        trace!(instance = %instance, step = %step, line = %line.content, "Step output");
        let event = Event::StepOutput(StepOutputPayload {
            run_id,
            instance: instance.clone(),
            step: step.clone(),
            stream: line.stream.into(),
            line: line.content,
            line_number: line.line_number,
            timestamp: line.timestamp,
        });
        if let Err(e) = event_bus.publish(event).await {
            warn!(error = %e, "Failed to publish step output");
        }
    }
}

#[async_trait]
impl InstanceExecutor for StepRunner {
    async fn execute(
        &self,
        instance: &JobInstance,
        scope: ExecutionScope,
    ) -> Result<InstanceOutcome> {
        let definition = instance.definition.clone();
        let base_env = Self::base_env(instance, &scope);

        let workspace = {
            let ctx = ExpressionContext::new(&scope.context)
                .with_matrix(&instance.matrix)
                .with_env(&base_env)
                .with_needs(&scope.needs);
            match &definition.working_directory {
                Some(dir) => self.config.workspace.join(interpolate(dir, &ctx)),
                None => self.config.workspace.clone(),
            }
        };

        info!(instance = %instance.key, steps = definition.steps.len(), workspace = %workspace.display(), "Running job instance");

        let mut outcomes: Vec<StepOutcome> = Vec::with_capacity(definition.steps.len());
        let mut artifacts = Vec::new();

        for step in &definition.steps {
            if scope.cancel.is_cancelled() {
                outcomes.push(StepOutcome::skipped(&step.name, Self::stop_reason(&scope)));
                continue;
            }

            let prepared = {
                let ctx = ExpressionContext::new(&scope.context)
                    .with_matrix(&instance.matrix)
                    .with_env(&base_env)
                    .with_needs(&scope.needs)
                    .with_steps(&outcomes)
                    .with_status(StatusScope::from_steps(&outcomes, false));

                let subject = format!("{}/{}", instance.key, step.name);
                if condition_passes(step.condition.as_ref(), &ctx, &subject) {
                    let mut env = base_env.clone();
                    env.extend(interpolate_map(&step.variables, &ctx));
                    let resolved = resolve_step(step, &ctx.with_env(&env));
                    Some((resolved, env))
                } else {
                    None
                }
            };

            let Some((resolved, env)) = prepared else {
                debug!(instance = %instance.key, step = %step.name, "Step condition not met, skipping");
                outcomes.push(StepOutcome::skipped(&step.name, FailureReason::ConditionFalse));
                continue;
            };

            let (outcome, sealed) = self.run_step(instance, &scope, &workspace, resolved, env).await;
            if outcome.status == StepStatus::Succeeded {
                artifacts.extend(sealed);
            }
            outcomes.push(outcome);
        }

        let failure = outcomes
            .iter()
            .find(|s| s.status == StepStatus::Failed && !s.continue_on_error)
            .map(|s| {
                s.reason.clone().unwrap_or(FailureReason::StepFailed {
                    step: s.name.clone(),
                    exit_code: s.exit_code,
                })
            });

        let outcome = if let Some(reason) = failure {
            InstanceOutcome::failed(reason, outcomes)
        } else if scope.cancel.is_cancelled()
            || outcomes.iter().any(|s| s.status == StepStatus::Cancelled)
        {
            InstanceOutcome::cancelled(Self::stop_reason(&scope), outcomes)
        } else {
            InstanceOutcome::succeeded(outcomes)
        };

        Ok(outcome.with_artifacts(artifacts))
    }
}

/// Interpolate the parts of a step that reach the executor.
fn resolve_step(step: &StepDefinition, ctx: &ExpressionContext<'_>) -> StepDefinition {
    let mut resolved = step.clone();
    resolved.run = step.run.as_deref().map(|cmd| interpolate(cmd, ctx));
    resolved.working_directory = step
        .working_directory
        .as_deref()
        .map(|dir| interpolate(dir, ctx));
    resolved.with = step
        .with
        .iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => serde_json::Value::String(interpolate(s, ctx)),
                other => other.clone(),
            };
            (k.clone(), value)
        })
        .collect();
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionRegistry;
    use pipewright_artifacts::MemoryArtifactStore;
    use pipewright_core::bus::BroadcastEventBus;
    use pipewright_core::cancel::{CancelSignal, cancel_pair};
    use pipewright_core::pipeline::JobDefinition;
    use pipewright_core::ports::ArtifactStore;
    use pipewright_core::run::{InstanceStatus, MatrixAssignment, RunContext};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Harness {
        runner: StepRunner,
        bus: Arc<BroadcastEventBus>,
        store: Arc<MemoryArtifactStore>,
        _tmp: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let bus = Arc::new(BroadcastEventBus::new());
        let store = Arc::new(MemoryArtifactStore::new());
        let registry = Arc::new(ActionRegistry::with_builtins(store.clone(), bus.clone()));
        let config = RunnerConfig {
            workspace: tmp.path().to_path_buf(),
            ..RunnerConfig::default()
        };
        Harness {
            runner: StepRunner::new(config, registry, bus.clone()),
            bus,
            store,
            _tmp: tmp,
        }
    }

    fn instance(job: serde_json::Value) -> JobInstance {
        let definition: JobDefinition = serde_json::from_value(job).unwrap();
        let mut matrix = MatrixAssignment::new();
        matrix.insert("os", json!("linux"));
        JobInstance {
            key: matrix.instance_key(&definition.name),
            template: definition.name.clone(),
            index: 0,
            display_name: definition.name.clone(),
            matrix,
            variables: definition.variables.clone(),
            timeout: None,
            definition: Arc::new(definition),
        }
    }

    fn scope(cancel: CancelSignal) -> ExecutionScope {
        ExecutionScope {
            run_id: RunId::new(),
            context: Arc::new(RunContext::push("main")),
            needs: BTreeMap::new(),
            cancel,
            run_cancelled: CancelSignal::never(),
        }
    }

    fn statuses(outcome: &InstanceOutcome) -> Vec<(&str, StepStatus)> {
        outcome
            .steps
            .iter()
            .map(|s| (s.name.as_str(), s.status))
            .collect()
    }

    fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<String> {
        let mut subjects = Vec::new();
        while let Ok(event) = rx.try_recv() {
            subjects.push(event.subject());
        }
        subjects
    }

    #[tokio::test]
    async fn test_failure_skips_default_steps_but_runs_always() {
        let h = harness();
        let job = instance(json!({
            "name": "build",
            "steps": [
                { "name": "a", "run": "true" },
                { "name": "b", "run": "exit 2" },
                { "name": "c", "run": "true" },
                { "name": "d", "run": "true", "if": "always()" }
            ]
        }));

        let outcome = h.runner.execute(&job, scope(CancelSignal::never())).await.unwrap();
        assert_eq!(outcome.status, InstanceStatus::Failed);
        assert_eq!(
            outcome.reason,
            Some(FailureReason::StepFailed { step: "b".to_string(), exit_code: Some(2) })
        );
        assert_eq!(
            statuses(&outcome),
            vec![
                ("a", StepStatus::Succeeded),
                ("b", StepStatus::Failed),
                ("c", StepStatus::Skipped),
                ("d", StepStatus::Succeeded),
            ]
        );
    }

    #[tokio::test]
    async fn test_continue_on_error_keeps_instance_green() {
        let h = harness();
        let job = instance(json!({
            "name": "lint",
            "steps": [
                { "name": "flaky", "run": "exit 1", "continue_on_error": true },
                { "name": "after", "run": "true" }
            ]
        }));

        let outcome = h.runner.execute(&job, scope(CancelSignal::never())).await.unwrap();
        assert_eq!(outcome.status, InstanceStatus::Succeeded);
        assert_eq!(outcome.steps[0].status, StepStatus::Failed);
        assert_eq!(outcome.steps[1].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_outputs_and_matrix_are_interpolated() {
        let h = harness();
        let job = instance(json!({
            "name": "release",
            "variables": { "PROFILE": "release" },
            "steps": [
                { "name": "version", "run": "echo version=1.2.3 >> \"$PIPEWRIGHT_OUTPUT\"" },
                {
                    "name": "check",
                    "run": "test \"${{ steps.version.outputs.version }}-${{ matrix.os }}-$PROFILE-$PIPEWRIGHT_JOB\" = 1.2.3-linux-release-release"
                }
            ]
        }));

        let outcome = h.runner.execute(&job, scope(CancelSignal::never())).await.unwrap();
        assert_eq!(outcome.status, InstanceStatus::Succeeded);
        assert_eq!(
            outcome.steps[0].outputs.get("version").map(String::as_str),
            Some("1.2.3")
        );
    }

    #[tokio::test]
    async fn test_step_guard_sees_env() {
        let h = harness();
        let job = instance(json!({
            "name": "deploy",
            "variables": { "TARGET": "staging" },
            "steps": [
                { "name": "prod", "run": "exit 1", "if": "env.TARGET == 'production'" },
                { "name": "staging", "run": "true", "if": "env.TARGET == 'staging'" }
            ]
        }));

        let outcome = h.runner.execute(&job, scope(CancelSignal::never())).await.unwrap();
        assert_eq!(outcome.status, InstanceStatus::Succeeded);
        assert_eq!(outcome.steps[0].reason, Some(FailureReason::ConditionFalse));
    }

    #[tokio::test]
    async fn test_cancel_stops_current_and_skips_rest() {
        let h = harness();
        let job = instance(json!({
            "name": "slow",
            "steps": [
                { "name": "sleep", "run": "sleep 10" },
                { "name": "never", "run": "true" }
            ]
        }));
        let (handle, signal) = cancel_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        });

        let outcome = h.runner.execute(&job, scope(signal)).await.unwrap();
        assert_eq!(outcome.status, InstanceStatus::Cancelled);
        assert_eq!(outcome.reason, Some(FailureReason::FailFast));
        assert_eq!(
            statuses(&outcome),
            vec![("sleep", StepStatus::Cancelled), ("never", StepStatus::Skipped)]
        );
    }

    #[tokio::test]
    async fn test_step_timeout_fails_instance() {
        let h = harness();
        let job = instance(json!({
            "name": "hang",
            "steps": [{ "name": "sleep", "run": "sleep 10", "timeout_minutes": 0 }]
        }));

        let outcome = h.runner.execute(&job, scope(CancelSignal::never())).await.unwrap();
        assert_eq!(outcome.status, InstanceStatus::Failed);
        assert_eq!(outcome.reason, Some(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn test_upload_records_artifact_and_events() {
        let h = harness();
        let mut events = h.bus.receiver();
        let job = instance(json!({
            "name": "build",
            "steps": [
                { "name": "compile", "run": "echo hello; printf bin > app" },
                {
                    "name": "upload",
                    "action": "artifact/upload@v1",
                    "with": { "name": "app-${{ matrix.os }}", "path": "app" }
                }
            ]
        }));
        let scope = scope(CancelSignal::never());
        let run_id = scope.run_id;

        let outcome = h.runner.execute(&job, scope).await.unwrap();
        assert_eq!(outcome.status, InstanceStatus::Succeeded);
        assert_eq!(outcome.artifacts, vec!["app-linux".to_string()]);

        let artifact = h.store.get(run_id, "app-linux").await.unwrap();
        assert_eq!(artifact.payload, b"bin");
        assert_eq!(artifact.meta.producer, job.key);

        let subjects = drain(&mut events);
        let prefix = format!("run.{run_id}.instance.build[os=linux].step");
        assert_eq!(
            subjects,
            vec![
                format!("{prefix}.compile.started"),
                format!("{prefix}.compile.output"),
                format!("{prefix}.compile.completed"),
                format!("{prefix}.upload.started"),
                format!("run.{run_id}.artifact.app-linux.sealed"),
                format!("{prefix}.upload.completed"),
            ]
        );
    }

    #[tokio::test]
    async fn test_artifact_conflict_fails_step() {
        let h = harness();
        let job = instance(json!({
            "name": "build",
            "steps": [
                { "name": "make", "run": "printf x > out" },
                { "name": "first", "action": "artifact/upload", "with": { "name": "out", "path": "out" } },
                { "name": "second", "action": "artifact/upload", "with": { "name": "out", "path": "out" } }
            ]
        }));

        let outcome = h.runner.execute(&job, scope(CancelSignal::never())).await.unwrap();
        assert_eq!(outcome.status, InstanceStatus::Failed);
        assert_eq!(
            outcome.reason,
            Some(FailureReason::ArtifactConflict { name: "out".to_string() })
        );
        assert_eq!(outcome.artifacts, vec!["out".to_string()]);
    }
}
