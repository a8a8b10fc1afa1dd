//! Run creation from trigger events.

use crate::dag::ExecutionGraph;
use crate::scheduler::{RunScheduler, SchedulerConfig};
use crate::triggers::TriggerMatcher;
use chrono::Utc;
use pipewright_core::cancel::{CancelHandle, cancel_pair};
use pipewright_core::events::{Event, MatrixExpandedPayload, RunQueuedPayload};
use pipewright_core::expression::{ExpressionError, check_syntax};
use pipewright_core::pipeline::PipelineDefinition;
use pipewright_core::ports::{EventBus, InstanceExecutor};
use pipewright_core::run::{RunContext, RunReport};
use pipewright_core::{Error, Result, RunId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Settings layered over what the pipeline itself declares.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Used when the pipeline sets no `max_parallel`.
    pub default_max_parallel: Option<u32>,
    /// Overrides the pipeline's `max_parallel`.
    pub max_parallel: Option<u32>,
    /// Overrides the pipeline's `fail_fast`.
    pub fail_fast: Option<bool>,
    /// Overrides the pipeline's `timeout_minutes`.
    pub run_timeout: Option<Duration>,
}

/// Entry point that turns a pipeline and a trigger into a running run.
pub struct Orchestrator {
    executor: Arc<dyn InstanceExecutor>,
    event_bus: Arc<dyn EventBus>,
    config: OrchestratorConfig,
    trigger_matcher: TriggerMatcher,
}

impl Orchestrator {
    pub fn new(executor: Arc<dyn InstanceExecutor>, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            executor,
            event_bus,
            config: OrchestratorConfig::default(),
            trigger_matcher: TriggerMatcher::new(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate a pipeline and build its execution graph without running it.
    pub fn plan(&self, definition: &PipelineDefinition) -> Result<ExecutionGraph> {
        definition.validate()?;
        let graph = ExecutionGraph::build(definition)?;
        for (subject, error) in lint_conditions(definition) {
            warn!(subject = %subject, error = %error, "Condition will always be treated as false");
        }
        Ok(graph)
    }

    /// Whether the pipeline's trigger rules select this event.
    pub fn matches(&self, definition: &PipelineDefinition, context: &RunContext) -> bool {
        self.trigger_matcher.matches(definition, context)
    }

    /// Create and start a run. Returns `None` when the pipeline is not
    /// triggered by this event. Invalid pipelines fail before any instance
    /// executes.
    pub async fn trigger(
        &self,
        definition: &PipelineDefinition,
        context: RunContext,
    ) -> Result<Option<RunHandle>> {
        if !self.matches(definition, &context) {
            info!(
                pipeline = %definition.name,
                event = %context.event,
                branch = %context.filter_branch(),
                "Pipeline not triggered by event"
            );
            return Ok(None);
        }

        let graph = self.plan(definition)?;
        let run_id = RunId::new();

        self.publish(Event::RunQueued(RunQueuedPayload {
            run_id,
            pipeline: definition.name.clone(),
            event: context.event,
            git_ref: context.git_ref.clone(),
            queued_at: Utc::now(),
        }))
        .await;

        for template in graph.templates() {
            let instances = template
                .instances
                .iter()
                .map(|&idx| graph.node(idx).instance.key.clone())
                .collect();
            self.publish(Event::MatrixExpanded(MatrixExpandedPayload {
                run_id,
                template: template.name.clone(),
                instances,
                fail_fast: template.fail_fast,
                max_parallel: template.max_parallel,
            }))
            .await;
        }

        let config = self.scheduler_config(definition);
        info!(
            run_id = %run_id,
            pipeline = %definition.name,
            event = %context.event,
            git_ref = %context.git_ref,
            instances = graph.len(),
            "Run queued"
        );

        let (cancel, signal) = cancel_pair();
        let scheduler = RunScheduler::new(
            run_id,
            definition.name.clone(),
            Arc::new(context),
            graph,
            self.executor.clone(),
            self.event_bus.clone(),
            config,
            signal,
        );
        let task = tokio::spawn(scheduler.run());

        Ok(Some(RunHandle {
            run_id,
            cancel,
            task,
        }))
    }

    /// Trigger a run and wait for it to finish.
    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        context: RunContext,
    ) -> Result<Option<RunReport>> {
        match self.trigger(definition, context).await? {
            Some(handle) => handle.wait().await.map(Some),
            None => Ok(None),
        }
    }

    fn scheduler_config(&self, definition: &PipelineDefinition) -> SchedulerConfig {
        SchedulerConfig {
            max_parallel: self
                .config
                .max_parallel
                .or(definition.max_parallel)
                .or(self.config.default_max_parallel)
                .map(|n| n as usize),
            fail_fast: self.config.fail_fast.unwrap_or(definition.fail_fast),
            run_timeout: self.config.run_timeout.or(definition.timeout()),
        }
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.event_bus.publish(event).await {
            warn!(error = %e, "Failed to publish run event");
        }
    }
}

/// Syntax problems in job and step conditions, keyed by `job` or
/// `job/step`. Such conditions evaluate to false at run time.
pub fn lint_conditions(definition: &PipelineDefinition) -> Vec<(String, ExpressionError)> {
    let mut problems = Vec::new();
    for job in &definition.jobs {
        if let Some(condition) = &job.condition
            && let Err(e) = check_syntax(condition)
        {
            problems.push((job.name.clone(), e));
        }
        for step in &job.steps {
            if let Some(condition) = &step.condition
                && let Err(e) = check_syntax(condition)
            {
                problems.push((format!("{}/{}", job.name, step.name), e));
            }
        }
    }
    problems
}

/// A run in progress.
pub struct RunHandle {
    run_id: RunId,
    cancel: CancelHandle,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Request cancellation. Running instances are signalled; sealed
    /// artifacts are kept.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A handle that can cancel the run from elsewhere.
    pub fn canceller(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunReport> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("run scheduler failed: {e}")))
    }
}
