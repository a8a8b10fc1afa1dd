//! Run scheduler.
//!
//! One `RunScheduler` task owns the execution graph of a run. It promotes
//! ready instances, dispatches them onto a `JoinSet` within the concurrency
//! limits, and applies every status change itself, so propagation is
//! serialized.

use crate::dag::ExecutionGraph;
use crate::queue::DispatchQueue;
use chrono::Utc;
use petgraph::graph::NodeIndex;
use pipewright_core::cancel::{CancelHandle, CancelSignal, cancel_pair};
use pipewright_core::events::{
    Event, InstanceStatusPayload, RunCancelledPayload, RunCompletedPayload, RunStartedPayload,
};
use pipewright_core::expression::{ExpressionContext, StatusScope, condition_passes};
use pipewright_core::ports::{EventBus, ExecutionScope, InstanceExecutor};
use pipewright_core::run::{
    FailureReason, InstanceOutcome, InstanceStatus, JobInstance, RunContext, RunReport, RunStatus,
};
use pipewright_core::{Error, Result, RunId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long a signalled worker may take to wind down before it is dropped.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Effective limits for one run.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub max_parallel: Option<usize>,
    /// Cancel everything not yet started once any instance fails.
    pub fail_fast: bool,
    pub run_timeout: Option<Duration>,
}

type WorkerResult = (NodeIndex, Result<InstanceOutcome>);

pub struct RunScheduler {
    run_id: RunId,
    pipeline: String,
    context: Arc<RunContext>,
    graph: ExecutionGraph,
    queue: DispatchQueue,
    executor: Arc<dyn InstanceExecutor>,
    event_bus: Arc<dyn EventBus>,
    config: SchedulerConfig,
    run_cancel: CancelSignal,
    workers: HashMap<NodeIndex, CancelHandle>,
    tasks: HashMap<TaskId, NodeIndex>,
    stop_reasons: HashMap<NodeIndex, FailureReason>,
    timed_out: HashSet<NodeIndex>,
    dispatch_stopped: bool,
    cancel_requested: bool,
}

impl RunScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        pipeline: impl Into<String>,
        context: Arc<RunContext>,
        graph: ExecutionGraph,
        executor: Arc<dyn InstanceExecutor>,
        event_bus: Arc<dyn EventBus>,
        config: SchedulerConfig,
        run_cancel: CancelSignal,
    ) -> Self {
        let mut queue = DispatchQueue::new(config.max_parallel);
        for template in graph.templates() {
            if let Some(limit) = template.max_parallel {
                queue.set_template_limit(template.name.clone(), limit as usize);
            }
        }

        Self {
            run_id,
            pipeline: pipeline.into(),
            context,
            graph,
            queue,
            executor,
            event_bus,
            config,
            run_cancel,
            workers: HashMap::new(),
            tasks: HashMap::new(),
            stop_reasons: HashMap::new(),
            timed_out: HashSet::new(),
            dispatch_stopped: false,
            cancel_requested: false,
        }
    }

    /// Drive the run to completion.
    pub async fn run(mut self) -> RunReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = self.config.run_timeout.map(|limit| start + limit);
        let run_cancel = self.run_cancel.clone();
        let mut deadline_passed = false;
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();

        info!(
            run_id = %self.run_id,
            pipeline = %self.pipeline,
            instances = self.graph.len(),
            max_parallel = ?self.config.max_parallel,
            fail_fast = self.config.fail_fast,
            "Starting run"
        );
        self.publish(Event::RunStarted(RunStartedPayload {
            run_id: self.run_id,
            pipeline: self.pipeline.clone(),
            instance_count: self.graph.len(),
            started_at,
        }))
        .await;

        loop {
            if !self.cancel_requested && run_cancel.is_cancelled() {
                self.cancel_run().await;
            }
            if !self.dispatch_stopped {
                self.promote().await;
                self.dispatch(&mut workers).await;
            }

            if workers.is_empty() {
                if !self.graph.is_complete() {
                    warn!(run_id = %self.run_id, "No runnable instances left, cancelling the rest");
                    self.cancel_remaining(FailureReason::RunCancelled).await;
                }
                break;
            }

            tokio::select! {
                Some(joined) = workers.join_next_with_id() => self.on_joined(joined).await,
                _ = run_cancel.cancelled(), if !self.cancel_requested => {
                    self.cancel_run().await;
                }
                _ = sleep_until(deadline), if !deadline_passed => {
                    deadline_passed = true;
                    self.timeout_run().await;
                }
            }
        }

        let instances = self.graph.reports();
        let status = RunStatus::from_instances(instances.iter().map(|i| &i.status));
        let completed_at = Utc::now();
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(run_id = %self.run_id, status = %status, duration_ms, "Run completed");
        self.publish(Event::RunCompleted(RunCompletedPayload {
            run_id: self.run_id,
            pipeline: self.pipeline.clone(),
            status,
            duration_ms,
            completed_at,
        }))
        .await;

        RunReport {
            run_id: self.run_id,
            pipeline: self.pipeline,
            context: self.context.as_ref().clone(),
            status,
            instances,
            started_at,
            completed_at,
            duration_ms,
        }
    }

    /// Settle every ready node as `Pending` or `Skipped`. Repeats because a
    /// skip can make further nodes ready.
    async fn promote(&mut self) {
        loop {
            let ready = self.graph.ready();
            if ready.is_empty() {
                break;
            }

            for idx in ready {
                let (passes, scope) = self.evaluate_guard(idx);
                if passes {
                    self.graph.transition(idx, InstanceStatus::Pending, None);
                    let template = self.graph.node(idx).instance.template.clone();
                    self.queue.enqueue(idx, template);
                } else {
                    let reason = if scope.success() {
                        FailureReason::ConditionFalse
                    } else {
                        FailureReason::DependencyNotSatisfied
                    };
                    self.graph.transition(idx, InstanceStatus::Skipped, Some(reason));
                }
                self.publish_status(idx).await;
            }
        }
    }

    fn evaluate_guard(&self, idx: NodeIndex) -> (bool, StatusScope) {
        let instance = &self.graph.node(idx).instance;
        let statuses = self.graph.dependency_statuses(idx);
        let needs = self.graph.dependency_results(idx);
        let scope = StatusScope::from_dependencies(&statuses, self.cancel_requested);

        let ctx = ExpressionContext::new(&self.context)
            .with_matrix(&instance.matrix)
            .with_env(&instance.variables)
            .with_needs(&needs)
            .with_status(scope);
        let passes = condition_passes(
            instance.definition.condition.as_ref(),
            &ctx,
            instance.key.as_str(),
        );
        (passes, scope)
    }

    async fn dispatch(&mut self, workers: &mut JoinSet<WorkerResult>) {
        while let Some(item) = self.queue.dequeue() {
            let node = item.node;
            if !self.graph.transition(node, InstanceStatus::Running, None) {
                self.queue.complete(&item.template);
                continue;
            }
            self.publish_status(node).await;

            let (handle, signal) = cancel_pair();
            self.workers.insert(node, handle);
            let scope = ExecutionScope {
                run_id: self.run_id,
                context: self.context.clone(),
                needs: self.graph.dependency_results(node),
                cancel: signal,
                run_cancelled: self.run_cancel.clone(),
            };
            let instance = self.graph.node(node).instance.clone();

            debug!(
                run_id = %self.run_id,
                instance = %instance.key,
                running = self.queue.running(),
                "Dispatching instance"
            );
            let task = workers.spawn(run_worker(self.executor.clone(), node, instance, scope));
            self.tasks.insert(task.id(), node);
        }
    }

    async fn on_joined(&mut self, joined: std::result::Result<(TaskId, WorkerResult), JoinError>) {
        match joined {
            Ok((id, (node, result))) => {
                self.tasks.remove(&id);
                self.complete(node, result).await;
            }
            Err(e) => {
                error!(run_id = %self.run_id, error = %e, "Instance worker task failed");
                if let Some(node) = self.tasks.remove(&e.id()) {
                    let message = format!("instance worker failed: {e}");
                    self.complete(node, Err(Error::Internal(message))).await;
                }
            }
        }
    }

    async fn complete(&mut self, node: NodeIndex, result: Result<InstanceOutcome>) {
        let template = self.graph.node(node).instance.template.clone();
        self.queue.complete(&template);
        self.workers.remove(&node);

        let mut outcome = result.unwrap_or_else(outcome_from_error);
        if !InstanceStatus::Running.can_transition_to(outcome.status) {
            warn!(status = %outcome.status, "Executor reported a non-final status");
            outcome = InstanceOutcome::failed(
                FailureReason::ActionError {
                    message: format!("executor reported status {}", outcome.status),
                },
                outcome.steps,
            );
        }

        if self.timed_out.contains(&node) && outcome.status != InstanceStatus::Succeeded {
            outcome.status = InstanceStatus::Failed;
            outcome.reason = Some(FailureReason::Timeout);
        } else if outcome.status == InstanceStatus::Cancelled
            && let Some(reason) = self.stop_reasons.get(&node)
        {
            outcome.reason = Some(reason.clone());
        }

        let status = outcome.status;
        info!(
            run_id = %self.run_id,
            instance = %self.graph.node(node).instance.key,
            status = %status,
            reason = ?outcome.reason,
            "Instance finished"
        );
        if self.graph.record_outcome(node, outcome) {
            self.publish_status(node).await;
        }
        if status == InstanceStatus::Failed {
            self.on_failure(&template).await;
        }
    }

    async fn on_failure(&mut self, template: &str) {
        let siblings = match self.graph.template(template) {
            Some(info) if info.fail_fast && info.instances.len() > 1 => info.instances.clone(),
            _ => vec![],
        };
        if !siblings.is_empty() {
            info!(run_id = %self.run_id, template = %template, "Matrix fail-fast: cancelling siblings");
            self.queue.remove_template(template);
            for idx in siblings {
                self.stop_node(idx, FailureReason::FailFast).await;
            }
        }

        if self.config.fail_fast && !self.dispatch_stopped {
            info!(run_id = %self.run_id, "Run fail-fast: cancelling instances that have not started");
            self.dispatch_stopped = true;
            self.queue.drain();
            let waiting: Vec<NodeIndex> = self
                .graph
                .nodes()
                .filter(|(_, n)| matches!(n.status, InstanceStatus::Blocked | InstanceStatus::Pending))
                .map(|(idx, _)| idx)
                .collect();
            for idx in waiting {
                self.stop_node(idx, FailureReason::FailFast).await;
            }
        }
    }

    /// Cancel a node that has not started, or signal its worker if it is
    /// running.
    async fn stop_node(&mut self, idx: NodeIndex, reason: FailureReason) {
        match self.graph.node(idx).status {
            InstanceStatus::Blocked | InstanceStatus::Pending => {
                if self.graph.transition(idx, InstanceStatus::Cancelled, Some(reason)) {
                    self.publish_status(idx).await;
                }
            }
            InstanceStatus::Running => {
                if let Some(handle) = self.workers.get(&idx) {
                    handle.cancel();
                }
                self.stop_reasons.entry(idx).or_insert(reason);
            }
            _ => {}
        }
    }

    async fn cancel_run(&mut self) {
        info!(run_id = %self.run_id, "Cancelling run");
        self.cancel_requested = true;
        self.dispatch_stopped = true;
        self.queue.drain();
        self.publish(Event::RunCancelled(RunCancelledPayload {
            run_id: self.run_id,
            pipeline: self.pipeline.clone(),
            cancelled_at: Utc::now(),
        }))
        .await;
        self.cancel_remaining(FailureReason::RunCancelled).await;
    }

    async fn timeout_run(&mut self) {
        warn!(run_id = %self.run_id, timeout = ?self.config.run_timeout, "Run timed out");
        self.dispatch_stopped = true;
        self.queue.drain();

        let live: Vec<(NodeIndex, InstanceStatus)> = self
            .graph
            .nodes()
            .filter(|(_, n)| !n.status.is_terminal())
            .map(|(idx, n)| (idx, n.status))
            .collect();
        for (idx, status) in live {
            if status == InstanceStatus::Running {
                self.timed_out.insert(idx);
            }
            self.stop_node(idx, FailureReason::Timeout).await;
        }
    }

    async fn cancel_remaining(&mut self, reason: FailureReason) {
        let live: Vec<NodeIndex> = self
            .graph
            .nodes()
            .filter(|(_, n)| !n.status.is_terminal())
            .map(|(idx, _)| idx)
            .collect();
        for idx in live {
            if self.workers.contains_key(&idx) {
                self.stop_node(idx, reason.clone()).await;
            } else if self.graph.transition(idx, InstanceStatus::Cancelled, Some(reason.clone())) {
                self.publish_status(idx).await;
            }
        }
    }

    async fn publish_status(&self, idx: NodeIndex) {
        let node = self.graph.node(idx);
        self.publish(Event::InstanceStatusChanged(InstanceStatusPayload {
            run_id: self.run_id,
            instance: node.instance.key.clone(),
            template: node.instance.template.clone(),
            status: node.status,
            reason: node.reason.clone(),
            timestamp: Utc::now(),
        }))
        .await;
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.event_bus.publish(event).await {
            warn!(run_id = %self.run_id, error = %e, "Failed to publish run event");
        }
    }
}

/// Execute one instance, enforcing its timeout and dropping it if it ignores
/// a cancel signal for longer than the grace period.
async fn run_worker(
    executor: Arc<dyn InstanceExecutor>,
    node: NodeIndex,
    instance: JobInstance,
    scope: ExecutionScope,
) -> WorkerResult {
    let cancel = scope.cancel.clone();
    let limit = instance.timeout;

    let task = tokio::spawn(async move {
        let execution = executor.execute(&instance, scope);
        match limit {
            Some(limit) => tokio::time::timeout(limit, execution)
                .await
                .unwrap_or(Err(Error::StepTimeout {
                    seconds: limit.as_secs(),
                })),
            None => execution.await,
        }
    });
    let abort = task.abort_handle();

    let result = tokio::select! {
        joined = task => joined.unwrap_or_else(|e| Err(Error::Internal(format!("instance worker failed: {e}")))),
        _ = grace_expired(cancel) => {
            abort.abort();
            Err(Error::Cancelled)
        }
    };
    (node, result)
}

async fn grace_expired(cancel: CancelSignal) {
    cancel.cancelled().await;
    tokio::time::sleep(CANCEL_GRACE).await;
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn outcome_from_error(err: Error) -> InstanceOutcome {
    match err {
        Error::Cancelled => InstanceOutcome::cancelled(FailureReason::RunCancelled, vec![]),
        Error::StepTimeout { .. } => InstanceOutcome::failed(FailureReason::Timeout, vec![]),
        Error::ArtifactConflict { name, .. } => {
            InstanceOutcome::failed(FailureReason::ArtifactConflict { name }, vec![])
        }
        other => InstanceOutcome::failed(
            FailureReason::ActionError {
                message: other.to_string(),
            },
            vec![],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pipewright_core::bus::BroadcastEventBus;
    use pipewright_core::pipeline::PipelineDefinition;

    struct Stalled;

    #[async_trait]
    impl InstanceExecutor for Stalled {
        async fn execute(&self, _instance: &JobInstance, _scope: ExecutionScope) -> Result<InstanceOutcome> {
            std::future::pending().await
        }
    }

    fn scheduler() -> RunScheduler {
        let definition: PipelineDefinition = serde_yaml::from_str(
            r#"
name: ci
jobs:
  - name: build
    steps: [{ name: s, run: "true" }]
  - name: test
    needs: [build]
    steps: [{ name: s, run: "true" }]
"#,
        )
        .unwrap();
        let (_handle, signal) = cancel_pair();
        RunScheduler::new(
            RunId::new(),
            "ci",
            Arc::new(RunContext::push("main")),
            ExecutionGraph::build(&definition).unwrap(),
            Arc::new(Stalled),
            Arc::new(BroadcastEventBus::new()),
            SchedulerConfig {
                max_parallel: Some(1),
                ..SchedulerConfig::default()
            },
            signal,
        )
    }

    #[tokio::test]
    async fn test_lost_worker_task_fails_its_instance() {
        let mut scheduler = scheduler();
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        scheduler.promote().await;
        scheduler.dispatch(&mut workers).await;
        assert_eq!(scheduler.queue.running(), 1);

        workers.abort_all();
        let joined = workers.join_next_with_id().await.unwrap();
        assert!(joined.is_err());
        scheduler.on_joined(joined).await;
        scheduler.promote().await;

        assert_eq!(scheduler.queue.running(), 0);
        assert!(scheduler.tasks.is_empty());
        assert!(scheduler.graph.is_complete());
        let reports = scheduler.graph.reports();
        let build = reports.iter().find(|r| r.key.as_str() == "build").unwrap();
        assert_eq!(build.status, InstanceStatus::Failed);
        assert!(matches!(build.reason, Some(FailureReason::ActionError { .. })));
        let test = reports.iter().find(|r| r.key.as_str() == "test").unwrap();
        assert_eq!(test.status, InstanceStatus::Skipped);
        assert_eq!(test.reason, Some(FailureReason::DependencyNotSatisfied));
    }
}
