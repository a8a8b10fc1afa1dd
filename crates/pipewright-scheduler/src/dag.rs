//! Instance-level dependency graph for a run.
//!
//! Every matrix expansion of every job becomes one node. A job that needs
//! another depends on every instance of it.

use crate::matrix::{MatrixError, MatrixExpander};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use pipewright_core::pipeline::PipelineDefinition;
use pipewright_core::run::{
    FailureReason, InstanceOutcome, InstanceReport, InstanceStatus, JobInstance,
};
use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Empty pipeline")]
    EmptyPipeline,
    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),
    #[error("Job {job} needs unknown job {needs}")]
    UnknownDependency { job: String, needs: String },
    #[error("Job {0} needs itself")]
    SelfDependency(String),
    #[error("Job {job} has more than one instance keyed {key}")]
    DuplicateInstance { job: String, key: String },
    #[error("Cycle detected between jobs: {}", .0.join(", "))]
    CycleDetected(Vec<String>),
    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

impl From<GraphError> for pipewright_core::Error {
    fn from(err: GraphError) -> Self {
        pipewright_core::Error::Configuration(err.to_string())
    }
}

/// A job instance and its run-time state.
#[derive(Debug, Clone)]
pub struct InstanceNode {
    pub instance: JobInstance,
    pub status: InstanceStatus,
    pub reason: Option<FailureReason>,
    pub outcome: Option<InstanceOutcome>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-job bookkeeping shared by all of its instances.
#[derive(Debug, Clone)]
pub struct TemplateInfo {
    pub name: String,
    pub needs: Vec<String>,
    pub fail_fast: bool,
    pub max_parallel: Option<u32>,
    pub instances: Vec<NodeIndex>,
}

/// Directed acyclic graph of job instances.
#[derive(Debug)]
pub struct ExecutionGraph {
    graph: DiGraph<InstanceNode, ()>,
    templates: IndexMap<String, TemplateInfo>,
}

impl ExecutionGraph {
    /// Build the graph for a pipeline. Fails before anything runs if the
    /// jobs reference each other inconsistently or a matrix is malformed.
    pub fn build(pipeline: &PipelineDefinition) -> Result<Self, GraphError> {
        if pipeline.jobs.is_empty() {
            return Err(GraphError::EmptyPipeline);
        }

        let mut names = HashSet::new();
        for job in &pipeline.jobs {
            if !names.insert(job.name.as_str()) {
                return Err(GraphError::DuplicateJob(job.name.clone()));
            }
        }
        for job in &pipeline.jobs {
            for need in &job.needs {
                if *need == job.name {
                    return Err(GraphError::SelfDependency(job.name.clone()));
                }
                if !names.contains(need.as_str()) {
                    return Err(GraphError::UnknownDependency {
                        job: job.name.clone(),
                        needs: need.clone(),
                    });
                }
            }
        }
        Self::check_cycles(pipeline)?;

        let expander = MatrixExpander::new();
        let mut graph = DiGraph::new();
        let mut templates = IndexMap::new();
        let mut keys = HashSet::new();

        for job in &pipeline.jobs {
            let expansion = expander.expand(job)?;
            let definition = Arc::new(job.clone());
            let mut variables = pipeline.variables.clone();
            variables.extend(job.variables.clone());

            let mut instances = Vec::with_capacity(expansion.len());
            for (index, matrix) in expansion.assignments.into_iter().enumerate() {
                let display_name = if matrix.is_empty() {
                    job.display_name().to_string()
                } else {
                    format!("{} ({})", job.display_name(), matrix.describe())
                };
                let key = matrix.instance_key(&job.name);
                if !keys.insert(key.clone()) {
                    return Err(GraphError::DuplicateInstance {
                        job: job.name.clone(),
                        key: key.to_string(),
                    });
                }
                let instance = JobInstance {
                    key,
                    template: job.name.clone(),
                    index,
                    display_name,
                    matrix,
                    definition: definition.clone(),
                    variables: variables.clone(),
                    timeout: job.timeout(),
                };
                instances.push(graph.add_node(InstanceNode {
                    instance,
                    status: InstanceStatus::Blocked,
                    reason: None,
                    outcome: None,
                    started_at: None,
                    completed_at: None,
                }));
            }

            templates.insert(
                job.name.clone(),
                TemplateInfo {
                    name: job.name.clone(),
                    needs: job.needs.clone(),
                    fail_fast: expansion.fail_fast,
                    max_parallel: expansion.max_parallel,
                    instances,
                },
            );
        }

        for template in templates.values() {
            for need in &template.needs {
                for &from in &templates[need.as_str()].instances {
                    for &to in &template.instances {
                        graph.add_edge(from, to, ());
                    }
                }
            }
        }

        debug!(
            pipeline = %pipeline.name,
            templates = templates.len(),
            instances = graph.node_count(),
            "Built execution graph"
        );

        Ok(Self { graph, templates })
    }

    /// Reject any cycle among jobs, naming its members.
    fn check_cycles(pipeline: &PipelineDefinition) -> Result<(), GraphError> {
        let mut jobs: DiGraph<&str, ()> = DiGraph::new();
        let index: HashMap<&str, NodeIndex> = pipeline
            .jobs
            .iter()
            .map(|job| (job.name.as_str(), jobs.add_node(job.name.as_str())))
            .collect();
        for job in &pipeline.jobs {
            for need in &job.needs {
                jobs.add_edge(index[need.as_str()], index[job.name.as_str()], ());
            }
        }

        if let Some(component) = tarjan_scc(&jobs).into_iter().find(|scc| scc.len() > 1) {
            let mut members: Vec<String> = component.iter().map(|&i| jobs[i].to_string()).collect();
            members.sort();
            return Err(GraphError::CycleDetected(members));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, idx: NodeIndex) -> &InstanceNode {
        &self.graph[idx]
    }

    /// All nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &InstanceNode)> {
        self.graph
            .node_indices()
            .map(move |idx| (idx, &self.graph[idx]))
    }

    /// Jobs in declaration order.
    pub fn templates(&self) -> impl Iterator<Item = &TemplateInfo> {
        self.templates.values()
    }

    pub fn template(&self, name: &str) -> Option<&TemplateInfo> {
        self.templates.get(name)
    }

    pub fn instances_of(&self, template: &str) -> &[NodeIndex] {
        self.templates
            .get(template)
            .map(|t| t.instances.as_slice())
            .unwrap_or_default()
    }

    /// Blocked nodes whose dependencies have all reached a terminal status.
    pub fn ready(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph[idx].status == InstanceStatus::Blocked)
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .all(|dep| self.graph[dep].status.is_terminal())
            })
            .collect()
    }

    /// Statuses of every instance a node depends on.
    pub fn dependency_statuses(&self, idx: NodeIndex) -> Vec<InstanceStatus> {
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|dep| self.graph[dep].status)
            .collect()
    }

    /// Aggregated status of each needed job, as seen by `needs.<job>.result`.
    pub fn dependency_results(&self, idx: NodeIndex) -> BTreeMap<String, InstanceStatus> {
        let template = &self.graph[idx].instance.template;
        self.templates[template.as_str()]
            .needs
            .iter()
            .map(|need| (need.clone(), self.template_status(need)))
            .collect()
    }

    /// A job failed if any instance failed, was cancelled if any was
    /// cancelled, was skipped if all were skipped, and otherwise succeeded
    /// once all instances are terminal.
    pub fn template_status(&self, template: &str) -> InstanceStatus {
        let statuses: Vec<InstanceStatus> = self
            .instances_of(template)
            .iter()
            .map(|&idx| self.graph[idx].status)
            .collect();

        if statuses.contains(&InstanceStatus::Failed) {
            InstanceStatus::Failed
        } else if statuses.contains(&InstanceStatus::Cancelled) {
            InstanceStatus::Cancelled
        } else if let Some(pending) = statuses.iter().find(|s| !s.is_terminal()) {
            *pending
        } else if !statuses.is_empty() && statuses.iter().all(|s| *s == InstanceStatus::Skipped) {
            InstanceStatus::Skipped
        } else {
            InstanceStatus::Succeeded
        }
    }

    /// Move a node to `next` if the transition is allowed. Returns whether it
    /// moved.
    pub fn transition(
        &mut self,
        idx: NodeIndex,
        next: InstanceStatus,
        reason: Option<FailureReason>,
    ) -> bool {
        let node = &mut self.graph[idx];
        if !node.status.can_transition_to(next) {
            debug!(
                instance = %node.instance.key,
                from = %node.status,
                to = %next,
                "Ignoring status transition"
            );
            return false;
        }

        let now = Utc::now();
        if next == InstanceStatus::Running {
            node.started_at = Some(now);
        }
        if next.is_terminal() {
            node.completed_at = Some(now);
        }
        node.status = next;
        node.reason = reason;
        true
    }

    /// Record what a finished worker reported.
    pub fn record_outcome(&mut self, idx: NodeIndex, outcome: InstanceOutcome) -> bool {
        let moved = self.transition(idx, outcome.status, outcome.reason.clone());
        if moved {
            self.graph[idx].outcome = Some(outcome);
        }
        moved
    }

    pub fn is_complete(&self) -> bool {
        self.graph
            .node_indices()
            .all(|idx| self.graph[idx].status.is_terminal())
    }

    /// Nodes in dependency order.
    pub fn topological_order(&self) -> Vec<NodeIndex> {
        // Cycles are rejected by `build`.
        toposort(&self.graph, None).unwrap_or_default()
    }

    /// Groups of nodes that can run in parallel, each wave depending only on
    /// earlier ones.
    pub fn waves(&self) -> Vec<Vec<NodeIndex>> {
        let mut level: HashMap<NodeIndex, usize> = HashMap::new();
        let mut waves: Vec<Vec<NodeIndex>> = Vec::new();

        for idx in self.topological_order() {
            let depth = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .filter_map(|dep| level.get(&dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            level.insert(idx, depth);
            if waves.len() <= depth {
                waves.resize_with(depth + 1, Vec::new);
            }
            waves[depth].push(idx);
        }

        for wave in &mut waves {
            wave.sort();
        }
        waves
    }

    /// Final per-instance report, in declaration order.
    pub fn reports(&self) -> Vec<InstanceReport> {
        self.nodes()
            .map(|(_, node)| {
                let (steps, artifacts) = node
                    .outcome
                    .as_ref()
                    .map(|o| (o.steps.clone(), o.artifacts.clone()))
                    .unwrap_or_default();
                InstanceReport {
                    key: node.instance.key.clone(),
                    template: node.instance.template.clone(),
                    display_name: node.instance.display_name.clone(),
                    matrix: node.instance.matrix.clone(),
                    status: node.status,
                    reason: node.reason.clone(),
                    steps,
                    artifacts,
                    started_at: node.started_at,
                    completed_at: node.completed_at,
                }
            })
            .collect()
    }
}
