//! Command handlers.

use crate::commands::{EventArg, TriggerArgs};
use crate::config::CliConfig;
use crate::progress;
use anyhow::{Context, Result, bail};
use chrono::Utc;
use console::style;
use pipewright_artifacts::{FilesystemArtifactStore, MemoryArtifactStore, RetentionPolicy};
use pipewright_core::bus::BroadcastEventBus;
use pipewright_core::expression::{ExpressionContext, StatusScope, condition_passes};
use pipewright_core::pipeline::PipelineDefinition;
use pipewright_core::ports::{ArtifactStore, EventBus};
use pipewright_core::run::{InstanceStatus, RunContext, RunStatus};
use pipewright_runner::{ActionRegistry, RunnerConfig, StepRunner};
use pipewright_scheduler::{
    ExecutionGraph, Orchestrator, OrchestratorConfig, TriggerMatcher, lint_conditions,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const STARTER: &str = include_str!("../../../demos/pipeline.yaml");

/// Write a starter pipeline.
pub fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("{} {} already exists", style("!").yellow(), path.display());
        return Ok(());
    }
    std::fs::write(path, STARTER).with_context(|| format!("writing {}", path.display()))?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(())
}

/// Parse a pipeline file.
pub fn load_pipeline(path: &Path) -> Result<PipelineDefinition> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn build_graph(definition: &PipelineDefinition) -> Result<ExecutionGraph> {
    definition.validate()?;
    Ok(ExecutionGraph::build(definition)?)
}

/// Validate a pipeline configuration.
pub fn validate(path: &Path) -> Result<()> {
    let definition = load_pipeline(path)?;
    let graph = build_graph(&definition)?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        definition.name
    );
    println!("  Jobs: {}, instances: {}", definition.jobs.len(), graph.len());
    for template in graph.templates() {
        let needs = if template.needs.is_empty() {
            String::new()
        } else {
            format!(" needs {}", template.needs.join(", "))
        };
        println!(
            "    - {} ({} instance{}){}",
            template.name,
            template.instances.len(),
            if template.instances.len() == 1 { "" } else { "s" },
            style(needs).dim()
        );
    }

    for (subject, error) in lint_conditions(&definition) {
        println!(
            "{} condition of {subject} will always be false: {error}",
            style("!").yellow()
        );
    }
    Ok(())
}

fn run_context(args: &TriggerArgs) -> RunContext {
    let context = match args.event {
        EventArg::Push => RunContext::push(&args.git_ref),
        EventArg::PullRequest => RunContext::pull_request(&args.git_ref, &args.base_ref),
    };
    match &args.sha {
        Some(sha) => context.with_sha(sha),
        None => context,
    }
}

/// A plan line: instance key, and why it would not run if its guard already
/// rules it out with every dependency succeeding.
fn plan_waves(graph: &ExecutionGraph, context: &RunContext) -> Vec<Vec<(String, Option<&'static str>)>> {
    let needs: BTreeMap<String, InstanceStatus> = graph
        .templates()
        .map(|t| (t.name.clone(), InstanceStatus::Succeeded))
        .collect();

    graph
        .waves()
        .into_iter()
        .map(|wave| {
            wave.into_iter()
                .map(|idx| {
                    let instance = &graph.node(idx).instance;
                    let ctx = ExpressionContext::new(context)
                        .with_matrix(&instance.matrix)
                        .with_env(&instance.variables)
                        .with_needs(&needs)
                        .with_status(StatusScope::default());
                    let runs = condition_passes(
                        instance.definition.condition.as_ref(),
                        &ctx,
                        instance.key.as_str(),
                    );
                    (instance.key.to_string(), (!runs).then_some("skipped by condition"))
                })
                .collect()
        })
        .collect()
}

/// Show the instances a trigger would run, in parallel waves.
pub fn plan(args: &TriggerArgs) -> Result<()> {
    let definition = load_pipeline(&args.path)?;
    let graph = build_graph(&definition)?;
    let context = run_context(args);

    if !TriggerMatcher::new().matches(&definition, &context) {
        println!(
            "{} {} on {} does not trigger \"{}\"",
            style("i").blue(),
            context.event,
            context.filter_branch(),
            definition.name
        );
        return Ok(());
    }

    println!(
        "{} on {}",
        style(&definition.name).bold(),
        style(format!("{} {}", context.event, context.git_ref)).dim()
    );
    for (n, wave) in plan_waves(&graph, &context).into_iter().enumerate() {
        println!("  Wave {}", n + 1);
        for (key, note) in wave {
            match note {
                Some(note) => println!("    {} {}", style(key).dim(), style(format!("({note})")).dim()),
                None => println!("    {key}"),
            }
        }
    }
    Ok(())
}

/// Options for a local run.
pub struct RunOptions {
    pub trigger: TriggerArgs,
    pub max_parallel: Option<u32>,
    pub fail_fast: bool,
    pub workspace: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    pub retention_days: Option<u32>,
    pub verbose: bool,
    pub report: Option<PathBuf>,
}

/// Artifact retention: flag, then pipeline, then config.
fn retention_days(flag: Option<u32>, definition: &PipelineDefinition, config: &CliConfig) -> u32 {
    flag.or_else(|| definition.retention_days())
        .unwrap_or(config.retention_days)
}

/// Run a pipeline locally. Returns whether the run succeeded.
pub async fn run(config: &CliConfig, options: RunOptions) -> Result<bool> {
    let definition = load_pipeline(&options.trigger.path)?;
    let context = run_context(&options.trigger);

    let workspace = match options.workspace.or_else(|| config.workspace.clone()) {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let retention = RetentionPolicy::days(retention_days(options.retention_days, &definition, config));
    let store: Arc<dyn ArtifactStore> = match options.artifacts_dir.or_else(|| config.artifacts_dir.clone()) {
        Some(dir) => {
            let store = FilesystemArtifactStore::new(dir).with_retention(retention);
            let removed = store.collect_garbage(Utc::now()).await?;
            if removed > 0 {
                info!(removed, root = %store.root().display(), "Expired artifacts removed");
            }
            Arc::new(store)
        }
        None => Arc::new(MemoryArtifactStore::with_retention(retention)),
    };

    let bus = Arc::new(BroadcastEventBus::new());
    let registry = Arc::new(ActionRegistry::with_builtins(store, bus.clone()));
    let runner = Arc::new(StepRunner::new(
        RunnerConfig {
            workspace,
            ..RunnerConfig::default()
        },
        registry,
        bus.clone(),
    ));
    let orchestrator = Orchestrator::new(runner, bus.clone()).with_config(OrchestratorConfig {
        default_max_parallel: Some(config.max_parallel),
        max_parallel: options.max_parallel,
        fail_fast: options.fail_fast.then_some(true),
        run_timeout: None,
    });

    let events = bus.subscribe("run.>").await?;
    let progress = tokio::spawn(progress::follow(events, options.verbose));

    let Some(handle) = orchestrator.trigger(&definition, context.clone()).await? else {
        progress.abort();
        println!(
            "{} {} on {} does not trigger \"{}\"",
            style("i").blue(),
            context.event,
            context.filter_branch(),
            definition.name
        );
        return Ok(true);
    };

    let canceller = handle.canceller();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let report = handle.wait().await?;
    interrupt.abort();
    let _ = progress.await;

    print!("{}", progress::summary(&report));
    if let Some(path) = &options.report {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    match report.status {
        RunStatus::Succeeded => Ok(true),
        RunStatus::Failed | RunStatus::Cancelled => Ok(false),
        other => bail!("run ended in non-terminal status {other}"),
    }
}

/// Print the pipeline JSON schema.
pub fn schema() -> Result<()> {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Show current configuration.
pub fn show_config(config: &CliConfig) -> Result<()> {
    println!("{}", style(CliConfig::config_path()?.display()).dim());
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

/// Set and persist a configuration value.
pub fn set_config(key: &str, value: &str) -> Result<()> {
    let mut config = CliConfig::load()?;
    config.set(key, value)?;
    config.save()?;
    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn trigger(path: PathBuf, event: EventArg, git_ref: &str) -> TriggerArgs {
        TriggerArgs {
            path,
            event,
            git_ref: git_ref.to_string(),
            base_ref: "main".to_string(),
            sha: None,
        }
    }

    #[test]
    fn test_starter_pipeline_is_valid() {
        let definition: PipelineDefinition = serde_yaml::from_str(STARTER).unwrap();
        let graph = build_graph(&definition).unwrap();
        assert!(graph.len() > 1);
        assert!(lint_conditions(&definition).is_empty());
    }

    #[test]
    fn test_init_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipewright.yaml");
        init(&path, false).unwrap();
        std::fs::write(&path, "custom").unwrap();
        init(&path, false).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "custom");
        init(&path, true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), STARTER);
    }

    #[test]
    fn test_run_context_from_args() {
        let push = run_context(&trigger(PathBuf::new(), EventArg::Push, "release/1.0"));
        assert_eq!(push.git_ref, "refs/heads/release/1.0");
        assert_eq!(push.filter_branch(), "release/1.0");

        let pr = run_context(&trigger(PathBuf::new(), EventArg::PullRequest, "feature/x"));
        assert_eq!(pr.filter_branch(), "main");
        assert_eq!(pr.head_ref.as_deref(), Some("feature/x"));
    }

    #[test]
    fn test_plan_waves_mark_guarded_jobs() {
        let definition: PipelineDefinition = serde_yaml::from_str(
            r#"
name: ci
jobs:
  - name: build
    matrix:
      dimensions:
        os: [linux, macos]
    steps: [{ name: s, run: "true" }]
  - name: mutants
    needs: [build]
    if: event == 'pull_request'
    steps: [{ name: s, run: "true" }]
"#,
        )
        .unwrap();
        let graph = build_graph(&definition).unwrap();

        let push = plan_waves(&graph, &RunContext::push("main"));
        assert_eq!(
            push,
            vec![
                vec![
                    ("build[os=linux]".to_string(), None),
                    ("build[os=macos]".to_string(), None)
                ],
                vec![("mutants".to_string(), Some("skipped by condition"))],
            ]
        );

        let pr = plan_waves(&graph, &RunContext::pull_request("feature/x", "main"));
        assert_eq!(pr[1], vec![("mutants".to_string(), None)]);
    }

    #[test]
    fn test_retention_prefers_flag_then_pipeline_then_config() {
        let config = CliConfig {
            retention_days: 30,
            ..CliConfig::default()
        };
        let plain: PipelineDefinition =
            serde_yaml::from_str("name: ci\njobs: []\n").unwrap();
        let kept: PipelineDefinition =
            serde_yaml::from_str("name: ci\nartifacts:\n  retention_days: 14\njobs: []\n").unwrap();

        assert_eq!(retention_days(None, &plain, &config), 30);
        assert_eq!(retention_days(None, &kept, &config), 14);
        assert_eq!(retention_days(Some(2), &kept, &config), 2);
    }

    #[tokio::test]
    async fn test_run_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = dir.path().join("pipeline.yaml");
        std::fs::write(
            &pipeline,
            r#"
name: local
jobs:
  - name: hello
    steps:
      - name: greet
        run: echo hello > greeting.txt
"#,
        )
        .unwrap();
        let report = dir.path().join("report.json");

        let succeeded = run(
            &CliConfig::default(),
            RunOptions {
                trigger: trigger(pipeline, EventArg::Push, "main"),
                max_parallel: None,
                fail_fast: false,
                workspace: Some(dir.path().to_path_buf()),
                artifacts_dir: None,
                retention_days: None,
                verbose: false,
                report: Some(report.clone()),
            },
        )
        .await
        .unwrap();

        assert!(succeeded);
        assert!(dir.path().join("greeting.txt").exists());
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
        assert_eq!(written["status"], "succeeded");
    }
}
