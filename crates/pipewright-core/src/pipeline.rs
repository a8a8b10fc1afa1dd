//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML configuration.

use crate::{Error, Result};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    #[serde(default = "default_version")]
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub jobs: Vec<JobDefinition>,
    /// Cancel every job that has not started once any job fails.
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub artifacts: Option<ArtifactConfig>,
}

fn default_version() -> String {
    "1".to_string()
}

impl PipelineDefinition {
    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_minutes.map(minutes)
    }

    pub fn retention_days(&self) -> Option<u32> {
        self.artifacts.as_ref().and_then(|a| a.retention_days)
    }

    /// Check the shape of every job and step.
    ///
    /// Graph-level problems (unknown `needs`, cycles) and matrix problems are
    /// reported by the graph builder.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("pipeline name is empty".to_string()));
        }
        if self.jobs.is_empty() {
            return Err(Error::Configuration(format!(
                "pipeline {} has no jobs",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if !seen.insert(job.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate job name: {}",
                    job.name
                )));
            }
            job.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerConfig {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub branches_ignore: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Push,
    PullRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default, alias = "if")]
    pub condition: Option<ConditionExpression>,
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    pub steps: Vec<StepDefinition>,
}

impl JobDefinition {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_minutes.map(minutes)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(['[', ']', '.', ' ']) {
            return Err(Error::Configuration(format!(
                "invalid job name {:?}: names must be non-empty and must not contain spaces, dots or brackets",
                self.name
            )));
        }
        if self.steps.is_empty() {
            return Err(Error::Configuration(format!(
                "job {} has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "job {} has duplicate step name: {}",
                    self.name, step.name
                )));
            }
            step.validate(&self.name)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// External action id, e.g. `artifact/upload@v1`.
    #[serde(default)]
    pub action: Option<String>,
    /// Inputs passed to the action.
    #[serde(default)]
    pub with: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default, alias = "if")]
    pub condition: Option<ConditionExpression>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_shell() -> String {
    "sh".to_string()
}

impl StepDefinition {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_minutes.map(minutes)
    }

    fn validate(&self, job: &str) -> Result<()> {
        match (&self.action, &self.run) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err(Error::Configuration(format!(
                "step {} in job {} sets both `action` and `run`",
                self.name, job
            ))),
            (None, None) => Err(Error::Configuration(format!(
                "step {} in job {} needs either `action` or `run`",
                self.name, job
            ))),
        }
    }
}

/// A job or step guard.
///
/// Either a plain expression (`event == 'push'`) or the structured
/// `{ if, unless }` form, which holds when `if` holds and `unless` does not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ConditionExpression {
    Simple(String),
    Structured {
        #[serde(rename = "if", default)]
        if_expr: Option<String>,
        #[serde(default)]
        unless: Option<String>,
    },
}

impl ConditionExpression {
    /// The individual expression strings making up this guard.
    pub fn sources(&self) -> Vec<&str> {
        match self {
            ConditionExpression::Simple(expr) => vec![expr.as_str()],
            ConditionExpression::Structured { if_expr, unless } => if_expr
                .iter()
                .chain(unless.iter())
                .map(String::as_str)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatrixConfig {
    /// Axes in declaration order. The first axis varies slowest.
    #[serde(default, alias = "axes")]
    pub dimensions: IndexMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    pub include: Vec<IndexMap<String, serde_json::Value>>,
    #[serde(default)]
    pub exclude: Vec<IndexMap<String, serde_json::Value>>,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default)]
    pub max_parallel: Option<u32>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactConfig {
    /// Days sealed artifacts are kept. Unset falls back to the runner's default.
    #[serde(default)]
    pub retention_days: Option<u32>,
}

fn minutes(value: u32) -> Duration {
    Duration::from_secs(u64::from(value) * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            display_name: None,
            action: None,
            with: BTreeMap::new(),
            run: Some("true".to_string()),
            shell: default_shell(),
            working_directory: None,
            variables: BTreeMap::new(),
            condition: None,
            timeout_minutes: None,
            continue_on_error: false,
        }
    }

    fn job(name: &str, steps: Vec<StepDefinition>) -> JobDefinition {
        JobDefinition {
            name: name.to_string(),
            display_name: None,
            needs: vec![],
            condition: None,
            matrix: None,
            variables: BTreeMap::new(),
            working_directory: None,
            timeout_minutes: None,
            steps,
        }
    }

    fn pipeline(jobs: Vec<JobDefinition>) -> PipelineDefinition {
        PipelineDefinition {
            version: default_version(),
            name: "ci".to_string(),
            description: None,
            triggers: vec![],
            variables: BTreeMap::new(),
            jobs,
            fail_fast: false,
            max_parallel: None,
            timeout_minutes: None,
            artifacts: None,
        }
    }

    #[test]
    fn test_validate_accepts_simple_pipeline() {
        let def = pipeline(vec![job("build", vec![step("compile")])]);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_jobs() {
        let def = pipeline(vec![
            job("build", vec![step("compile")]),
            job("build", vec![step("compile")]),
        ]);
        assert!(def.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_validate_rejects_step_with_action_and_run() {
        let mut bad = step("both");
        bad.action = Some("artifact/upload".to_string());
        let def = pipeline(vec![job("build", vec![bad])]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bracketed_job_name() {
        let def = pipeline(vec![job("build[x]", vec![step("compile")])]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_structured_condition_sources() {
        let cond = ConditionExpression::Structured {
            if_expr: Some("event == 'push'".to_string()),
            unless: Some("branch == 'wip'".to_string()),
        };
        assert_eq!(cond.sources(), vec!["event == 'push'", "branch == 'wip'"]);
    }
}
