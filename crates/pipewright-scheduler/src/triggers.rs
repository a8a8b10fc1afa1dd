//! Trigger matching.

use pipewright_core::pattern::glob_match;
use pipewright_core::pipeline::{PipelineDefinition, TriggerConfig, TriggerType};
use pipewright_core::run::{EventKind, RunContext};

/// Decides whether a pipeline runs for a trigger event.
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// A pipeline without triggers runs on every event.
    pub fn matches(&self, pipeline: &PipelineDefinition, context: &RunContext) -> bool {
        if pipeline.triggers.is_empty() {
            return true;
        }

        pipeline
            .triggers
            .iter()
            .any(|trigger| self.trigger_matches(trigger, context))
    }

    fn trigger_matches(&self, trigger: &TriggerConfig, context: &RunContext) -> bool {
        let kind = match trigger.trigger_type {
            TriggerType::Push => EventKind::Push,
            TriggerType::PullRequest => EventKind::PullRequest,
        };
        if kind != context.event {
            return false;
        }

        // Pull requests are filtered on the branch they target.
        let branch = context.filter_branch();
        self.branch_matches(&trigger.branches, branch)
            && !trigger.branches_ignore.iter().any(|p| glob_match(p, branch))
    }

    fn branch_matches(&self, patterns: &[String], branch: &str) -> bool {
        if patterns.is_empty() {
            return true;
        }
        patterns.iter().any(|p| glob_match(p, branch))
    }
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline(triggers: serde_json::Value) -> PipelineDefinition {
        serde_json::from_value(json!({
            "name": "ci",
            "triggers": triggers,
            "jobs": [{ "name": "build", "steps": [{ "name": "b", "run": "true" }] }]
        }))
        .unwrap()
    }

    #[test]
    fn test_no_triggers_match_everything() {
        let matcher = TriggerMatcher::new();
        let def = pipeline(json!([]));
        assert!(matcher.matches(&def, &RunContext::push("feature/x")));
        assert!(matcher.matches(&def, &RunContext::pull_request("feature/x", "main")));
    }

    #[test]
    fn test_branch_match_glob() {
        let matcher = TriggerMatcher::new();
        let def = pipeline(json!([{ "type": "push", "branches": ["main", "release/*"] }]));
        assert!(matcher.matches(&def, &RunContext::push("main")));
        assert!(matcher.matches(&def, &RunContext::push("refs/heads/release/1.0")));
        assert!(!matcher.matches(&def, &RunContext::push("develop")));
        assert!(!matcher.matches(&def, &RunContext::pull_request("x", "main")));
    }

    #[test]
    fn test_pull_request_filters_on_base_branch() {
        let matcher = TriggerMatcher::new();
        let def = pipeline(json!([{ "type": "pull_request", "branches": ["main"] }]));
        assert!(matcher.matches(&def, &RunContext::pull_request("feature/y", "main")));
        assert!(!matcher.matches(&def, &RunContext::pull_request("main", "develop")));
    }

    #[test]
    fn test_branches_ignore() {
        let matcher = TriggerMatcher::new();
        let def = pipeline(json!([{ "type": "push", "branches_ignore": ["dependabot/**"] }]));
        assert!(matcher.matches(&def, &RunContext::push("main")));
        assert!(!matcher.matches(&def, &RunContext::push("dependabot/cargo/serde-1.0")));
    }
}
