//! `${{ … }}` placeholder interpolation.
//!
//! Each placeholder is evaluated with the condition expression engine, so
//! anything a guard can reference is available:
//! - `${{ matrix.os }}` - matrix value
//! - `${{ env.VAR }}` - job or step variable
//! - `${{ steps.name.outputs.key }}` - output of an earlier step
//! - `${{ branch }}`, `${{ github.sha }}` - trigger metadata

use crate::expression::{Condition, ExpressionContext};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::warn;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*(.+?)\s*\}\}").expect("placeholder pattern is valid")
});

/// Replace every placeholder in `input`. Placeholders that fail to evaluate
/// become empty strings.
pub fn interpolate(input: &str, ctx: &ExpressionContext<'_>) -> String {
    if !input.contains("${{") {
        return input.to_string();
    }

    PLACEHOLDER
        .replace_all(input, |caps: &Captures<'_>| {
            let expr = caps.get(1).map_or("", |m| m.as_str());
            match Condition::parse(expr).and_then(|c| c.value(ctx)) {
                Ok(value) => value.to_string(),
                Err(e) => {
                    warn!(expression = %expr, error = %e, "Failed to interpolate placeholder");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Interpolate every value of a map.
pub fn interpolate_map(
    values: &BTreeMap<String, String>,
    ctx: &ExpressionContext<'_>,
) -> BTreeMap<String, String> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), interpolate(v, ctx)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{MatrixAssignment, RunContext, StepOutcome, StepStatus};
    use serde_json::json;

    #[test]
    fn test_matrix_and_env_placeholders() {
        let run = RunContext::push("main");
        let mut matrix = MatrixAssignment::new();
        matrix.insert("os", json!("linux"));
        let mut env = BTreeMap::new();
        env.insert("PROFILE".to_string(), "release".to_string());
        let ctx = ExpressionContext::new(&run).with_matrix(&matrix).with_env(&env);

        assert_eq!(
            interpolate("cargo build --${{ env.PROFILE }} # ${{matrix.os}}", &ctx),
            "cargo build --release # linux"
        );
    }

    #[test]
    fn test_step_outputs() {
        let run = RunContext::push("main");
        let mut outputs = BTreeMap::new();
        outputs.insert("version".to_string(), "0.4.2".to_string());
        let steps = vec![StepOutcome {
            name: "version".to_string(),
            status: StepStatus::Succeeded,
            exit_code: Some(0),
            reason: None,
            outputs,
            continue_on_error: false,
            duration_ms: 0,
        }];
        let ctx = ExpressionContext::new(&run).with_steps(&steps);
        assert_eq!(
            interpolate("dist/app-${{ steps.version.outputs.version }}.tar", &ctx),
            "dist/app-0.4.2.tar"
        );
    }

    #[test]
    fn test_unknown_placeholder_becomes_empty() {
        let run = RunContext::push("main");
        let ctx = ExpressionContext::new(&run);
        assert_eq!(interpolate("a${{ matrix.nope }}b", &ctx), "ab");
        assert_eq!(interpolate("no placeholders", &ctx), "no placeholders");
    }
}
