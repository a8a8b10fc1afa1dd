//! Expression evaluation against a run context.

use super::ExpressionError;
use super::parser::{BinaryOp, Expr};
use crate::pattern::glob_match;
use crate::run::{InstanceStatus, MatrixAssignment, RunContext, StepOutcome, StepStatus};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map_or(Value::Null, Value::Number),
            serde_json::Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }
    }

    fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
            (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
                s.trim().parse::<f64>().is_ok_and(|parsed| parsed == *n)
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => f.write_str(s),
        }
    }
}

/// Outcome of whatever a status function ranges over: the dependencies of an
/// instance, or the prior steps of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusScope {
    pub all_succeeded: bool,
    pub any_failed: bool,
    pub cancelled: bool,
}

impl Default for StatusScope {
    fn default() -> Self {
        Self {
            all_succeeded: true,
            any_failed: false,
            cancelled: false,
        }
    }
}

impl StatusScope {
    /// Scope over dependency instance statuses.
    pub fn from_dependencies<'a>(
        statuses: impl IntoIterator<Item = &'a InstanceStatus>,
        cancelled: bool,
    ) -> Self {
        let mut scope = Self {
            cancelled,
            ..Self::default()
        };
        for status in statuses {
            if *status != InstanceStatus::Succeeded {
                scope.all_succeeded = false;
            }
            if *status == InstanceStatus::Failed {
                scope.any_failed = true;
            }
        }
        scope
    }

    /// Scope over the steps that ran before the current one. Tolerated
    /// failures (`continue_on_error`) count as successes.
    pub fn from_steps(steps: &[StepOutcome], cancelled: bool) -> Self {
        let failed = steps
            .iter()
            .any(|s| s.status == StepStatus::Failed && !s.continue_on_error);
        Self {
            all_succeeded: !failed,
            any_failed: failed,
            cancelled,
        }
    }

    pub fn success(&self) -> bool {
        self.all_succeeded && !self.cancelled
    }
}

/// Everything references and status functions can see.
#[derive(Debug, Clone, Copy)]
pub struct ExpressionContext<'a> {
    run: &'a RunContext,
    matrix: Option<&'a MatrixAssignment>,
    env: Option<&'a BTreeMap<String, String>>,
    needs: Option<&'a BTreeMap<String, InstanceStatus>>,
    steps: &'a [StepOutcome],
    status: StatusScope,
}

impl<'a> ExpressionContext<'a> {
    pub fn new(run: &'a RunContext) -> Self {
        Self {
            run,
            matrix: None,
            env: None,
            needs: None,
            steps: &[],
            status: StatusScope::default(),
        }
    }

    pub fn with_matrix(mut self, matrix: &'a MatrixAssignment) -> Self {
        self.matrix = Some(matrix);
        self
    }

    pub fn with_env(mut self, env: &'a BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_needs(mut self, needs: &'a BTreeMap<String, InstanceStatus>) -> Self {
        self.needs = Some(needs);
        self
    }

    pub fn with_steps(mut self, steps: &'a [StepOutcome]) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_status(mut self, status: StatusScope) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> StatusScope {
        self.status
    }
}

pub fn evaluate(expr: &Expr, ctx: &ExpressionContext<'_>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Reference(path) => resolve(path, ctx),
        Expr::Not(inner) => Ok(Value::Bool(!evaluate(inner, ctx)?.is_truthy())),
        Expr::Binary { op, left, right } => match op {
            BinaryOp::And => {
                if !evaluate(left, ctx)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(evaluate(right, ctx)?.is_truthy()))
            }
            BinaryOp::Or => {
                if evaluate(left, ctx)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(evaluate(right, ctx)?.is_truthy()))
            }
            BinaryOp::Eq => {
                let l = evaluate(left, ctx)?;
                let r = evaluate(right, ctx)?;
                Ok(Value::Bool(l.loosely_equals(&r)))
            }
            BinaryOp::Ne => {
                let l = evaluate(left, ctx)?;
                let r = evaluate(right, ctx)?;
                Ok(Value::Bool(!l.loosely_equals(&r)))
            }
        },
        Expr::Call { name, args } => call(name, args, ctx),
    }
}

fn call(name: &str, args: &[Expr], ctx: &ExpressionContext<'_>) -> Result<Value, ExpressionError> {
    let lowered = name.to_ascii_lowercase();
    let arity = match lowered.as_str() {
        "success" | "failure" | "always" | "cancelled" => 0,
        "startswith" | "endswith" | "contains" | "matches" => 2,
        _ => return Err(ExpressionError::UnknownFunction(name.to_string())),
    };
    if args.len() != arity {
        return Err(ExpressionError::Arity {
            function: name.to_string(),
            expected: arity,
            found: args.len(),
        });
    }

    let status = ctx.status;
    let result = match lowered.as_str() {
        "success" => status.success(),
        "failure" => status.any_failed,
        "always" => true,
        "cancelled" => status.cancelled,
        _ => {
            let haystack = evaluate(&args[0], ctx)?.to_string();
            let needle = evaluate(&args[1], ctx)?.to_string();
            match lowered.as_str() {
                "startswith" => haystack.to_lowercase().starts_with(&needle.to_lowercase()),
                "endswith" => haystack.to_lowercase().ends_with(&needle.to_lowercase()),
                "contains" => haystack.to_lowercase().contains(&needle.to_lowercase()),
                _ => glob_match(&needle, &haystack),
            }
        }
    };
    Ok(Value::Bool(result))
}

fn resolve(path: &[String], ctx: &ExpressionContext<'_>) -> Result<Value, ExpressionError> {
    let segments: Vec<&str> = path.iter().map(String::as_str).collect();
    let run = ctx.run;
    let optional = |value: Option<&String>| value.map_or(Value::Null, |v| Value::String(v.clone()));

    match segments.as_slice() {
        ["event"] | ["github", "event_name"] => Ok(Value::String(run.event.as_str().to_string())),
        ["ref"] | ["github", "ref"] => Ok(Value::String(run.git_ref.clone())),
        ["branch"] | ["github", "ref_name"] => Ok(Value::String(run.branch().to_string())),
        ["base_ref"] | ["github", "base_ref"] => Ok(optional(run.base_ref.as_ref())),
        ["head_ref"] | ["github", "head_ref"] => Ok(optional(run.head_ref.as_ref())),
        ["sha"] | ["github", "sha"] => Ok(optional(run.sha.as_ref())),
        ["actor"] | ["github", "actor"] => Ok(optional(run.actor.as_ref())),
        ["matrix", axis] => ctx
            .matrix
            .and_then(|m| m.get(axis))
            .map(Value::from_json)
            .ok_or_else(|| ExpressionError::UnknownMatrixAxis(axis.to_string())),
        ["env", name] => Ok(optional(ctx.env.and_then(|env| env.get(*name)))),
        ["needs", job, "result"] => ctx
            .needs
            .and_then(|needs| needs.get(*job))
            .map(|status| Value::String(status.result_str().to_string()))
            .ok_or_else(|| ExpressionError::UnknownReference(path.join("."))),
        ["steps", step, "outcome" | "conclusion"] => Ok(ctx
            .steps
            .iter()
            .find(|s| s.name == *step)
            .map_or(Value::Null, |s| {
                Value::String(s.status.result_str().to_string())
            })),
        ["steps", step, "outputs", key] => Ok(ctx
            .steps
            .iter()
            .find(|s| s.name == *step)
            .and_then(|s| s.outputs.get(*key))
            .map_or(Value::Null, |v| Value::String(v.clone()))),
        _ => Err(ExpressionError::UnknownReference(path.join("."))),
    }
}
