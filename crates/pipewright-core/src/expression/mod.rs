//! Condition expressions.
//!
//! Guards on jobs and steps are small boolean expressions evaluated against
//! the trigger snapshot, the instance's matrix assignment and environment,
//! and the status of whatever ran before:
//!
//! ```text
//! event == 'pull_request' && startsWith(branch, 'release/')
//! always()
//! matrix.os != 'windows' || failure()
//! ```
//!
//! Evaluation fails closed: a guard that cannot be parsed or evaluated is
//! treated as false and logged, never as a run failure.

mod evaluator;
mod lexer;
mod parser;

pub use evaluator::{ExpressionContext, StatusScope, Value, evaluate};
pub use parser::{BinaryOp, Expr};

use crate::pipeline::ConditionExpression;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("unknown reference: {0}")]
    UnknownReference(String),

    #[error("unknown function: {0}()")]
    UnknownFunction(String),

    #[error("{function}() takes {expected} argument(s), got {found}")]
    Arity {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("unknown matrix axis: {0}")]
    UnknownMatrixAxis(String),
}

impl From<ExpressionError> for crate::Error {
    fn from(err: ExpressionError) -> Self {
        crate::Error::ConditionEvaluation(err.to_string())
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse an expression, with or without a `${{ }}` wrapper.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let inner = strip_wrapper(source);
        let tokens = lexer::tokenize(inner)?;
        let expr = parser::parse(&tokens, inner.len())?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn uses_status_function(&self) -> bool {
        self.expr.uses_status_function()
    }

    /// Raw truthiness of the expression, without the implicit `success()`.
    pub fn evaluate(&self, ctx: &ExpressionContext<'_>) -> Result<bool, ExpressionError> {
        Ok(evaluate(&self.expr, ctx)?.is_truthy())
    }

    pub fn value(&self, ctx: &ExpressionContext<'_>) -> Result<Value, ExpressionError> {
        evaluate(&self.expr, ctx)
    }
}

fn strip_wrapper(source: &str) -> &str {
    let trimmed = source.trim();
    trimmed
        .strip_prefix("${{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map_or(trimmed, str::trim)
}

/// Evaluate a job or step guard.
///
/// A missing guard means `success()`. A guard that calls none of the status
/// functions is treated as `success() && <guard>`.
pub fn evaluate_condition(
    condition: Option<&ConditionExpression>,
    ctx: &ExpressionContext<'_>,
) -> Result<bool, ExpressionError> {
    let Some(condition) = condition else {
        return Ok(ctx.status().success());
    };

    let parsed = match condition {
        ConditionExpression::Simple(expr) => (Some(Condition::parse(expr)?), None),
        ConditionExpression::Structured { if_expr, unless } => (
            if_expr.as_deref().map(Condition::parse).transpose()?,
            unless.as_deref().map(Condition::parse).transpose()?,
        ),
    };
    let (if_cond, unless_cond) = parsed;

    let explicit_status = if_cond
        .iter()
        .chain(unless_cond.iter())
        .any(Condition::uses_status_function);
    if !explicit_status && !ctx.status().success() {
        return Ok(false);
    }

    if let Some(cond) = &if_cond
        && !cond.evaluate(ctx)?
    {
        return Ok(false);
    }
    if let Some(cond) = &unless_cond
        && cond.evaluate(ctx)?
    {
        return Ok(false);
    }
    Ok(true)
}

/// Fail-closed wrapper around [`evaluate_condition`]: errors are logged and
/// read as false.
pub fn condition_passes(
    condition: Option<&ConditionExpression>,
    ctx: &ExpressionContext<'_>,
    subject: &str,
) -> bool {
    match evaluate_condition(condition, ctx) {
        Ok(result) => result,
        Err(e) => {
            warn!(subject = %subject, error = %e, "Condition could not be evaluated, treating as false");
            false
        }
    }
}

/// Check that every expression of a guard parses.
pub fn check_syntax(condition: &ConditionExpression) -> Result<(), ExpressionError> {
    for source in condition.sources() {
        Condition::parse(source)?;
    }
    Ok(())
}
