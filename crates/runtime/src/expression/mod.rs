//! Expression boundary
//!
//! The runtime evaluates conditions (`run_if`, `retry_until`), collections
//! (`for_each`, gather `items`) and argument templates through an
//! [`ExpressionEvaluator`]. Bindings are the JSON view produced by
//! [`ExecutionContext::bindings`](crate::ExecutionContext::bindings).
//!
//! Templates are JSON values whose strings may embed `${{ expr }}`. A string
//! that is exactly one expression evaluates to the expression's value; mixed
//! text is interpolated into a string.

mod evaluator;

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

pub use evaluator::TemplateEvaluator;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// Errors from parsing or evaluating expressions
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("syntax error in `{expr}`: {message}")]
    Syntax { expr: String, message: String },

    #[error("cannot evaluate `{expr}`: {message}")]
    Eval { expr: String, message: String },

    #[error("unterminated expression in template `{0}`")]
    UnterminatedTemplate(String),
}

impl ExpressionError {
    /// The offending snippet
    pub fn snippet(&self) -> &str {
        match self {
            ExpressionError::Syntax { expr, .. } | ExpressionError::Eval { expr, .. } => expr,
            ExpressionError::UnterminatedTemplate(t) => t,
        }
    }
}

/// Evaluates single expressions against JSON bindings
pub trait ExpressionEvaluator: Send + Sync + 'static {
    /// Check syntax without evaluating
    fn validate(&self, expr: &str) -> Result<(), ExpressionError>;

    /// Evaluate to a value
    fn eval(&self, expr: &str, bindings: &Value) -> Result<Value, ExpressionError>;

    /// Evaluate and coerce to a boolean
    fn eval_bool(&self, expr: &str, bindings: &Value) -> Result<bool, ExpressionError> {
        Ok(truthy(&self.eval(expr, bindings)?))
    }
}

/// Truthiness used for conditions
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// A piece of a template string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    /// Expression source between the delimiters, trimmed
    Expr(&'a str),
}

/// Split a string into literal text and `${{ }}` expressions
pub fn segments(template: &str) -> Result<Vec<Segment<'_>>, ExpressionError> {
    let mut parts = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            parts.push(Segment::Text(&rest[..start]));
        }
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| ExpressionError::UnterminatedTemplate(template.to_string()))?;
        parts.push(Segment::Expr(after[..end].trim()));
        rest = &after[end + CLOSE.len()..];
    }
    if !rest.is_empty() {
        parts.push(Segment::Text(rest));
    }
    Ok(parts)
}

/// Strip one `${{ }}` wrapper from a condition, if present
///
/// `run_if`, `retry_until`, `for_each` and gather `items` accept either a
/// bare expression or a single wrapped one.
pub fn unwrap_expression(source: &str) -> &str {
    let trimmed = source.trim();
    if let Some(inner) = trimmed
        .strip_prefix(OPEN)
        .and_then(|s| s.strip_suffix(CLOSE))
    {
        if !inner.contains(OPEN) {
            return inner.trim();
        }
    }
    trimmed
}

/// Whether a string contains any template expression
pub fn is_template(source: &str) -> bool {
    source.contains(OPEN)
}

/// Render a template against bindings
///
/// Expressions rooted at any name in `deferred` are left verbatim so a later
/// pass (with those bindings present) can substitute them.
pub fn render(
    evaluator: &dyn ExpressionEvaluator,
    template: &Value,
    bindings: &Value,
    deferred: &[&str],
) -> Result<Value, ExpressionError> {
    match template {
        Value::String(s) => render_string(evaluator, s, bindings, deferred),
        Value::Array(items) => items
            .iter()
            .map(|item| render(evaluator, item, bindings, deferred))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render(evaluator, v, bindings, deferred)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(
    evaluator: &dyn ExpressionEvaluator,
    source: &str,
    bindings: &Value,
    deferred: &[&str],
) -> Result<Value, ExpressionError> {
    let parts = segments(source)?;
    match parts.as_slice() {
        [] => Ok(Value::String(String::new())),
        [Segment::Text(text)] => Ok(Value::String((*text).to_string())),
        [Segment::Expr(expr)] if !is_deferred(expr, deferred) => evaluator.eval(expr, bindings),
        _ => {
            let mut out = String::new();
            for part in parts {
                match part {
                    Segment::Text(text) => out.push_str(text),
                    Segment::Expr(expr) if is_deferred(expr, deferred) => {
                        out.push_str(&format!("{} {} {}", OPEN, expr, CLOSE));
                    }
                    Segment::Expr(expr) => match evaluator.eval(expr, bindings)? {
                        Value::String(s) => out.push_str(&s),
                        Value::Null => {}
                        other => out.push_str(&other.to_string()),
                    },
                }
            }
            Ok(Value::String(out))
        }
    }
}

fn is_deferred(expr: &str, deferred: &[&str]) -> bool {
    deferred.iter().any(|root| {
        expr.strip_prefix(root)
            .map(|rest| rest.is_empty() || rest.starts_with('.') || rest.starts_with('['))
            .unwrap_or(false)
    })
}

/// Check every embedded expression of a template for syntax errors
pub fn validate_template(
    evaluator: &dyn ExpressionEvaluator,
    template: &Value,
) -> Result<(), ExpressionError> {
    match template {
        Value::String(s) => {
            for part in segments(s)? {
                if let Segment::Expr(expr) = part {
                    evaluator.validate(expr)?;
                }
            }
            Ok(())
        }
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| validate_template(evaluator, item)),
        Value::Object(map) => map
            .values()
            .try_for_each(|v| validate_template(evaluator, v)),
        _ => Ok(()),
    }
}

fn secret_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{\{\s*SECRETS\.([A-Za-z_][A-Za-z0-9_]*)").expect("valid secret pattern")
    })
}

/// Names of secrets referenced as `${{ SECRETS.<name>... }}` anywhere in a template
pub fn secret_names(template: &Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_secret_names(template, &mut names);
    names
}

fn collect_secret_names(template: &Value, names: &mut BTreeSet<String>) {
    match template {
        Value::String(s) => {
            for cap in secret_ref_pattern().captures_iter(s) {
                names.insert(cap[1].to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_secret_names(v, names)),
        Value::Object(map) => map.values().for_each(|v| collect_secret_names(v, names)),
        _ => {}
    }
}
