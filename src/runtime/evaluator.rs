use std::collections::HashMap;

use evalexpr::{
    build_operator_tree, ContextWithMutableVariables, DefaultNumericTypes, HashMapContext,
};
use serde_json::{json, Value};

use crate::error::{Result, WorkflowError};

/// Pluggable expression capability. The core never embeds a scripting
/// runtime; hook assignments, timer delays and for-each collections are
/// resolved through this interface.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &HashMap<String, Value>) -> Result<Value>;
}

/// Strips the `${...}` template wrapper if present.
pub fn strip_template(expression: &str) -> Option<&str> {
    expression
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
}

/// Default evaluator backed by evalexpr. Scope variables of string, number
/// and boolean type are visible to expressions; anything else is skipped.
#[derive(Debug, Default)]
pub struct ExprEvaluator;

impl Evaluator for ExprEvaluator {
    fn evaluate(&self, expression: &str, scope: &HashMap<String, Value>) -> Result<Value> {
        let source = strip_template(expression).unwrap_or(expression);
        let compiled = build_operator_tree(source).map_err(|e| WorkflowError::Evaluation {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

        let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
        for (name, value) in scope {
            let eval_val = match value {
                Value::String(s) => Some(evalexpr::Value::String(s.clone())),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Some(evalexpr::Value::Int(i))
                    } else {
                        n.as_f64().map(evalexpr::Value::Float)
                    }
                }
                Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
                _ => None,
            };
            if let Some(ev) = eval_val {
                let _ = eval_ctx.set_value(name.clone(), ev);
            }
        }

        let result =
            compiled
                .eval_with_context(&eval_ctx)
                .map_err(|e| WorkflowError::Evaluation {
                    expression: expression.to_string(),
                    reason: e.to_string(),
                })?;
        Ok(to_json(result))
    }
}

fn to_json(value: evalexpr::Value<DefaultNumericTypes>) -> Value {
    match value {
        evalexpr::Value::String(s) => Value::String(s),
        evalexpr::Value::Int(i) => json!(i),
        evalexpr::Value::Float(f) => json!(f),
        evalexpr::Value::Boolean(b) => Value::Bool(b),
        evalexpr::Value::Tuple(items) => Value::Array(items.into_iter().map(to_json).collect()),
        evalexpr::Value::Empty => Value::Null,
    }
}
