//! Condition tree evaluation with type-coerced comparisons.
//!
//! Outcome per (rule, point) is `Ok(true) | Ok(false) | Err(..)`. An error
//! fails that rule for that point (error metric bumped by the engine), the
//! point keeps flowing and later rules still run.

use thiserror::Error;

use crate::types::{Condition, DataPoint, Operator, Value};

use super::expr::{EvalContext, ExprCache, ExprError};
use super::RegexCache;

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("Field '{0}' cannot be resolved")]
    Field(String),

    #[error("Operator {op:?} not applicable to {field} of type {got}")]
    Type {
        op: Operator,
        field: String,
        got: &'static str,
    },

    #[error("Bad literal for {0:?}: {1}")]
    Literal(Operator, String),

    #[error("Regex error: {0}")]
    Regex(String),

    #[error(transparent)]
    Expr(#[from] ExprError),
}

/// Resolved view of one point field.
#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Num(f64),
    Str(String),
    Bool(bool),
    /// Tag not present / composite with no scalar view
    Missing,
}

impl FieldValue {
    fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Num(_) => "number",
            FieldValue::Str(_) => "string",
            FieldValue::Bool(_) => "bool",
            FieldValue::Missing => "missing",
        }
    }
}

/// Evaluate a condition tree against one point.
pub fn evaluate_condition(
    condition: &Condition,
    point: &DataPoint,
    series: Option<&[f64]>,
    regex_cache: &RegexCache,
    expr_cache: &ExprCache,
) -> Result<bool, ConditionError> {
    match condition {
        Condition::Simple {
            field,
            operator,
            value,
        } => eval_simple(field, *operator, value, point, regex_cache),
        Condition::And { conditions } => {
            for c in conditions {
                if !evaluate_condition(c, point, series, regex_cache, expr_cache)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Condition::Or { conditions } => {
            for c in conditions {
                if evaluate_condition(c, point, series, regex_cache, expr_cache)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Condition::Not { condition } => {
            Ok(!evaluate_condition(condition, point, series, regex_cache, expr_cache)?)
        }
        Condition::Expression { script } => {
            let ctx = EvalContext {
                point,
                series,
                regex_cache,
            };
            Ok(expr_cache.eval(script, &ctx)?.truthy())
        }
    }
}

fn eval_simple(
    field: &str,
    op: Operator,
    literal: &serde_json::Value,
    point: &DataPoint,
    regex_cache: &RegexCache,
) -> Result<bool, ConditionError> {
    let value = resolve_field(field, point);

    match op {
        Operator::Exists => Ok(!matches!(value, FieldValue::Missing)),

        Operator::Eq | Operator::Ne => {
            let eq = match &value {
                FieldValue::Missing => false,
                other => loose_eq(other, literal),
            };
            Ok(if op == Operator::Eq { eq } else { !eq })
        }

        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let ord = ordering(field, op, &value, literal)?;
            Ok(match op {
                Operator::Gt => ord == std::cmp::Ordering::Greater,
                Operator::Gte => ord != std::cmp::Ordering::Less,
                Operator::Lt => ord == std::cmp::Ordering::Less,
                Operator::Lte => ord != std::cmp::Ordering::Greater,
                _ => unreachable!(),
            })
        }

        Operator::Contains | Operator::Startswith | Operator::Endswith => {
            let hay = as_string(field, op, &value)?;
            let needle = literal
                .as_str()
                .ok_or_else(|| bad_literal(op, literal))?;
            Ok(match op {
                Operator::Contains => hay.contains(needle),
                Operator::Startswith => hay.starts_with(needle),
                _ => hay.ends_with(needle),
            })
        }

        Operator::Regex => {
            let hay = as_string(field, op, &value)?;
            let pattern = literal
                .as_str()
                .ok_or_else(|| bad_literal(op, literal))?;
            let re = regex_cache
                .get_or_compile(pattern)
                .map_err(|e| ConditionError::Regex(e.to_string()))?;
            Ok(re.is_match(&hay))
        }

        Operator::In => {
            let candidates = literal
                .as_array()
                .ok_or_else(|| bad_literal(op, literal))?;
            if matches!(value, FieldValue::Missing) {
                return Ok(false);
            }
            Ok(candidates.iter().any(|c| loose_eq(&value, c)))
        }

        Operator::Between => {
            let bounds = literal
                .as_array()
                .filter(|a| a.len() == 2)
                .ok_or_else(|| bad_literal(op, literal))?;
            let (lo, hi) = match (bounds[0].as_f64(), bounds[1].as_f64()) {
                (Some(lo), Some(hi)) => (lo, hi),
                _ => return Err(bad_literal(op, literal)),
            };
            let v = match value {
                FieldValue::Num(n) => n,
                other => {
                    return Err(ConditionError::Type {
                        op,
                        field: field.to_string(),
                        got: other.type_name(),
                    })
                }
            };
            Ok(v >= lo && v <= hi)
        }
    }
}

fn bad_literal(op: Operator, literal: &serde_json::Value) -> ConditionError {
    ConditionError::Literal(op, literal.to_string())
}

fn resolve_field(field: &str, point: &DataPoint) -> FieldValue {
    match field {
        "value" => match &point.value {
            Value::String(s) => FieldValue::Str(s.clone()),
            Value::Bool(b) => FieldValue::Bool(*b),
            other => other.as_f64().map_or(FieldValue::Missing, FieldValue::Num),
        },
        "key" => FieldValue::Str(point.key.clone()),
        "device_id" => FieldValue::Str(point.device_id.clone()),
        "quality" => FieldValue::Num(f64::from(point.quality)),
        "timestamp" => FieldValue::Num(point.timestamp.timestamp() as f64),
        tag if tag.starts_with("tags.") => point.tags.get(&tag["tags.".len()..])
            .map_or(FieldValue::Missing, FieldValue::Str),
        _ => FieldValue::Missing,
    }
}

/// Equality with numeric/boolean coercion; mismatched types are unequal,
/// never an error.
fn loose_eq(value: &FieldValue, literal: &serde_json::Value) -> bool {
    match (value, literal) {
        (FieldValue::Num(a), serde_json::Value::Number(b)) => {
            b.as_f64().is_some_and(|b| *a == b)
        }
        (FieldValue::Str(a), serde_json::Value::String(b)) => a == b,
        (FieldValue::Bool(a), serde_json::Value::Bool(b)) => a == b,
        (FieldValue::Num(a), serde_json::Value::Bool(b)) => *a == if *b { 1.0 } else { 0.0 },
        _ => false,
    }
}

/// Ordering comparison; mismatched types are an error for ordering ops.
fn ordering(
    field: &str,
    op: Operator,
    value: &FieldValue,
    literal: &serde_json::Value,
) -> Result<std::cmp::Ordering, ConditionError> {
    match (value, literal) {
        (FieldValue::Num(a), serde_json::Value::Number(b)) => {
            let b = b.as_f64().ok_or_else(|| bad_literal(op, literal))?;
            a.partial_cmp(&b).ok_or(ConditionError::Type {
                op,
                field: field.to_string(),
                got: "nan",
            })
        }
        (FieldValue::Str(a), serde_json::Value::String(b)) => Ok(a.as_str().cmp(b.as_str())),
        (other, _) => Err(ConditionError::Type {
            op,
            field: field.to_string(),
            got: other.type_name(),
        }),
    }
}

fn as_string(field: &str, op: Operator, value: &FieldValue) -> Result<String, ConditionError> {
    match value {
        FieldValue::Str(s) => Ok(s.clone()),
        other => Err(ConditionError::Type {
            op,
            field: field.to_string(),
            got: other.type_name(),
        }),
    }
}
