//! Expression AST evaluation against one data point.

use crate::rules::RegexCache;
use crate::types::{DataPoint, Value};

use super::functions::call_function;
use super::parser::{BinaryOp, Expr, UnaryOp};
use super::ExprError;

/// Runtime value of an expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Num(f64),
    Str(String),
    Bool(bool),
}

impl ExprValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ExprValue::Num(_) => "number",
            ExprValue::Str(_) => "string",
            ExprValue::Bool(_) => "bool",
        }
    }

    pub fn as_num(&self) -> Result<f64, ExprError> {
        match self {
            ExprValue::Num(n) => Ok(*n),
            ExprValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            ExprValue::Str(_) => Err(ExprError::Type {
                expected: "number",
                got: "string",
            }),
        }
    }

    pub fn as_str(&self) -> Result<&str, ExprError> {
        match self {
            ExprValue::Str(s) => Ok(s),
            other => Err(ExprError::Type {
                expected: "string",
                got: other.type_name(),
            }),
        }
    }

    /// Truthiness for `&& || !` and the final condition outcome.
    pub fn truthy(&self) -> bool {
        match self {
            ExprValue::Bool(b) => *b,
            ExprValue::Num(n) => *n != 0.0,
            ExprValue::Str(s) => !s.is_empty(),
        }
    }
}

/// What an expression sees: the point plus the per-(device, key) value
/// history backing `avg(last_values, n)` / `stddev(last_values, n)`. The
/// history excludes the point under evaluation.
pub struct EvalContext<'a> {
    pub point: &'a DataPoint,
    pub series: Option<&'a [f64]>,
    pub regex_cache: &'a RegexCache,
}

pub fn evaluate(expr: &Expr, ctx: &EvalContext<'_>) -> Result<ExprValue, ExprError> {
    match expr {
        Expr::Num(n) => Ok(ExprValue::Num(*n)),
        Expr::Str(s) => Ok(ExprValue::Str(s.clone())),
        Expr::Bool(b) => Ok(ExprValue::Bool(*b)),
        Expr::Ident(name) => resolve_ident(name, ctx),
        Expr::Unary { op, expr } => {
            let v = evaluate(expr, ctx)?;
            match op {
                UnaryOp::Not => Ok(ExprValue::Bool(!v.truthy())),
                UnaryOp::Neg => Ok(ExprValue::Num(-v.as_num()?)),
            }
        }
        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, ctx),
        Expr::Call { name, args } => call_function(name, args, ctx),
    }
}

fn eval_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    ctx: &EvalContext<'_>,
) -> Result<ExprValue, ExprError> {
    // Logical operators short-circuit; everything else is strict.
    match op {
        BinaryOp::And => {
            let l = evaluate(lhs, ctx)?;
            if !l.truthy() {
                return Ok(ExprValue::Bool(false));
            }
            let r = evaluate(rhs, ctx)?;
            return Ok(ExprValue::Bool(r.truthy()));
        }
        BinaryOp::Or => {
            let l = evaluate(lhs, ctx)?;
            if l.truthy() {
                return Ok(ExprValue::Bool(true));
            }
            let r = evaluate(rhs, ctx)?;
            return Ok(ExprValue::Bool(r.truthy()));
        }
        _ => {}
    }

    let l = evaluate(lhs, ctx)?;
    let r = evaluate(rhs, ctx)?;

    match op {
        BinaryOp::Add => Ok(ExprValue::Num(l.as_num()? + r.as_num()?)),
        BinaryOp::Sub => Ok(ExprValue::Num(l.as_num()? - r.as_num()?)),
        BinaryOp::Mul => Ok(ExprValue::Num(l.as_num()? * r.as_num()?)),
        BinaryOp::Div => {
            let d = r.as_num()?;
            if d == 0.0 {
                return Err(ExprError::Eval("division by zero".to_string()));
            }
            Ok(ExprValue::Num(l.as_num()? / d))
        }
        BinaryOp::Rem => {
            let d = r.as_num()?;
            if d == 0.0 {
                return Err(ExprError::Eval("modulo by zero".to_string()));
            }
            Ok(ExprValue::Num(l.as_num()? % d))
        }
        // Equality across mismatched types is false, never an error.
        BinaryOp::Eq => Ok(ExprValue::Bool(loose_eq(&l, &r))),
        BinaryOp::Ne => Ok(ExprValue::Bool(!loose_eq(&l, &r))),
        BinaryOp::Lt => ordering(&l, &r, |o| o == std::cmp::Ordering::Less),
        BinaryOp::Le => ordering(&l, &r, |o| o != std::cmp::Ordering::Greater),
        BinaryOp::Gt => ordering(&l, &r, |o| o == std::cmp::Ordering::Greater),
        BinaryOp::Ge => ordering(&l, &r, |o| o != std::cmp::Ordering::Less),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn loose_eq(l: &ExprValue, r: &ExprValue) -> bool {
    match (l, r) {
        (ExprValue::Num(a), ExprValue::Num(b)) => a == b,
        (ExprValue::Str(a), ExprValue::Str(b)) => a == b,
        (ExprValue::Bool(a), ExprValue::Bool(b)) => a == b,
        (ExprValue::Num(a), ExprValue::Bool(b)) | (ExprValue::Bool(b), ExprValue::Num(a)) => {
            *a == if *b { 1.0 } else { 0.0 }
        }
        _ => false,
    }
}

fn ordering(
    l: &ExprValue,
    r: &ExprValue,
    pred: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<ExprValue, ExprError> {
    let ord = match (l, r) {
        (ExprValue::Num(a), ExprValue::Num(b)) => a
            .partial_cmp(b)
            .ok_or_else(|| ExprError::Eval("NaN in comparison".to_string()))?,
        (ExprValue::Str(a), ExprValue::Str(b)) => a.cmp(b),
        (ExprValue::Bool(a), ExprValue::Bool(b)) => a.cmp(b),
        _ => {
            return Err(ExprError::Type {
                expected: l.type_name(),
                got: r.type_name(),
            })
        }
    };
    Ok(ExprValue::Bool(pred(ord)))
}

fn resolve_ident(name: &str, ctx: &EvalContext<'_>) -> Result<ExprValue, ExprError> {
    match name {
        // `x` is the conventional spelling in transform formulas
        "value" | "x" => match &ctx.point.value {
            Value::String(s) => Ok(ExprValue::Str(s.clone())),
            Value::Bool(b) => Ok(ExprValue::Bool(*b)),
            other => other.as_f64().map(ExprValue::Num).ok_or(ExprError::Type {
                expected: "scalar value",
                got: "composite",
            }),
        },
        "key" => Ok(ExprValue::Str(ctx.point.key.clone())),
        "device_id" => Ok(ExprValue::Str(ctx.point.device_id.clone())),
        "quality" => Ok(ExprValue::Num(f64::from(ctx.point.quality))),
        "timestamp" => Ok(ExprValue::Num(ctx.point.timestamp.timestamp() as f64)),
        "last_values" => Err(ExprError::Eval(
            "'last_values' is only valid as a series argument to avg()/stddev()".to_string(),
        )),
        tag if tag.starts_with("tags.") => {
            let key = &tag["tags.".len()..];
            ctx.point
                .tags
                .get(key)
                .map(ExprValue::Str)
                .ok_or_else(|| ExprError::UnknownIdent(tag.to_string()))
        }
        other => Err(ExprError::UnknownIdent(other.to_string())),
    }
}
