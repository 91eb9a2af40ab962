//! Built-in function library for the expression language.

use chrono::Timelike;

use super::eval::{evaluate, EvalContext, ExprValue};
use super::parser::Expr;
use super::ExprError;

/// Dispatch a function call.
///
/// `avg` and `stddev` receive their first argument unevaluated: it must be
/// the series identifier `last_values`, which resolves to the recent value
/// history of the point's (device, key) pair.
pub fn call_function(
    name: &str,
    args: &[Expr],
    ctx: &EvalContext<'_>,
) -> Result<ExprValue, ExprError> {
    match name {
        "avg" | "stddev" => series_stat(name, args, ctx),
        "abs" => {
            require_arity(name, args, 1)?;
            let x = eval_num(args, 0, name, 1, ctx)?;
            Ok(ExprValue::Num(x.abs()))
        }
        "sqrt" => {
            require_arity(name, args, 1)?;
            let x = eval_num(args, 0, name, 1, ctx)?;
            if x < 0.0 {
                return Err(ExprError::Eval("sqrt of negative".to_string()));
            }
            Ok(ExprValue::Num(x.sqrt()))
        }
        "pow" => {
            require_arity(name, args, 2)?;
            let base = eval_num(args, 0, name, 2, ctx)?;
            let exp = eval_num(args, 1, name, 2, ctx)?;
            Ok(ExprValue::Num(base.powf(exp)))
        }
        "min" | "max" => {
            if args.len() < 2 {
                return Err(ExprError::Arity {
                    name: name.to_string(),
                    expected: 2,
                    got: args.len(),
                });
            }
            let mut best = eval_num(args, 0, name, args.len(), ctx)?;
            for i in 1..args.len() {
                let v = eval_num(args, i, name, args.len(), ctx)?;
                best = if name == "min" { best.min(v) } else { best.max(v) };
            }
            Ok(ExprValue::Num(best))
        }
        "len" => {
            require_arity(name, args, 1)?;
            let v = evaluate(&args[0], ctx)?;
            let s = v.as_str()?;
            Ok(ExprValue::Num(s.chars().count() as f64))
        }
        "upper" => {
            require_arity(name, args, 1)?;
            let v = evaluate(&args[0], ctx)?;
            Ok(ExprValue::Str(v.as_str()?.to_uppercase()))
        }
        "lower" => {
            require_arity(name, args, 1)?;
            let v = evaluate(&args[0], ctx)?;
            Ok(ExprValue::Str(v.as_str()?.to_lowercase()))
        }
        "contains" | "startswith" | "endswith" => {
            require_arity(name, args, 2)?;
            let hay = evaluate(&args[0], ctx)?;
            let needle = evaluate(&args[1], ctx)?;
            let hay = hay.as_str()?;
            let needle = needle.as_str()?;
            let result = match name {
                "contains" => hay.contains(needle),
                "startswith" => hay.starts_with(needle),
                _ => hay.ends_with(needle),
            };
            Ok(ExprValue::Bool(result))
        }
        "regex" => {
            require_arity(name, args, 2)?;
            let text = evaluate(&args[0], ctx)?;
            let pattern = evaluate(&args[1], ctx)?;
            let re = ctx
                .regex_cache
                .get_or_compile(pattern.as_str()?)
                .map_err(|e| ExprError::Eval(format!("regex: {e}")))?;
            Ok(ExprValue::Bool(re.is_match(text.as_str()?)))
        }
        "now" => {
            require_arity(name, args, 0)?;
            Ok(ExprValue::Num(chrono::Utc::now().timestamp() as f64))
        }
        "time_range" => {
            require_arity(name, args, 2)?;
            let start = evaluate(&args[0], ctx)?;
            let end = evaluate(&args[1], ctx)?;
            let start = parse_hhmm(start.as_str()?)?;
            let end = parse_hhmm(end.as_str()?)?;
            let ts = ctx.point.timestamp;
            let minute_of_day = ts.hour() * 60 + ts.minute();
            // A wrapping range ("22:00".."06:00") covers midnight.
            let inside = if start <= end {
                minute_of_day >= start && minute_of_day < end
            } else {
                minute_of_day >= start || minute_of_day < end
            };
            Ok(ExprValue::Bool(inside))
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

/// `avg(last_values, n)` / `stddev(last_values, n)` over the trailing `n`
/// entries of the per-(device, key) history. `stddev` is the population
/// deviation (a 1-sample series reads 0, not an error).
fn series_stat(name: &str, args: &[Expr], ctx: &EvalContext<'_>) -> Result<ExprValue, ExprError> {
    require_arity(name, args, 2)?;
    let series_name = match &args[0] {
        Expr::Ident(id) => id.as_str(),
        _ => {
            return Err(ExprError::Eval(format!(
                "{name}: first argument must be a series identifier"
            )))
        }
    };
    if series_name != "last_values" {
        return Err(ExprError::Eval(format!(
            "{name}: unknown series '{series_name}'"
        )));
    }
    let n = evaluate(&args[1], ctx)?.as_num()?;
    if n < 1.0 || n.fract() != 0.0 {
        return Err(ExprError::Eval(format!("{name}: n must be a positive integer")));
    }

    let series = ctx.series.unwrap_or(&[]);
    if series.is_empty() {
        return Err(ExprError::EmptySeries(series_name.to_string()));
    }
    let take = (n as usize).min(series.len());
    let window = &series[series.len() - take..];

    let mean = window.iter().sum::<f64>() / window.len() as f64;
    match name {
        "avg" => Ok(ExprValue::Num(mean)),
        _ => {
            let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window.len() as f64;
            Ok(ExprValue::Num(var.sqrt()))
        }
    }
}

fn require_arity(name: &str, args: &[Expr], expected: usize) -> Result<(), ExprError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ExprError::Arity {
            name: name.to_string(),
            expected,
            got: args.len(),
        })
    }
}

fn eval_num(
    args: &[Expr],
    idx: usize,
    name: &str,
    expected: usize,
    ctx: &EvalContext<'_>,
) -> Result<f64, ExprError> {
    let arg = args.get(idx).ok_or_else(|| ExprError::Arity {
        name: name.to_string(),
        expected,
        got: args.len(),
    })?;
    evaluate(arg, ctx)?.as_num()
}

fn parse_hhmm(s: &str) -> Result<u32, ExprError> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| ExprError::Eval(format!("bad time '{s}', expected HH:MM")))?;
    let h: u32 = h
        .parse()
        .map_err(|_| ExprError::Eval(format!("bad hour in '{s}'")))?;
    let m: u32 = m
        .parse()
        .map_err(|_| ExprError::Eval(format!("bad minute in '{s}'")))?;
    if h > 23 || m > 59 {
        return Err(ExprError::Eval(format!("time '{s}' out of range")));
    }
    Ok(h * 60 + m)
}
