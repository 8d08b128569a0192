//! Condition tree evaluator (§4.G step 1): simple field comparisons,
//! and/or/not combinators, and the expression delegate with its
//! syntax-error/custom-pattern fallback (§4.G step 5).

use std::collections::HashMap;

use thiserror::Error;

use crate::point::{Point, Value};
use crate::rules::model::{Condition, Operator};

use super::expr::value::ExprValue;
use super::expr::{self, Environment, EvalError as ExprEvalError};
use super::functions::FunctionRegistry;

#[derive(Error, Debug)]
pub enum ConditionError {
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("expression error: {0}")]
    Expression(#[from] ExprEvalError),
}

/// Evaluates a condition tree against `point`. Returns `Ok(false)` rather
/// than propagating most expression errors — §7 says condition failures
/// mark the rule non-matching and are recorded by the monitor rather than
/// stopping evaluation of other rules; callers that need the error for
/// monitor reporting should call `evaluate_expression` directly.
pub fn evaluate(cond: &Condition, point: &Point, functions: &FunctionRegistry) -> bool {
    evaluate_checked(cond, point, functions).unwrap_or(false)
}

pub fn evaluate_checked(cond: &Condition, point: &Point, functions: &FunctionRegistry) -> Result<bool, ConditionError> {
    match cond {
        Condition::Simple { field, operator, value } => Ok(evaluate_simple(field, *operator, value, point)),
        Condition::And { children } => {
            for c in children {
                if !evaluate_checked(c, point, functions)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Condition::Or { children } => {
            for c in children {
                if evaluate_checked(c, point, functions)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Condition::Not { child } => Ok(!evaluate_checked(child, point, functions)?),
        Condition::Expression { expression } => evaluate_expression(expression, point, functions),
        Condition::Lua { .. } => Err(ConditionError::UnknownField("lua conditions are not executable".into())),
    }
}

fn evaluate_expression(expression: &str, point: &Point, functions: &FunctionRegistry) -> Result<bool, ConditionError> {
    let env = build_environment(point);
    match expr::parse(expression) {
        Ok(ast) => Ok(expr::eval(&ast, &env, functions)?.as_bool()),
        Err(parse_err) if parse_err.is_syntax_error() => Err(ConditionError::Expression(ExprEvalError::Parse(parse_err))),
        Err(_) => Ok(custom_pattern_match(expression, &env)),
    }
}

/// §4.G step 5 fallback: `regex(field, "pattern")`, `time_range(field, lo, hi)`,
/// `in_array(field, a, b, c)`.
fn custom_pattern_match(expression: &str, env: &Environment) -> bool {
    let s = expression.trim();
    let Some(open) = s.find('(') else { return false };
    if !s.ends_with(')') {
        return false;
    }
    let name = &s[..open];
    let inner = &s[open + 1..s.len() - 1];
    let args = split_top_level_args(inner);
    let resolve = |token: &str| -> ExprValue {
        let trimmed = token.trim().trim_matches('\'').trim_matches('"');
        if let Some(v) = env.variables.get(trimmed) {
            return v.clone();
        }
        if let Ok(n) = trimmed.parse::<f64>() {
            return ExprValue::Number(n);
        }
        ExprValue::Str(trimmed.to_string())
    };

    match name {
        "regex" if args.len() == 2 => {
            let hay = resolve(&args[0]).as_str_repr();
            let pattern = args[1].trim().trim_matches('\'').trim_matches('"');
            regex::Regex::new(pattern).map(|re| re.is_match(&hay)).unwrap_or(false)
        }
        "time_range" if args.len() == 3 => {
            let ts = resolve(&args[0]).as_number().unwrap_or(f64::NAN);
            let lo = resolve(&args[1]).as_number().unwrap_or(f64::NAN);
            let hi = resolve(&args[2]).as_number().unwrap_or(f64::NAN);
            ts >= lo && ts <= hi
        }
        "in_array" if args.len() >= 2 => {
            let target = resolve(&args[0]);
            args[1..].iter().any(|a| resolve(a) == target)
        }
        _ => false,
    }
}

fn split_top_level_args(s: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut current = String::new();
    for c in s.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' => {
                    depth -= 1;
                    current.push(c);
                }
                ',' if depth == 0 => {
                    args.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        args.push(current);
    }
    args
}

fn evaluate_simple(field: &str, operator: Operator, expected: &serde_json::Value, point: &Point) -> bool {
    let Some(actual) = resolve_field(field, point) else {
        return false;
    };
    apply_operator(operator, &actual, expected)
}

fn resolve_field(field: &str, point: &Point) -> Option<ExprValue> {
    if let Some(tag_key) = field.strip_prefix("tag.") {
        return point.tags.get_tag(tag_key).map(ExprValue::Str);
    }
    match field {
        "device_id" => Some(ExprValue::Str(point.device_id.clone())),
        "key" => Some(ExprValue::Str(point.key.clone())),
        "type" => Some(ExprValue::Str(point.point_type().to_string())),
        "quality" => Some(ExprValue::Number(point.quality as f64)),
        "timestamp" => Some(ExprValue::Number(point.timestamp.timestamp() as f64)),
        "value" => value_to_expr(&point.value),
        other => other
            .strip_prefix("value.")
            .and_then(|sub| composite_subfield(&point.value, sub)),
    }
}

fn value_to_expr(v: &Value) -> Option<ExprValue> {
    match v {
        Value::Int(i) => Some(ExprValue::Number(*i as f64)),
        Value::Float(f) => Some(ExprValue::Number(*f)),
        Value::Bool(b) => Some(ExprValue::Bool(*b)),
        Value::String(s) => Some(ExprValue::Str(s.clone())),
        _ => v.as_f64().map(ExprValue::Number),
    }
}

/// Composite sub-field resolution (§4.G step 3): location, vector3d,
/// vector/array, color, matrix (up to 5x5), timeseries (up to index 9).
pub fn composite_subfield(value: &Value, sub: &str) -> Option<ExprValue> {
    match value {
        Value::Location(loc) => match sub {
            "latitude" => Some(ExprValue::Number(loc.latitude)),
            "longitude" => Some(ExprValue::Number(loc.longitude)),
            "altitude" => Some(ExprValue::Number(loc.altitude)),
            "accuracy" => Some(ExprValue::Number(loc.accuracy)),
            "speed" => Some(ExprValue::Number(loc.speed)),
            "heading" => Some(ExprValue::Number(loc.heading)),
            _ => None,
        },
        Value::Vector3D(v) => match sub {
            "x" => Some(ExprValue::Number(v.x)),
            "y" => Some(ExprValue::Number(v.y)),
            "z" => Some(ExprValue::Number(v.z)),
            _ => None,
        },
        Value::Vector(items) => vector_like_subfield(items, sub),
        Value::Array(items) => {
            let numeric: Vec<f64> = items.iter().filter_map(|v| v.as_f64()).collect();
            vector_like_subfield(&numeric, sub)
        }
        Value::Color(c) => match sub {
            "r" => Some(ExprValue::Number(c.r)),
            "g" => Some(ExprValue::Number(c.g)),
            "b" => Some(ExprValue::Number(c.b)),
            "a" => Some(ExprValue::Number(c.a)),
            _ => None,
        },
        Value::Matrix(m) => {
            if sub == "rows" {
                return Some(ExprValue::Number(m.rows as f64));
            }
            if sub == "cols" {
                return Some(ExprValue::Number(m.cols as f64));
            }
            let (i, j) = sub.split_once('_')?;
            let (i, j) = (i.parse::<usize>().ok()?, j.parse::<usize>().ok()?);
            if i >= 5 || j >= 5 {
                return None;
            }
            m.get(i, j).map(ExprValue::Number)
        }
        Value::TimeSeries(ts) => match sub {
            "length" => Some(ExprValue::Number(ts.values.len() as f64)),
            "first_value" => ts.values.first().copied().map(ExprValue::Number),
            "last_value" => ts.values.last().copied().map(ExprValue::Number),
            "interval" => Some(ExprValue::Number(ts.interval_secs)),
            "-1" => nth_from_end(&ts.values, 1),
            "-2" => nth_from_end(&ts.values, 2),
            idx => idx
                .parse::<usize>()
                .ok()
                .filter(|i| *i < 9)
                .and_then(|i| ts.values.get(i))
                .copied()
                .map(ExprValue::Number),
        },
        _ => None,
    }
}

fn vector_like_subfield(items: &[f64], sub: &str) -> Option<ExprValue> {
    match sub {
        "length" | "dimension" => Some(ExprValue::Number(items.len() as f64)),
        idx => idx
            .parse::<usize>()
            .ok()
            .filter(|i| *i < 9)
            .and_then(|i| items.get(i))
            .copied()
            .map(ExprValue::Number),
    }
}

fn nth_from_end(values: &[f64], n: usize) -> Option<ExprValue> {
    if n > values.len() {
        None
    } else {
        values.get(values.len() - n).copied().map(ExprValue::Number)
    }
}

fn apply_operator(operator: Operator, actual: &ExprValue, expected: &serde_json::Value) -> bool {
    match operator {
        Operator::Eq | Operator::Ne => {
            let eq = json_equal(actual, expected);
            if operator == Operator::Eq {
                eq
            } else {
                !eq
            }
        }
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let (Some(a), Some(b)) = (actual.as_number(), expected.as_f64().or_else(|| expected.as_str().and_then(|s| s.parse().ok())))
            else {
                return false;
            };
            if a.is_nan() || b.is_nan() {
                return false;
            }
            match operator {
                Operator::Gt => a > b,
                Operator::Gte => a >= b,
                Operator::Lt => a < b,
                Operator::Lte => a <= b,
                _ => unreachable!(),
            }
        }
        Operator::Contains | Operator::Startswith | Operator::Endswith => {
            let hay = actual.as_str_repr();
            let needle = expected.as_str().map(str::to_string).unwrap_or_else(|| expected.to_string());
            match operator {
                Operator::Contains => hay.contains(&needle),
                Operator::Startswith => hay.starts_with(&needle),
                Operator::Endswith => hay.ends_with(&needle),
                _ => unreachable!(),
            }
        }
        Operator::Regex => {
            let hay = actual.as_str_repr();
            let pattern = expected.as_str().unwrap_or_default();
            regex::Regex::new(pattern).map(|re| re.is_match(&hay)).unwrap_or(false)
        }
    }
}

fn json_equal(actual: &ExprValue, expected: &serde_json::Value) -> bool {
    match actual {
        ExprValue::Number(n) => {
            if n.is_nan() {
                return false;
            }
            expected.as_f64() == Some(*n)
        }
        ExprValue::Str(s) => expected.as_str() == Some(s.as_str()),
        ExprValue::Bool(b) => expected.as_bool() == Some(*b),
        ExprValue::Array(_) => false,
    }
}

/// Full per-point environment (§4.G step 3), used for `expression`
/// conditions and action configs. Built fresh for every evaluation.
pub fn build_environment(point: &Point) -> Environment {
    let mut env = Environment::new();
    env.set("device_id", ExprValue::Str(point.device_id.clone()));
    env.set("key", ExprValue::Str(point.key.clone()));
    env.set("type", ExprValue::Str(point.point_type().to_string()));
    env.set("quality", ExprValue::Number(point.quality as f64));
    env.set("timestamp", ExprValue::Number(point.timestamp.timestamp() as f64));
    if let Some(v) = value_to_expr(&point.value) {
        env.set("value", v);
    }

    for (k, v) in point.tags.copy() {
        env.set(format!("tag_{k}"), ExprValue::Str(v.clone()));
        if v.starts_with('{') || v.starts_with('[') {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&v) {
                flatten_json_into(&format!("tag_{k}"), &parsed, &mut env);
            }
        }
        env.tags.insert(k, v);
    }

    for sub in composite_subfield_names(&point.value) {
        if let Some(v) = composite_subfield(&point.value, &sub) {
            env.set(format!("value.{sub}"), v);
        }
    }
    env
}

fn flatten_json_into(prefix: &str, value: &serde_json::Value, env: &mut Environment) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                flatten_json_into(&format!("{prefix}.{k}"), v, env);
            }
        }
        serde_json::Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                env.set(prefix, ExprValue::Number(f));
            }
        }
        serde_json::Value::String(s) => env.set(prefix, ExprValue::Str(s.clone())),
        serde_json::Value::Bool(b) => env.set(prefix, ExprValue::Bool(*b)),
        _ => {}
    }
}

fn composite_subfield_names(value: &Value) -> Vec<String> {
    match value {
        Value::Location(_) => vec!["latitude", "longitude", "altitude", "accuracy", "speed", "heading"]
            .into_iter()
            .map(String::from)
            .collect(),
        Value::Vector3D(_) => vec!["x", "y", "z"].into_iter().map(String::from).collect(),
        Value::Vector(v) => vector_like_names(v.len()),
        Value::Array(a) => vector_like_names(a.len()),
        Value::Color(_) => vec!["r", "g", "b", "a"].into_iter().map(String::from).collect(),
        Value::Matrix(m) => {
            let mut names = vec!["rows".to_string(), "cols".to_string()];
            for i in 0..m.rows.min(5) {
                for j in 0..m.cols.min(5) {
                    names.push(format!("{i}_{j}"));
                }
            }
            names
        }
        Value::TimeSeries(ts) => {
            let mut names = vec![
                "length".to_string(),
                "first_value".to_string(),
                "last_value".to_string(),
                "interval".to_string(),
                "-1".to_string(),
                "-2".to_string(),
            ];
            for i in 0..ts.values.len().min(9) {
                names.push(i.to_string());
            }
            names
        }
        _ => Vec::new(),
    }
}

fn vector_like_names(len: usize) -> Vec<String> {
    let mut names = vec!["length".to_string(), "dimension".to_string()];
    for i in 0..len.min(9) {
        names.push(i.to_string());
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Point;

    #[test]
    fn simple_gt_condition_matches() {
        let point = Point::new("d1", "temp", Value::Float(42.0));
        let cond = Condition::Simple {
            field: "value".into(),
            operator: Operator::Gt,
            value: serde_json::json!(30.0),
        };
        assert!(evaluate(&cond, &point, &FunctionRegistry::new()));
    }

    #[test]
    fn nan_never_matches_gt() {
        let point = Point::new("d1", "temp", Value::Float(f64::NAN));
        let cond = Condition::Simple {
            field: "value".into(),
            operator: Operator::Gt,
            value: serde_json::json!(1.0),
        };
        assert!(!evaluate(&cond, &point, &FunctionRegistry::new()));
    }

    #[test]
    fn expression_condition_uses_full_environment() {
        let point = Point::new("d1", "temp", Value::Float(42.0));
        let cond = Condition::Expression {
            expression: "value > 30 && device_id == \"d1\"".into(),
        };
        assert!(evaluate(&cond, &point, &FunctionRegistry::new()));
    }

    #[test]
    fn and_condition_short_circuits() {
        let point = Point::new("d1", "temp", Value::Float(5.0));
        let cond = Condition::And {
            children: vec![
                Condition::Simple {
                    field: "value".into(),
                    operator: Operator::Gt,
                    value: serde_json::json!(100.0),
                },
                Condition::Expression {
                    expression: "1 / 0 > 0".into(),
                },
            ],
        };
        assert!(!evaluate(&cond, &point, &FunctionRegistry::new()));
    }
}
