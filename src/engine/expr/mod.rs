//! Expression engine (§4.G): pre-processing, parsing, and evaluation of the
//! safe arithmetic/logical subset used by `expression` conditions and the
//! `transform`/`aggregate` action configs.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod value;

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use self::ast::{BinaryOp, Expr, Literal, UnaryOp};
use self::value::ExprValue;
use super::functions::{FunctionError, FunctionRegistry};

pub use parser::ParseError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),
    #[error("function error: {0}")]
    Function(#[from] FunctionError),
    #[error("division by zero")]
    DivisionByZero,
    #[error("non-finite result")]
    NonFinite,
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

/// Per-point variable environment (§4.G step 3): point fields, tag aliases,
/// and composite sub-fields, rebuilt fresh for every evaluation.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub variables: HashMap<String, ExprValue>,
    pub tags: HashMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: ExprValue) {
        self.variables.insert(key.into(), value);
    }
}

/// §4.G step 1: translate `tags['k']` / `tags.k` to `__tag_access__("k")`,
/// `[a,b,c]` to `__array__(a,b,c)`, and normalise single quotes to double.
pub fn preprocess(input: &str) -> String {
    static TAG_BRACKET: OnceLock<Regex> = OnceLock::new();
    static TAG_DOT: OnceLock<Regex> = OnceLock::new();
    static ARRAY_LITERAL: OnceLock<Regex> = OnceLock::new();

    let tag_bracket =
        TAG_BRACKET.get_or_init(|| Regex::new(r#"tags\[['"]([^'"]+)['"]\]"#).expect("static regex"));
    let tag_dot = TAG_DOT.get_or_init(|| Regex::new(r"tags\.([A-Za-z_][A-Za-z0-9_]*)").expect("static regex"));
    let array_literal = ARRAY_LITERAL.get_or_init(|| Regex::new(r"\[([^\[\]]*)\]").expect("static regex"));

    let mut s = tag_bracket.replace_all(input, "__tag_access__(\"$1\")").to_string();
    s = tag_dot.replace_all(&s, "__tag_access__(\"$1\")").to_string();
    s = s.replace('\'', "\"");
    s = array_literal.replace_all(&s, "__array__($1)").to_string();
    s
}

pub fn parse(input: &str) -> Result<Expr, ParseError> {
    parser::parse(&preprocess(input))
}

pub fn eval(expr: &Expr, env: &Environment, functions: &FunctionRegistry) -> Result<ExprValue, EvalError> {
    match expr {
        Expr::Literal(Literal::Int(n)) => Ok(ExprValue::Number(*n as f64)),
        Expr::Literal(Literal::Float(f)) => Ok(ExprValue::Number(*f)),
        Expr::Literal(Literal::Str(s)) => Ok(ExprValue::Str(s.clone())),
        Expr::Literal(Literal::Bool(b)) => Ok(ExprValue::Bool(*b)),
        Expr::Identifier(name) => env
            .variables
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownIdentifier(name.clone())),
        Expr::Unary(UnaryOp::Neg, inner) => {
            let v = eval(inner, env, functions)?;
            let n = v.as_number().ok_or_else(|| EvalError::TypeMismatch("unary -".into()))?;
            Ok(ExprValue::Number(-n))
        }
        Expr::Unary(UnaryOp::Not, inner) => {
            let v = eval(inner, env, functions)?;
            Ok(ExprValue::Bool(!v.as_bool()))
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            let l = eval(lhs, env, functions)?;
            if !l.as_bool() {
                return Ok(ExprValue::Bool(false));
            }
            Ok(ExprValue::Bool(eval(rhs, env, functions)?.as_bool()))
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            let l = eval(lhs, env, functions)?;
            if l.as_bool() {
                return Ok(ExprValue::Bool(true));
            }
            Ok(ExprValue::Bool(eval(rhs, env, functions)?.as_bool()))
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = eval(lhs, env, functions)?;
            let r = eval(rhs, env, functions)?;
            eval_binary(*op, &l, &r)
        }
        Expr::Call(name, arg_exprs) if name == "__tag_access__" => {
            let key = match arg_exprs.first() {
                Some(Expr::Literal(Literal::Str(k))) => k.clone(),
                _ => return Err(EvalError::TypeMismatch("__tag_access__ key".into())),
            };
            match env.tags.get(&key) {
                Some(v) => Ok(ExprValue::Str(v.clone())),
                None => Ok(ExprValue::Str(String::new())),
            }
        }
        Expr::Call(name, arg_exprs) if name == "__array__" => {
            let mut values = Vec::with_capacity(arg_exprs.len());
            for a in arg_exprs {
                let v = eval(a, env, functions)?;
                values.push(v.as_number().ok_or_else(|| EvalError::TypeMismatch("array element".into()))?);
            }
            Ok(ExprValue::Array(values))
        }
        Expr::Call(name, arg_exprs) => {
            let mut values = Vec::with_capacity(arg_exprs.len());
            for a in arg_exprs {
                values.push(eval(a, env, functions)?);
            }
            Ok(functions.call(name, &values)?)
        }
    }
}

fn eval_binary(op: BinaryOp, l: &ExprValue, r: &ExprValue) -> Result<ExprValue, EvalError> {
    use BinaryOp::*;
    match op {
        Add | Sub | Mul | Div | Mod => {
            let (a, b) = (
                l.as_number().ok_or_else(|| EvalError::TypeMismatch(format!("{op:?} lhs")))?,
                r.as_number().ok_or_else(|| EvalError::TypeMismatch(format!("{op:?} rhs")))?,
            );
            let result = match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                Mod => a % b,
                Div => {
                    if b == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    a / b
                }
                _ => unreachable!(),
            };
            if result.is_nan() || result.is_infinite() {
                return Err(EvalError::NonFinite);
            }
            Ok(ExprValue::Number(result))
        }
        Eq => Ok(ExprValue::Bool(values_equal(l, r))),
        Ne => Ok(ExprValue::Bool(!values_equal(l, r))),
        Lt | Lte | Gt | Gte => {
            let (a, b) = match (l.as_number(), r.as_number()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(EvalError::TypeMismatch(format!("{op:?} operands"))),
            };
            if a.is_nan() || b.is_nan() {
                return Ok(ExprValue::Bool(false));
            }
            let result = match op {
                Lt => a < b,
                Lte => a <= b,
                Gt => a > b,
                Gte => a >= b,
                _ => unreachable!(),
            };
            Ok(ExprValue::Bool(result))
        }
        And | Or => unreachable!("handled by short-circuit branch above"),
    }
}

fn values_equal(l: &ExprValue, r: &ExprValue) -> bool {
    match (l, r) {
        (ExprValue::Number(a), ExprValue::Number(b)) => {
            if a.is_nan() || b.is_nan() {
                false
            } else {
                a == b
            }
        }
        (ExprValue::Str(a), ExprValue::Str(b)) => a == b,
        (ExprValue::Bool(a), ExprValue::Bool(b)) => a == b,
        _ => match (l.as_number(), r.as_number()) {
            (Some(a), Some(b)) if !a.is_nan() && !b.is_nan() => a == b,
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_str(src: &str, env: &Environment) -> Result<ExprValue, EvalError> {
        let expr = parse(src)?;
        eval(&expr, env, &FunctionRegistry::new())
    }

    #[test]
    fn basic_arithmetic() {
        assert_eq!(eval_str("1 + 2 * 3", &Environment::new()).unwrap(), ExprValue::Number(7.0));
    }

    #[test]
    fn division_by_zero_errors() {
        assert_eq!(eval_str("1 / 0", &Environment::new()).unwrap_err(), EvalError::DivisionByZero);
    }

    #[test]
    fn nan_comparison_is_false() {
        let mut env = Environment::new();
        env.set("x", ExprValue::Number(f64::NAN));
        assert_eq!(eval_str("x > 1", &env).unwrap(), ExprValue::Bool(false));
        assert_eq!(eval_str("x == x", &env).unwrap(), ExprValue::Bool(false));
    }

    #[test]
    fn tag_bracket_access_resolves_from_environment() {
        let mut env = Environment::new();
        env.tags.insert("site".into(), "north".into());
        assert_eq!(eval_str("tags['site']", &env).unwrap(), ExprValue::Str("north".into()));
        assert_eq!(eval_str("tags.site", &env).unwrap(), ExprValue::Str("north".into()));
    }

    #[test]
    fn array_literal_feeds_vector_functions() {
        assert_eq!(
            eval_str("vectorSum([1,2,3])", &Environment::new()).unwrap(),
            ExprValue::Number(6.0)
        );
    }

    #[test]
    fn identifier_field_selector_resolves() {
        let mut env = Environment::new();
        env.set("location.latitude", ExprValue::Number(45.0));
        assert_eq!(eval_str("location.latitude > 10", &env).unwrap(), ExprValue::Bool(true));
    }
}
