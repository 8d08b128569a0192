//! Dynamic value type the expression evaluator operates over.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Number(f64),
    Str(String),
    Bool(bool),
    Array(Vec<f64>),
}

impl ExprValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ExprValue::Number(n) => Some(*n),
            ExprValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ExprValue::Str(s) => s.parse().ok(),
            ExprValue::Array(_) => None,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            ExprValue::Bool(b) => *b,
            ExprValue::Number(n) => *n != 0.0 && !n.is_nan(),
            ExprValue::Str(s) => !s.is_empty(),
            ExprValue::Array(a) => !a.is_empty(),
        }
    }

    pub fn as_str_repr(&self) -> String {
        match self {
            ExprValue::Str(s) => s.clone(),
            ExprValue::Number(n) => n.to_string(),
            ExprValue::Bool(b) => b.to_string(),
            ExprValue::Array(a) => format!("{a:?}"),
        }
    }
}

impl fmt::Display for ExprValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str_repr())
    }
}
