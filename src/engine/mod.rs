//! Condition evaluator & expression engine (§4.G).

pub mod eval;
pub mod expr;
pub mod functions;

pub use eval::{evaluate, evaluate_checked, ConditionError};
pub use functions::FunctionRegistry;
