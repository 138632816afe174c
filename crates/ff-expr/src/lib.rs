#![forbid(unsafe_code)]

//! Restricted formula grammar over frame columns and global constants.
//!
//! A formula is parsed into an [`Expr`] tree, statically checked by the
//! [`Validator`] against an immutable [`EvaluationContext`], and evaluated
//! per frame by the [`ScalarEvaluator`]. There is no ambient execution
//! environment: every identifier must resolve inside the context, and the
//! dispatch tables in [`functions`] are the only callable surface.

mod ast;
mod context;
mod eval;
mod functions;
mod parse;
mod validate;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use context::{ConstantNamespace, EvaluationContext};
pub use eval::ScalarEvaluator;
pub use functions::{AggregateFunction, MathFunction, SpatialOperator};
pub use parse::parse_formula;
pub use validate::Validator;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormulaError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("invalid formula: {0}")]
    Validation(String),
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("{function} expects {expected} argument(s), found {found}")]
    Arity {
        function: String,
        expected: usize,
        found: usize,
    },
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}
