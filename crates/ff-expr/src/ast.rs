use serde::{Deserialize, Serialize};

use crate::functions::{AggregateFunction, SpatialOperator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Plus,
    Neg,
}

/// Parsed formula tree. Only the constructs of the restricted grammar can
/// appear; anything else already failed at the lexer or parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Number {
        value: f64,
    },
    Name {
        id: String,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        function: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// True when any call in the tree targets a spatial operator. Formulas
    /// with spatial tokens must take the gridded evaluation path.
    #[must_use]
    pub fn contains_spatial(&self) -> bool {
        match self {
            Self::Number { .. } | Self::Name { .. } => false,
            Self::Unary { operand, .. } => operand.contains_spatial(),
            Self::Binary { left, right, .. } => {
                left.contains_spatial() || right.contains_spatial()
            }
            Self::Call { function, args } => {
                SpatialOperator::from_name(function).is_some()
                    || args.iter().any(Expr::contains_spatial)
            }
        }
    }

    /// True when any call in the tree targets a frame aggregate. Aggregates
    /// force host-side evaluation (the GPU path is skipped).
    #[must_use]
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Self::Number { .. } | Self::Name { .. } => false,
            Self::Unary { operand, .. } => operand.contains_aggregate(),
            Self::Binary { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            Self::Call { function, args } => {
                AggregateFunction::from_name(function).is_some()
                    || args.iter().any(Expr::contains_aggregate)
            }
        }
    }

    /// Visit every bare identifier in the tree (call targets excluded).
    pub fn for_each_name(&self, visit: &mut impl FnMut(&str)) {
        match self {
            Self::Number { .. } => {}
            Self::Name { id } => visit(id),
            Self::Unary { operand, .. } => operand.for_each_name(visit),
            Self::Binary { left, right, .. } => {
                left.for_each_name(visit);
                right.for_each_name(visit);
            }
            Self::Call { args, .. } => {
                for arg in args {
                    arg.for_each_name(visit);
                }
            }
        }
    }
}
