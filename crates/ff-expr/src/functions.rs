use ff_columnar::Reduction;
use serde::{Deserialize, Serialize};

/// Element-wise math functions. These operate on whatever shape their
/// arguments have (per-point vectors or grids); `Min`, `Max` and `Pow` are
/// binary, everything else unary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathFunction {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Log,
    Log10,
    Sqrt,
    Abs,
    Floor,
    Ceil,
    Round,
    Min,
    Max,
    Pow,
}

impl MathFunction {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let f = match name {
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "asin" => Self::Asin,
            "acos" => Self::Acos,
            "atan" => Self::Atan,
            "sinh" => Self::Sinh,
            "cosh" => Self::Cosh,
            "tanh" => Self::Tanh,
            "exp" => Self::Exp,
            "log" => Self::Log,
            "log10" => Self::Log10,
            "sqrt" => Self::Sqrt,
            "abs" => Self::Abs,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "round" => Self::Round,
            "min" => Self::Min,
            "max" => Self::Max,
            "pow" => Self::Pow,
            _ => return None,
        };
        Some(f)
    }

    #[must_use]
    pub fn arity(self) -> usize {
        match self {
            Self::Min | Self::Max | Self::Pow => 2,
            _ => 1,
        }
    }

    /// Unary application. Domain errors follow IEEE semantics (NaN), they
    /// never raise.
    #[must_use]
    pub fn apply1(self, x: f64) -> f64 {
        match self {
            Self::Sin => x.sin(),
            Self::Cos => x.cos(),
            Self::Tan => x.tan(),
            Self::Asin => x.asin(),
            Self::Acos => x.acos(),
            Self::Atan => x.atan(),
            Self::Sinh => x.sinh(),
            Self::Cosh => x.cosh(),
            Self::Tanh => x.tanh(),
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Log10 => x.log10(),
            Self::Sqrt => x.sqrt(),
            Self::Abs => x.abs(),
            Self::Floor => x.floor(),
            Self::Ceil => x.ceil(),
            Self::Round => x.round(),
            Self::Min | Self::Max | Self::Pow => f64::NAN,
        }
    }

    /// Binary application for the two-argument functions.
    #[must_use]
    pub fn apply2(self, x: f64, y: f64) -> f64 {
        match self {
            Self::Min => x.min(y),
            Self::Max => x.max(y),
            Self::Pow => x.powf(y),
            _ => f64::NAN,
        }
    }
}

/// Frame aggregates: reduce a per-point sub-expression to one scalar over
/// the current frame only. Exactly one argument each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Mean,
    Sum,
    Median,
    Std,
    Var,
    MinFrame,
    MaxFrame,
}

impl AggregateFunction {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let f = match name {
            "mean" => Self::Mean,
            "sum" => Self::Sum,
            "median" => Self::Median,
            "std" => Self::Std,
            "var" => Self::Var,
            "min_frame" => Self::MinFrame,
            "max_frame" => Self::MaxFrame,
            _ => return None,
        };
        Some(f)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Sum => "sum",
            Self::Median => "median",
            Self::Std => "std",
            Self::Var => "var",
            Self::MinFrame => "min_frame",
            Self::MaxFrame => "max_frame",
        }
    }

    #[must_use]
    pub fn reduction(self) -> Reduction {
        match self {
            Self::Mean => Reduction::Mean,
            Self::Sum => Reduction::Sum,
            Self::Median => Reduction::Median,
            Self::Std => Reduction::Std,
            Self::Var => Reduction::Var,
            Self::MinFrame => Reduction::Min,
            Self::MaxFrame => Reduction::Max,
        }
    }
}

/// Differential operators over gridded fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialOperator {
    GradX,
    GradY,
    Laplacian,
    Div,
    Curl,
}

impl SpatialOperator {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let op = match name {
            "grad_x" => Self::GradX,
            "grad_y" => Self::GradY,
            "laplacian" => Self::Laplacian,
            "div" => Self::Div,
            "curl" => Self::Curl,
            _ => return None,
        };
        Some(op)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::GradX => "grad_x",
            Self::GradY => "grad_y",
            Self::Laplacian => "laplacian",
            Self::Div => "div",
            Self::Curl => "curl",
        }
    }

    #[must_use]
    pub fn arity(self) -> usize {
        match self {
            Self::GradX | Self::GradY | Self::Laplacian => 1,
            Self::Div | Self::Curl => 2,
        }
    }
}
