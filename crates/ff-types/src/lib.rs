#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result of evaluating a formula against one frame: either a single scalar
/// (constant-only formulas) or one value per point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("vector length mismatch: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
}

impl Value {
    /// Length this value broadcasts over, or `None` for a bare scalar.
    #[must_use]
    pub fn broadcast_len(&self) -> Option<usize> {
        match self {
            Self::Scalar(_) => None,
            Self::Vector(v) => Some(v.len()),
        }
    }

    #[must_use]
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Vector(_) => None,
        }
    }

    /// Materialize as a vector of `len` elements, broadcasting scalars.
    #[must_use]
    pub fn into_vector(self, len: usize) -> Vec<f64> {
        match self {
            Self::Scalar(v) => vec![v; len],
            Self::Vector(v) => v,
        }
    }

    #[must_use]
    pub fn map(self, f: impl Fn(f64) -> f64) -> Self {
        match self {
            Self::Scalar(v) => Self::Scalar(f(v)),
            Self::Vector(v) => Self::Vector(v.into_iter().map(f).collect()),
        }
    }

    /// Element-wise combination with scalar broadcasting on either side.
    pub fn zip_with(self, other: Self, f: impl Fn(f64, f64) -> f64) -> Result<Self, ValueError> {
        match (self, other) {
            (Self::Scalar(a), Self::Scalar(b)) => Ok(Self::Scalar(f(a, b))),
            (Self::Scalar(a), Self::Vector(b)) => {
                Ok(Self::Vector(b.into_iter().map(|v| f(a, v)).collect()))
            }
            (Self::Vector(a), Self::Scalar(b)) => {
                Ok(Self::Vector(a.into_iter().map(|v| f(v, b)).collect()))
            }
            (Self::Vector(a), Self::Vector(b)) => {
                if a.len() != b.len() {
                    return Err(ValueError::LengthMismatch {
                        left: a.len(),
                        right: b.len(),
                    });
                }
                Ok(Self::Vector(
                    a.into_iter().zip(b).map(|(x, y)| f(x, y)).collect(),
                ))
            }
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(values: Vec<f64>) -> Self {
        Self::Vector(values)
    }
}

#[cfg(test)]
mod tests {
    use super::{Value, ValueError};

    #[test]
    fn map_applies_elementwise_on_both_shapes() {
        let scalar = Value::Scalar(4.0).map(f64::sqrt);
        assert_eq!(scalar, Value::Scalar(2.0));

        let vector = Value::Vector(vec![1.0, 4.0, 9.0]).map(f64::sqrt);
        assert_eq!(vector, Value::Vector(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn zip_with_broadcasts_scalar_operands() {
        let out = Value::Scalar(10.0)
            .zip_with(Value::Vector(vec![1.0, 2.0]), |a, b| a - b)
            .expect("broadcast");
        assert_eq!(out, Value::Vector(vec![9.0, 8.0]));

        let out = Value::Vector(vec![1.0, 2.0])
            .zip_with(Value::Scalar(10.0), |a, b| a * b)
            .expect("broadcast");
        assert_eq!(out, Value::Vector(vec![10.0, 20.0]));
    }

    #[test]
    fn zip_with_rejects_mismatched_vectors() {
        let err = Value::Vector(vec![1.0])
            .zip_with(Value::Vector(vec![1.0, 2.0]), |a, b| a + b)
            .expect_err("must fail");
        assert_eq!(err, ValueError::LengthMismatch { left: 1, right: 2 });
    }

    #[test]
    fn into_vector_broadcasts_scalars_to_requested_length() {
        assert_eq!(Value::Scalar(3.0).into_vector(3), vec![3.0, 3.0, 3.0]);
        assert_eq!(Value::Vector(vec![1.0, 2.0]).into_vector(5), vec![1.0, 2.0]);
    }

    #[test]
    fn value_round_trips_through_serde() {
        let value = Value::Vector(vec![1.5, -2.25]);
        let json = serde_json::to_string(&value).expect("serialize");
        let back: Value = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, value);
    }
}
