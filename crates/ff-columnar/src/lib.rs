#![forbid(unsafe_code)]

use ff_types::Value;
use serde::{Deserialize, Serialize};

/// Tracks which rows of a column hold finite values. CFD exports routinely
/// carry NaN/inf markers for masked-off cells; every reduction and every
/// interpolation pass works on the valid subset only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityMask {
    bits: Vec<bool>,
}

impl ValidityMask {
    #[must_use]
    pub fn from_values(values: &[f64]) -> Self {
        let bits = values.iter().map(|value| value.is_finite()).collect();
        Self { bits }
    }

    #[must_use]
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.bits.iter().filter(|bit| **bit).count()
    }
}

/// A single named-variable payload: raw f64 samples plus their validity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    values: Vec<f64>,
    validity: ValidityMask,
}

impl Column {
    #[must_use]
    pub fn new(values: Vec<f64>) -> Self {
        let validity = ValidityMask::from_values(&values);
        Self { values, validity }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn validity(&self) -> &ValidityMask {
        &self.validity
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Vector(self.values.clone())
    }

    /// Finite values only, in row order.
    #[must_use]
    pub fn finite_values(&self) -> Vec<f64> {
        self.values
            .iter()
            .copied()
            .filter(|value| value.is_finite())
            .collect()
    }

    pub fn reduce(&self, reduction: Reduction) -> Option<f64> {
        reduce_slice(&self.values, reduction)
    }
}

/// Frame-level reductions used by aggregate formula functions. `Std` and
/// `Var` are population statistics (ddof = 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    Mean,
    Sum,
    Median,
    Std,
    Var,
    Min,
    Max,
}

/// Reduce a slice to one scalar over its finite values. Returns `None` when
/// no finite value is present.
pub fn reduce_slice(values: &[f64], reduction: Reduction) -> Option<f64> {
    let finite: Vec<f64> = values
        .iter()
        .copied()
        .filter(|value| value.is_finite())
        .collect();
    if finite.is_empty() {
        return None;
    }
    let count = finite.len() as f64;

    let out = match reduction {
        Reduction::Sum => finite.iter().sum(),
        Reduction::Mean => finite.iter().sum::<f64>() / count,
        Reduction::Median => {
            let mut sorted = finite.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite values are ordered"));
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 0 {
                (sorted[mid - 1] + sorted[mid]) / 2.0
            } else {
                sorted[mid]
            }
        }
        Reduction::Var => population_variance(&finite),
        Reduction::Std => population_variance(&finite).sqrt(),
        Reduction::Min => finite.iter().copied().fold(f64::INFINITY, f64::min),
        Reduction::Max => finite.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    };
    Some(out)
}

fn population_variance(finite: &[f64]) -> f64 {
    let count = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / count;
    finite.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count
}
