//! Array-backend abstraction for spatial operator evaluation.
//!
//! The evaluator is written against [`Backend`] only; the CPU backend here
//! is always available, and the `gpu` feature adds a wgpu implementation
//! of the same interface. Gradients are non-uniform-spacing-aware central
//! differences with first-order one-sided differences at the edges.

use ff_expr::{BinaryOp, MathFunction};
use ff_grid::{Grid, GridPair};

use crate::SpatialError;

/// Grid axis a differential operator works along: `X` varies across
/// columns, `Y` across rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

/// One compute backend. `Array` is the device-side representation; the
/// CPU backend uses host grids directly, so upload and download are
/// identity there.
pub trait Backend {
    type Array;

    fn upload(&self, grid: &Grid) -> Result<Self::Array, SpatialError>;
    fn to_host(&self, array: &Self::Array) -> Result<Grid, SpatialError>;
    fn binary(
        &self,
        op: BinaryOp,
        left: &Self::Array,
        right: &Self::Array,
    ) -> Result<Self::Array, SpatialError>;
    fn negate(&self, array: &Self::Array) -> Result<Self::Array, SpatialError>;
    fn math1(&self, f: MathFunction, array: &Self::Array) -> Result<Self::Array, SpatialError>;
    fn math2(
        &self,
        f: MathFunction,
        left: &Self::Array,
        right: &Self::Array,
    ) -> Result<Self::Array, SpatialError>;
    /// First-order derivative of `field` along `axis`, using the matching
    /// coordinate array of the shared grid for spacing.
    fn gradient(
        &self,
        field: &Self::Array,
        coords: &Self::Array,
        axis: Axis,
    ) -> Result<Self::Array, SpatialError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Array = Grid;

    fn upload(&self, grid: &Grid) -> Result<Grid, SpatialError> {
        Ok(grid.clone())
    }

    fn to_host(&self, array: &Grid) -> Result<Grid, SpatialError> {
        Ok(array.clone())
    }

    fn binary(&self, op: BinaryOp, left: &Grid, right: &Grid) -> Result<Grid, SpatialError> {
        let f: fn(f64, f64) -> f64 = match op {
            BinaryOp::Add => |a, b| a + b,
            BinaryOp::Sub => |a, b| a - b,
            BinaryOp::Mul => |a, b| a * b,
            BinaryOp::Div => |a, b| a / b,
            BinaryOp::Pow => f64::powf,
        };
        left.zip_map(right, f)
            .map_err(|error| SpatialError::Evaluation(error.to_string()))
    }

    fn negate(&self, array: &Grid) -> Result<Grid, SpatialError> {
        Ok(array.map(|v| -v))
    }

    fn math1(&self, f: MathFunction, array: &Grid) -> Result<Grid, SpatialError> {
        Ok(array.map(|v| f.apply1(v)))
    }

    fn math2(&self, f: MathFunction, left: &Grid, right: &Grid) -> Result<Grid, SpatialError> {
        left.zip_map(right, |a, b| f.apply2(a, b))
            .map_err(|error| SpatialError::Evaluation(error.to_string()))
    }

    fn gradient(&self, field: &Grid, coords: &Grid, axis: Axis) -> Result<Grid, SpatialError> {
        gradient_host(field, coords, axis)
    }
}

/// Host implementation of the non-uniform gradient; also the reference
/// the GPU shader mirrors.
pub(crate) fn gradient_host(
    field: &Grid,
    coords: &Grid,
    axis: Axis,
) -> Result<Grid, SpatialError> {
    if field.shape() != coords.shape() {
        return Err(SpatialError::Evaluation(
            "field and coordinate grids disagree on shape".to_owned(),
        ));
    }
    let (rows, cols) = field.shape();
    let len = match axis {
        Axis::X => cols,
        Axis::Y => rows,
    };
    if len < 2 {
        return Err(SpatialError::Evaluation(format!(
            "grid too small for a gradient along {axis:?}: {len} samples"
        )));
    }

    let sample = |r: usize, c: usize, k: usize| -> (f64, f64) {
        match axis {
            Axis::X => (field.get(r, k), coords.get(r, k)),
            Axis::Y => (field.get(k, c), coords.get(k, c)),
        }
    };

    let mut out = Grid::filled(rows, cols, 0.0);
    for r in 0..rows {
        for c in 0..cols {
            let i = match axis {
                Axis::X => c,
                Axis::Y => r,
            };
            let value = if i == 0 {
                let (f0, x0) = sample(r, c, 0);
                let (f1, x1) = sample(r, c, 1);
                (f1 - f0) / (x1 - x0)
            } else if i == len - 1 {
                let (f0, x0) = sample(r, c, len - 2);
                let (f1, x1) = sample(r, c, len - 1);
                (f1 - f0) / (x1 - x0)
            } else {
                let (f_prev, x_prev) = sample(r, c, i - 1);
                let (f_mid, x_mid) = sample(r, c, i);
                let (f_next, x_next) = sample(r, c, i + 1);
                let h1 = x_mid - x_prev;
                let h2 = x_next - x_mid;
                -h2 / (h1 * (h1 + h2)) * f_prev
                    + (h2 - h1) / (h1 * h2) * f_mid
                    + h1 / (h2 * (h1 + h2)) * f_next
            };
            out.set(r, c, value);
        }
    }
    Ok(out)
}
