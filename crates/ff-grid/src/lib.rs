#![forbid(unsafe_code)]

//! Regular grids and scattered-data interpolation.
//!
//! The engine projects one frame's scattered samples onto an evenly spaced
//! meshgrid. The linear core is Delaunay/barycentric; cells outside the
//! convex hull and degenerate inputs fall back to nearest-neighbor, per
//! the two-pass composition described in the crate-level operations.

mod delaunay;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Interpolation refuses degenerate scattered input only after the
/// nearest-neighbor fallback is also impossible.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("no valid points to interpolate")]
    NoValidPoints,
    #[error("triangulation failed on degenerate input")]
    TriangulationFailed,
    #[error("point/value length mismatch: points={points}, values={values}")]
    LengthMismatch { points: usize, values: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("grid shape mismatch: ({left_rows}, {left_cols}) vs ({right_rows}, {right_cols})")]
    ShapeMismatch {
        left_rows: usize,
        left_cols: usize,
        right_rows: usize,
        right_cols: usize,
    },
}

/// Row-major (H, W) array of f64 samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Grid {
    #[must_use]
    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    #[must_use]
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self { rows, cols, data }
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[must_use]
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    pub fn zip_map(&self, other: &Self, f: impl Fn(f64, f64) -> f64) -> Result<Self, GridError> {
        if self.shape() != other.shape() {
            return Err(GridError::ShapeMismatch {
                left_rows: self.rows,
                left_cols: self.cols,
                right_rows: other.rows,
                right_cols: other.cols,
            });
        }
        Ok(Self {
            rows: self.rows,
            cols: self.cols,
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }

    /// Min/max over finite cells, or `None` when every cell is NaN.
    #[must_use]
    pub fn finite_range(&self) -> Option<(f64, f64)> {
        let mut range: Option<(f64, f64)> = None;
        for &v in &self.data {
            if v.is_finite() {
                range = Some(match range {
                    Some((lo, hi)) => (lo.min(v), hi.max(v)),
                    None => (v, v),
                });
            }
        }
        range
    }
}

/// The shared coordinate system of one visualization request: `x` varies
/// along columns, `y` along rows, both shaped (H, W).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPair {
    pub x: Grid,
    pub y: Grid,
}

impl GridPair {
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.x.shape()
    }

    /// X coordinates along one row (ascending for meshgrid output).
    #[must_use]
    pub fn x_axis(&self) -> Vec<f64> {
        (0..self.x.cols()).map(|c| self.x.get(0, c)).collect()
    }

    /// Y coordinates down one column (ascending for meshgrid output).
    #[must_use]
    pub fn y_axis(&self) -> Vec<f64> {
        (0..self.y.rows()).map(|r| self.y.get(r, 0)).collect()
    }
}

/// Evenly spaced meshgrid over the observed coordinate range,
/// `width` columns by `height` rows.
#[must_use]
pub fn meshgrid(
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
    width: usize,
    height: usize,
) -> GridPair {
    let x_step = |c: usize| {
        if width <= 1 {
            x_min
        } else {
            x_min + (x_max - x_min) * c as f64 / (width - 1) as f64
        }
    };
    let y_step = |r: usize| {
        if height <= 1 {
            y_min
        } else {
            y_min + (y_max - y_min) * r as f64 / (height - 1) as f64
        }
    };
    GridPair {
        x: Grid::from_fn(height, width, |_, c| x_step(c)),
        y: Grid::from_fn(height, width, |r, _| y_step(r)),
    }
}

/// Per-point payload for a gridding call.
#[derive(Debug, Clone, Copy)]
pub enum ScatterValues<'a> {
    /// No formula: produce an all-NaN grid.
    Missing,
    /// Constant-only formula: broadcast one scalar over the grid.
    Constant(f64),
    /// One value per scattered point.
    PerPoint(&'a [f64]),
}

const DEGENERATE_RANGE_EPS: f64 = 1e-9;

/// Project scattered point values onto `pair`'s grid.
///
/// Deterministic for identical inputs; coincident points are deduplicated
/// (first occurrence wins).
pub fn grid_scattered(
    xs: &[f64],
    ys: &[f64],
    values: ScatterValues<'_>,
    pair: &GridPair,
) -> Result<Grid, GeometryError> {
    let (rows, cols) = pair.shape();

    let value_slice = match values {
        ScatterValues::Missing => return Ok(Grid::filled(rows, cols, f64::NAN)),
        ScatterValues::Constant(v) => return Ok(Grid::filled(rows, cols, v)),
        ScatterValues::PerPoint(slice) => slice,
    };
    if xs.len() != ys.len() || xs.len() != value_slice.len() {
        return Err(GeometryError::LengthMismatch {
            points: xs.len().min(ys.len()),
            values: value_slice.len(),
        });
    }

    // Keep rows where coordinates and value are all finite; drop coincident
    // duplicates so the triangulation never sees zero-area cavities.
    let mut seen: HashSet<(u64, u64)> = HashSet::new();
    let mut points: Vec<(f64, f64)> = Vec::new();
    let mut point_values: Vec<f64> = Vec::new();
    for i in 0..xs.len() {
        let (x, y, v) = (xs[i], ys[i], value_slice[i]);
        if !(x.is_finite() && y.is_finite() && v.is_finite()) {
            continue;
        }
        if seen.insert((x.to_bits(), y.to_bits())) {
            points.push((x, y));
            point_values.push(v);
        }
    }

    if points.is_empty() {
        return Err(GeometryError::NoValidPoints);
    }

    if is_degenerate(&points) {
        return Ok(nearest_fill(
            &points,
            &point_values,
            pair,
            &Grid::filled(rows, cols, f64::NAN),
        ));
    }

    let triangles =
        delaunay::triangulate(&points).ok_or(GeometryError::TriangulationFailed)?;

    // Pass 1: linear barycentric inside the hull.
    let mut out = Grid::filled(rows, cols, f64::NAN);
    let x_axis = pair.x_axis();
    let y_axis = pair.y_axis();
    for tri in &triangles {
        let (a, b, c) = (points[tri[0]], points[tri[1]], points[tri[2]]);
        let denom = (b.1 - c.1) * (a.0 - c.0) + (c.0 - b.0) * (a.1 - c.1);
        if denom.abs() < f64::EPSILON {
            continue;
        }
        let min_x = a.0.min(b.0).min(c.0);
        let max_x = a.0.max(b.0).max(c.0);
        let min_y = a.1.min(b.1).min(c.1);
        let max_y = a.1.max(b.1).max(c.1);

        let c_lo = x_axis.partition_point(|&x| x < min_x);
        let c_hi = x_axis.partition_point(|&x| x <= max_x);
        let r_lo = y_axis.partition_point(|&y| y < min_y);
        let r_hi = y_axis.partition_point(|&y| y <= max_y);

        for r in r_lo..r_hi {
            for col in c_lo..c_hi {
                let px = x_axis[col];
                let py = y_axis[r];
                let w1 = ((b.1 - c.1) * (px - c.0) + (c.0 - b.0) * (py - c.1)) / denom;
                let w2 = ((c.1 - a.1) * (px - c.0) + (a.0 - c.0) * (py - c.1)) / denom;
                let w3 = 1.0 - w1 - w2;
                if w1 >= -1e-9 && w2 >= -1e-9 && w3 >= -1e-9 {
                    let interpolated = w1 * point_values[tri[0]]
                        + w2 * point_values[tri[1]]
                        + w3 * point_values[tri[2]];
                    out.set(r, col, interpolated);
                }
            }
        }
    }

    // Pass 2: nearest-neighbor fill restricted to cells the hull missed.
    Ok(nearest_fill(&points, &point_values, pair, &out))
}

/// Degenerate when fewer than 3 points remain, when the spread along
/// either axis collapses, or when every point is collinear.
fn is_degenerate(points: &[(f64, f64)]) -> bool {
    if points.len() < 3 {
        return true;
    }
    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for &(x, y) in points {
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }
    if max_x - min_x < DEGENERATE_RANGE_EPS || max_y - min_y < DEGENERATE_RANGE_EPS {
        return true;
    }

    let scale = (max_x - min_x).max(max_y - min_y);
    let origin = points[0];
    let reference = points[1];
    let (dx, dy) = (reference.0 - origin.0, reference.1 - origin.1);
    points.iter().skip(2).all(|&(x, y)| {
        let cross = dx * (y - origin.1) - dy * (x - origin.0);
        cross.abs() < 1e-12 * scale * scale
    })
}

/// Nearest-neighbor pass over the cells of `base` that are still NaN.
fn nearest_fill(
    points: &[(f64, f64)],
    values: &[f64],
    pair: &GridPair,
    base: &Grid,
) -> Grid {
    let (rows, cols) = pair.shape();
    let mut out = base.clone();
    for r in 0..rows {
        for c in 0..cols {
            if !out.get(r, c).is_nan() {
                continue;
            }
            let px = pair.x.get(r, c);
            let py = pair.y.get(r, c);
            let mut best = 0;
            let mut best_dist = f64::INFINITY;
            for (i, &(x, y)) in points.iter().enumerate() {
                let dist = (x - px) * (x - px) + (y - py) * (y - py);
                if dist < best_dist {
                    best_dist = dist;
                    best = i;
                }
            }
            out.set(r, c, values[best]);
        }
    }
    out
}
