#![forbid(unsafe_code)]

//! Spatial operator evaluation over gridded fields.
//!
//! A formula containing spatial-operator tokens is walked recursively:
//! subtrees without spatial tokens evaluate on the scalar path and are
//! projected onto the request's shared grid; spatial calls grid their
//! arguments first and then apply finite-difference operators through the
//! [`backend::Backend`] interface. `laplacian` is gradient-of-gradient,
//! matching the rest of the system's numerics, not a one-shot stencil.

mod backend;
#[cfg(feature = "gpu")]
mod gpu;

pub use backend::{Axis, Backend, CpuBackend};
#[cfg(feature = "gpu")]
pub use gpu::WgpuBackend;

use ff_expr::{
    BinaryOp, EvaluationContext, Expr, FormulaError, MathFunction, ScalarEvaluator,
    SpatialOperator, UnaryOp, parse_formula,
};
use ff_frame::Frame;
use ff_grid::{GeometryError, Grid, GridPair, ScatterValues, grid_scattered, meshgrid};
use ff_types::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SpatialError {
    #[error(transparent)]
    Formula(#[from] FormulaError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("gpu error: {0}")]
    Gpu(String),
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

impl SpatialError {
    /// Structural errors (bad arity, unknown function) propagate from the
    /// GPU path instead of falling back; everything else retries on CPU.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Formula(FormulaError::Arity { .. })
                | Self::Formula(FormulaError::UnknownFunction(_))
        )
    }
}

/// One computed field on the request's shared coordinate system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GriddedField {
    pub grid: GridPair,
    pub values: Grid,
}

/// Evaluates spatial-operator formulas for one frame.
#[derive(Debug, Clone)]
pub struct SpatialEvaluator {
    scalar: ScalarEvaluator,
}

impl SpatialEvaluator {
    #[must_use]
    pub fn new(context: EvaluationContext) -> Self {
        Self {
            scalar: ScalarEvaluator::new(context),
        }
    }

    #[must_use]
    pub fn context(&self) -> &EvaluationContext {
        self.scalar.context()
    }

    /// Evaluate the axis formulas once, producing the scatter coordinates
    /// every gridding call of this computation shares.
    pub fn axis_coordinates(
        &self,
        frame: &Frame,
        x_formula: &str,
        y_formula: &str,
    ) -> Result<(Vec<f64>, Vec<f64>), SpatialError> {
        let rows = frame.len().max(1);
        let xs = self.scalar.evaluate(frame, x_formula)?.into_vector(rows);
        let ys = self.scalar.evaluate(frame, y_formula)?.into_vector(rows);
        Ok((xs, ys))
    }

    /// Evenly spaced grid over the observed coordinate range at the given
    /// `(width, height)` resolution.
    pub fn grid_for_coordinates(
        xs: &[f64],
        ys: &[f64],
        resolution: (usize, usize),
    ) -> Result<GridPair, SpatialError> {
        let (x_min, x_max) =
            finite_bounds(xs).ok_or(SpatialError::Geometry(GeometryError::NoValidPoints))?;
        let (y_min, y_max) =
            finite_bounds(ys).ok_or(SpatialError::Geometry(GeometryError::NoValidPoints))?;
        let (width, height) = resolution;
        Ok(meshgrid(x_min, x_max, y_min, y_max, width, height))
    }

    /// Full single-formula entry point: axis evaluation, gridding, and
    /// recursive operator application.
    pub fn compute_gridded_field(
        &self,
        frame: &Frame,
        formula: &str,
        x_formula: &str,
        y_formula: &str,
        resolution: (usize, usize),
        use_gpu: bool,
    ) -> Result<GriddedField, SpatialError> {
        let (xs, ys) = self.axis_coordinates(frame, x_formula, y_formula)?;
        let pair = Self::grid_for_coordinates(&xs, &ys, resolution)?;
        let values = self.compute_on_grid(frame, formula, &xs, &ys, &pair, use_gpu)?;
        Ok(GriddedField { grid: pair, values })
    }

    /// Evaluate one formula onto an existing shared grid. Callers with
    /// several fields in one request reuse the same `xs`/`ys`/`pair`.
    pub fn compute_on_grid(
        &self,
        frame: &Frame,
        formula: &str,
        xs: &[f64],
        ys: &[f64],
        pair: &GridPair,
        use_gpu: bool,
    ) -> Result<Grid, SpatialError> {
        let expr = parse_formula(formula)?;
        check_structure(&expr)?;

        #[cfg(feature = "gpu")]
        if use_gpu {
            if expr.contains_aggregate() {
                debug!(formula, "formula contains frame aggregates; gpu skipped");
            } else {
                match gpu::WgpuBackend::new() {
                    Ok(gpu_backend) => {
                        match self.run(&expr, frame, xs, ys, pair, &gpu_backend) {
                            Ok(grid) => return Ok(grid),
                            Err(error) if error.is_structural() => return Err(error),
                            Err(error) => {
                                tracing::warn!(%error, "gpu evaluation failed; falling back to cpu");
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "gpu unavailable; falling back to cpu");
                    }
                }
            }
        }
        #[cfg(not(feature = "gpu"))]
        if use_gpu {
            debug!(formula, "gpu requested but not compiled in; using cpu");
        }

        self.run(&expr, frame, xs, ys, pair, &CpuBackend)
    }

    fn run<B: Backend>(
        &self,
        expr: &Expr,
        frame: &Frame,
        xs: &[f64],
        ys: &[f64],
        pair: &GridPair,
        backend: &B,
    ) -> Result<Grid, SpatialError> {
        let grid_x = backend.upload(&pair.x)?;
        let grid_y = backend.upload(&pair.y)?;
        let env = GridEnv {
            scalar: &self.scalar,
            frame,
            xs,
            ys,
            pair,
            backend,
            grid_x,
            grid_y,
        };
        let result = env.eval_node(expr)?;
        backend.to_host(&result)
    }
}

struct GridEnv<'a, B: Backend> {
    scalar: &'a ScalarEvaluator,
    frame: &'a Frame,
    xs: &'a [f64],
    ys: &'a [f64],
    pair: &'a GridPair,
    backend: &'a B,
    grid_x: B::Array,
    grid_y: B::Array,
}

impl<B: Backend> GridEnv<'_, B> {
    fn eval_node(&self, expr: &Expr) -> Result<B::Array, SpatialError> {
        // Any subtree free of spatial tokens is a scalar formula: evaluate
        // it point-wise over the frame and project onto the shared grid.
        if !expr.contains_spatial() {
            let value = self.scalar.evaluate_parsed(self.frame, expr)?;
            let grid = self.project(value)?;
            return self.backend.upload(&grid);
        }

        match expr {
            Expr::Unary { op, operand } => {
                let inner = self.eval_node(operand)?;
                match op {
                    UnaryOp::Plus => Ok(inner),
                    UnaryOp::Neg => self.backend.negate(&inner),
                }
            }
            Expr::Binary { op, left, right } => {
                let lhs = self.eval_node(left)?;
                let rhs = self.eval_node(right)?;
                self.backend.binary(*op, &lhs, &rhs)
            }
            Expr::Call { function, args } => self.eval_call(function, args),
            // Number/Name subtrees never contain spatial tokens.
            Expr::Number { .. } | Expr::Name { .. } => unreachable!("handled by scalar path"),
        }
    }

    fn eval_call(&self, function: &str, args: &[Expr]) -> Result<B::Array, SpatialError> {
        if let Some(op) = SpatialOperator::from_name(function) {
            return self.eval_spatial(op, args);
        }
        if let Some(math) = MathFunction::from_name(function) {
            if math.arity() == 1 {
                let inner = self.eval_node(&args[0])?;
                return self.backend.math1(math, &inner);
            }
            let lhs = self.eval_node(&args[0])?;
            let rhs = self.eval_node(&args[1])?;
            return self.backend.math2(math, &lhs, &rhs);
        }
        if ff_expr::AggregateFunction::from_name(function).is_some() {
            return Err(SpatialError::Evaluation(format!(
                "frame aggregate '{function}' cannot reduce a gridded field"
            )));
        }
        Err(FormulaError::UnknownFunction(function.to_owned()).into())
    }

    fn eval_spatial(
        &self,
        op: SpatialOperator,
        args: &[Expr],
    ) -> Result<B::Array, SpatialError> {
        let backend = self.backend;
        match op {
            SpatialOperator::GradX => {
                let field = self.eval_node(&args[0])?;
                backend.gradient(&field, &self.grid_x, Axis::X)
            }
            SpatialOperator::GradY => {
                let field = self.eval_node(&args[0])?;
                backend.gradient(&field, &self.grid_y, Axis::Y)
            }
            SpatialOperator::Laplacian => {
                // two-pass gradient-of-gradient along each axis, then sum
                let field = self.eval_node(&args[0])?;
                let gx = backend.gradient(&field, &self.grid_x, Axis::X)?;
                let gxx = backend.gradient(&gx, &self.grid_x, Axis::X)?;
                let gy = backend.gradient(&field, &self.grid_y, Axis::Y)?;
                let gyy = backend.gradient(&gy, &self.grid_y, Axis::Y)?;
                backend.binary(BinaryOp::Add, &gxx, &gyy)
            }
            SpatialOperator::Div => {
                let u = self.eval_node(&args[0])?;
                let v = self.eval_node(&args[1])?;
                let du_dx = backend.gradient(&u, &self.grid_x, Axis::X)?;
                let dv_dy = backend.gradient(&v, &self.grid_y, Axis::Y)?;
                backend.binary(BinaryOp::Add, &du_dx, &dv_dy)
            }
            SpatialOperator::Curl => {
                let u = self.eval_node(&args[0])?;
                let v = self.eval_node(&args[1])?;
                let dv_dx = backend.gradient(&v, &self.grid_x, Axis::X)?;
                let du_dy = backend.gradient(&u, &self.grid_y, Axis::Y)?;
                backend.binary(BinaryOp::Sub, &dv_dx, &du_dy)
            }
        }
    }

    fn project(&self, value: Value) -> Result<Grid, SpatialError> {
        let grid = match value {
            Value::Scalar(v) => {
                grid_scattered(self.xs, self.ys, ScatterValues::Constant(v), self.pair)?
            }
            Value::Vector(values) => {
                grid_scattered(self.xs, self.ys, ScatterValues::PerPoint(&values), self.pair)?
            }
        };
        Ok(grid)
    }
}

/// Pre-dispatch structural pass: argument counts and unknown callees are
/// hard errors on every backend, so they are checked before any compute.
fn check_structure(expr: &Expr) -> Result<(), FormulaError> {
    match expr {
        Expr::Number { .. } | Expr::Name { .. } => Ok(()),
        Expr::Unary { operand, .. } => check_structure(operand),
        Expr::Binary { left, right, .. } => {
            check_structure(left)?;
            check_structure(right)
        }
        Expr::Call { function, args } => {
            if let Some(op) = SpatialOperator::from_name(function) {
                if args.len() != op.arity() {
                    return Err(FormulaError::Arity {
                        function: op.name().to_owned(),
                        expected: op.arity(),
                        found: args.len(),
                    });
                }
            } else if let Some(math) = MathFunction::from_name(function) {
                if args.len() != math.arity() {
                    return Err(FormulaError::Arity {
                        function: function.clone(),
                        expected: math.arity(),
                        found: args.len(),
                    });
                }
            } else if let Some(aggregate) = ff_expr::AggregateFunction::from_name(function) {
                if args.len() != 1 {
                    return Err(FormulaError::Arity {
                        function: aggregate.name().to_owned(),
                        expected: 1,
                        found: args.len(),
                    });
                }
            } else {
                return Err(FormulaError::UnknownFunction(function.clone()));
            }
            for arg in args {
                check_structure(arg)?;
            }
            Ok(())
        }
    }
}

fn finite_bounds(values: &[f64]) -> Option<(f64, f64)> {
    let mut bounds: Option<(f64, f64)> = None;
    for &v in values {
        if v.is_finite() {
            bounds = Some(match bounds {
                Some((lo, hi)) => (lo.min(v), hi.max(v)),
                None => (v, v),
            });
        }
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::{SpatialError, SpatialEvaluator};
    use ff_expr::{EvaluationContext, FormulaError};
    use ff_frame::Frame;

    const N: usize = 17;

    /// Lattice frame whose points coincide with the evaluation grid, so
    /// gridding is exact and operator accuracy is purely finite-difference.
    fn lattice_frame() -> Frame {
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        let mut p = Vec::new();
        let mut u = Vec::new();
        let mut v = Vec::new();
        for r in 0..N {
            for c in 0..N {
                let x = c as f64 / (N - 1) as f64;
                let y = r as f64 / (N - 1) as f64;
                xs.push(x);
                ys.push(y);
                p.push(x * x + y * y);
                u.push(-y);
                v.push(x);
            }
        }
        Frame::new(
            0.0,
            vec![("x", xs), ("y", ys), ("p", p), ("u", u), ("v", v)],
        )
        .expect("frame")
    }

    fn evaluator() -> SpatialEvaluator {
        SpatialEvaluator::new(EvaluationContext::from_variables(
            ["x", "y", "p", "u", "v"].map(str::to_owned),
        ))
    }

    fn compute(formula: &str) -> super::GriddedField {
        evaluator()
            .compute_gridded_field(&lattice_frame(), formula, "x", "y", (N, N), false)
            .expect("compute")
    }

    #[test]
    fn laplacian_of_paraboloid_approximates_four() {
        let field = compute("laplacian(p)");
        for r in 3..N - 3 {
            for c in 3..N - 3 {
                let got = field.values.get(r, c);
                assert!((got - 4.0).abs() < 1e-6, "({r},{c}): {got}");
            }
        }
    }

    #[test]
    fn curl_of_rigid_rotation_is_two_everywhere() {
        let field = compute("curl(u, v)");
        for &value in field.values.data() {
            assert!((value - 2.0).abs() < 1e-9, "{value}");
        }
    }

    #[test]
    fn divergence_of_identity_flow_is_two() {
        let field = compute("div(x, y)");
        for &value in field.values.data() {
            assert!((value - 2.0).abs() < 1e-9, "{value}");
        }
    }

    #[test]
    fn grad_x_of_x_is_one() {
        let field = compute("grad_x(x)");
        for &value in field.values.data() {
            assert!((value - 1.0).abs() < 1e-9, "{value}");
        }
    }

    #[test]
    fn nested_spatial_operators_share_the_grid_shape() {
        let nested = compute("grad_x(curl(u, v))");
        let single = compute("grad_x(p)");
        assert_eq!(nested.values.shape(), single.values.shape());
        assert_eq!(nested.grid, single.grid);
    }

    #[test]
    fn aggregates_inside_spatial_arguments_are_supported() {
        let field = compute("laplacian(p - mean(p))");
        // subtracting a frame-wide constant leaves the laplacian unchanged
        let reference = compute("laplacian(p)");
        for (a, b) in field.values.data().iter().zip(reference.values.data()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn spatial_results_compose_with_elementwise_math() {
        let field = compute("abs(curl(u, v)) * 0.5 + 1");
        for &value in field.values.data() {
            assert!((value - 2.0).abs() < 1e-9, "{value}");
        }
    }

    #[test]
    fn recomputation_is_bit_identical() {
        let first = compute("laplacian(p) + curl(u, v)");
        let second = compute("laplacian(p) + curl(u, v)");
        assert_eq!(first.values, second.values);
        assert_eq!(first.grid, second.grid);
    }

    #[test]
    fn operator_arity_mismatches_are_reported() {
        let err = evaluator()
            .compute_gridded_field(&lattice_frame(), "div(u)", "x", "y", (8, 8), false)
            .expect_err("must fail");
        assert_eq!(
            err,
            SpatialError::Formula(FormulaError::Arity {
                function: "div".to_owned(),
                expected: 2,
                found: 1,
            })
        );
    }

    #[test]
    fn unknown_functions_are_reported_before_compute() {
        let err = evaluator()
            .compute_gridded_field(&lattice_frame(), "vorticity(u, v)", "x", "y", (8, 8), false)
            .expect_err("must fail");
        assert_eq!(
            err,
            SpatialError::Formula(FormulaError::UnknownFunction("vorticity".to_owned()))
        );
    }

    #[test]
    fn aggregate_over_a_gridded_field_is_rejected() {
        let err = evaluator()
            .compute_gridded_field(&lattice_frame(), "mean(curl(u, v))", "x", "y", (8, 8), false)
            .expect_err("must fail");
        assert!(matches!(err, SpatialError::Evaluation(_)));
    }

    #[test]
    fn constant_formulas_broadcast_over_the_grid() {
        let field = compute("2 * pi + laplacian(p) * 0");
        for &value in field.values.data() {
            assert!((value - 2.0 * std::f64::consts::PI).abs() < 1e-9);
        }
    }

    #[test]
    fn gpu_request_falls_back_to_cpu_when_unavailable() {
        let cpu = compute("curl(u, v)");
        let via_flag = evaluator()
            .compute_gridded_field(&lattice_frame(), "curl(u, v)", "x", "y", (N, N), true)
            .expect("fallback");
        assert_eq!(cpu.values, via_flag.values);
    }
}
