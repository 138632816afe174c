#![forbid(unsafe_code)]

//! Fieldflow: formula-driven exploration of time-varying 2D field data.
//!
//! The facade crate re-exports the workspace surface and provides the
//! visualization boundary: a [`RenderRequest`] evaluates up to four field
//! formulas for one frame, all projected onto a single shared grid.

pub use ff_columnar::{Column, Reduction, ValidityMask};
pub use ff_expr::{
    AggregateFunction, BinaryOp, ConstantNamespace, EvaluationContext, Expr, FormulaError,
    MathFunction, ScalarEvaluator, SpatialOperator, UnaryOp, Validator, parse_formula,
};
pub use ff_frame::{Frame, FrameError};
pub use ff_grid::{GeometryError, Grid, GridPair, ScatterValues, grid_scattered, meshgrid};
pub use ff_source::{FrameSource, MemorySource, SourceError};
pub use ff_spatial::{Axis, Backend, CpuBackend, GriddedField, SpatialError, SpatialEvaluator};
pub use ff_stats::{
    BatchOptions, CancelToken, ConstantAggregate, ConstantDefinition, RunningStats, StatsError,
    compute_base_statistics, compute_custom_constants, compute_derived_variable,
    global_constant_entries,
};
pub use ff_types::Value;

use serde::{Deserialize, Serialize};

/// One visualization request: shared axis formulas, optional field
/// formulas, grid resolution as `(width, height)`. Every formula must
/// already have passed [`Validator::validate`]; the engine raises typed
/// errors only for evaluation-time problems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub x_formula: String,
    pub y_formula: String,
    pub heatmap_formula: Option<String>,
    pub contour_formula: Option<String>,
    pub vector_u_formula: Option<String>,
    pub vector_v_formula: Option<String>,
    pub resolution: (usize, usize),
    pub use_gpu: bool,
}

/// One gridded field plus its finite value range (color/scale bounds for
/// the rendering collaborator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldData {
    pub values: Grid,
    pub min: f64,
    pub max: f64,
}

/// Response to a [`RenderRequest`]: every present field shares `grid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderData {
    pub grid: GridPair,
    pub heatmap: Option<FieldData>,
    pub contour: Option<FieldData>,
    pub vector_u: Option<FieldData>,
    pub vector_v: Option<FieldData>,
}

/// Evaluate a render request against one frame. The axis formulas are
/// evaluated exactly once; the resulting coordinates and meshgrid are
/// shared by every field in the request.
pub fn compute_render_data(
    frame: &Frame,
    context: &EvaluationContext,
    request: &RenderRequest,
) -> Result<RenderData, SpatialError> {
    let evaluator = SpatialEvaluator::new(context.clone());
    let (xs, ys) =
        evaluator.axis_coordinates(frame, &request.x_formula, &request.y_formula)?;
    let pair = SpatialEvaluator::grid_for_coordinates(&xs, &ys, request.resolution)?;

    let field = |formula: &Option<String>| -> Result<Option<FieldData>, SpatialError> {
        let Some(formula) = formula.as_deref() else {
            return Ok(None);
        };
        if formula.trim().is_empty() {
            return Ok(None);
        }
        let values =
            evaluator.compute_on_grid(frame, formula, &xs, &ys, &pair, request.use_gpu)?;
        let (min, max) = values.finite_range().unwrap_or((f64::NAN, f64::NAN));
        Ok(Some(FieldData { values, min, max }))
    };

    let heatmap = field(&request.heatmap_formula)?;
    let contour = field(&request.contour_formula)?;
    let vector_u = field(&request.vector_u_formula)?;
    let vector_v = field(&request.vector_v_formula)?;

    Ok(RenderData {
        grid: pair,
        heatmap,
        contour,
        vector_u,
        vector_v,
    })
}

/// Context for a freshly loaded dataset: schema variables plus the
/// science constants.
#[must_use]
pub fn dataset_context(source: &dyn FrameSource) -> EvaluationContext {
    EvaluationContext::from_variables(source.variables())
}

/// Context with the autogenerated `{var}_global_*` statistics bound,
/// recomputed by a full dataset scan.
pub fn context_with_global_statistics(
    source: &dyn FrameSource,
    cancel: &CancelToken,
) -> Result<EvaluationContext, StatsError> {
    let statistics = compute_base_statistics(source, cancel)?;
    let mut constants = ConstantNamespace::science();
    constants.extend(global_constant_entries(&statistics));
    Ok(EvaluationContext::new(source.variables(), constants))
}
