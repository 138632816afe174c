#![forbid(unsafe_code)]

//! Dataset-wide statistics and custom global constants.
//!
//! Base statistics stream once over all frames, combining per-frame
//! partial aggregates with the numerically stable parallel-variance rule.
//! Custom constants run either as a streaming sum/sum-of-squares pass (no
//! spatial operators) or as an embarrassingly parallel per-frame gridded
//! reduction on a bounded worker pool.

mod running;

pub use running::RunningStats;

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ff_columnar::{Reduction, reduce_slice};
use ff_expr::{
    AggregateFunction, EvaluationContext, FormulaError, MathFunction, ScalarEvaluator,
    SpatialOperator, Validator, parse_formula,
};
use ff_source::FrameSource;
use ff_spatial::{SpatialError, SpatialEvaluator};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("worker pool crashed: {0}")]
    PoolCrashed(String),
    #[error("computation cancelled")]
    Cancelled,
    #[error("invalid constant definition '{name}': {reason}")]
    InvalidConstant { name: String, reason: String },
    #[error("constant '{name}' received no data")]
    NoData { name: String },
    #[error(transparent)]
    Formula(#[from] FormulaError),
    #[error(transparent)]
    Spatial(#[from] SpatialError),
}

/// Cooperative cancellation for long-running batches. Checked between
/// frames; in-flight per-frame work is allowed to complete.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Tuning for batch computations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Fixed moderate grid resolution used when a custom constant's
    /// expression needs the spatial path.
    pub spatial_resolution: (usize, usize),
    /// Worker pool size; `None` sizes conservatively at half the
    /// available cores to bound peak interpolation memory.
    pub worker_cap: Option<usize>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            spatial_resolution: (64, 64),
            worker_cap: None,
        }
    }
}

/// One user-defined global constant: `name = aggregate(expression)` over
/// the entire dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstantDefinition {
    pub name: String,
    pub aggregate: ConstantAggregate,
    pub expression: String,
}

/// Aggregates allowed for custom constants (median/min/max are frame
/// aggregates only and not available at this layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstantAggregate {
    Mean,
    Sum,
    Std,
    Var,
}

impl ConstantAggregate {
    #[must_use]
    fn reduction(self) -> Reduction {
        match self {
            Self::Mean => Reduction::Mean,
            Self::Sum => Reduction::Sum,
            Self::Std => Reduction::Std,
            Self::Var => Reduction::Var,
        }
    }
}

/// One streaming pass over every frame, producing per-variable statistics
/// across all points in all frames.
pub fn compute_base_statistics(
    source: &dyn FrameSource,
    cancel: &CancelToken,
) -> Result<BTreeMap<String, RunningStats>, StatsError> {
    let variables = source.variables();
    let mut totals: BTreeMap<String, RunningStats> = variables
        .iter()
        .map(|name| (name.clone(), RunningStats::new()))
        .collect();

    for frame in source.iter_frames(&variables) {
        if cancel.is_cancelled() {
            return Err(StatsError::Cancelled);
        }
        for name in &variables {
            let Some(column) = frame.column(name) else {
                continue;
            };
            let mut partial = RunningStats::new();
            for &value in column.values() {
                partial.push(value);
            }
            // frames with zero valid samples merge as identity
            let total = totals.get_mut(name).expect("seeded above");
            *total = RunningStats::merge(total, &partial);
        }
    }
    Ok(totals)
}

/// Autogenerated constant namespace entries, named
/// `{var}_global_{mean|sum|std|var|min|max}`. Variables with no finite
/// samples contribute nothing.
#[must_use]
pub fn global_constant_entries(
    statistics: &BTreeMap<String, RunningStats>,
) -> Vec<(String, f64)> {
    let mut entries = Vec::new();
    for (name, stats) in statistics {
        if stats.is_empty() {
            continue;
        }
        entries.push((format!("{name}_global_mean"), stats.mean()));
        entries.push((format!("{name}_global_sum"), stats.sum()));
        entries.push((format!("{name}_global_std"), stats.std()));
        entries.push((format!("{name}_global_var"), stats.variance()));
        entries.push((format!("{name}_global_min"), stats.min()));
        entries.push((format!("{name}_global_max"), stats.max()));
    }
    entries
}

/// Compute a batch of custom constants. Definitions are validated up
/// front (fail fast, before any computation); later definitions may
/// reference earlier ones, so the namespace threads sequentially.
pub fn compute_custom_constants(
    source: &dyn FrameSource,
    context: &EvaluationContext,
    definitions: &[ConstantDefinition],
    options: &BatchOptions,
    cancel: &CancelToken,
) -> Result<Vec<(String, f64)>, StatsError> {
    validate_definitions(context, definitions)?;

    let mut ctx = context.clone();
    let mut out = Vec::with_capacity(definitions.len());
    for definition in definitions {
        if cancel.is_cancelled() {
            return Err(StatsError::Cancelled);
        }
        let expr = parse_formula(&definition.expression)?;
        let value = if expr.contains_spatial() {
            spatial_constant(source, &ctx, definition, options, cancel)?
        } else {
            streaming_constant(source, &ctx, definition, cancel)?
        };
        debug!(name = %definition.name, value, "custom constant computed");
        ctx = ctx.with_constant(definition.name.clone(), value);
        out.push((definition.name.clone(), value));
    }
    Ok(out)
}

/// Evaluate a scalar formula over every frame on the worker pool,
/// returning each frame's per-point column (`None` where a frame failed
/// and was excluded).
pub fn compute_derived_variable(
    source: &dyn FrameSource,
    context: &EvaluationContext,
    formula: &str,
    options: &BatchOptions,
    cancel: &CancelToken,
) -> Result<Vec<Option<Vec<f64>>>, StatsError> {
    let expr = parse_formula(formula)?;
    if expr.contains_spatial() {
        return Err(StatsError::Formula(FormulaError::Validation(
            "derived variables are per-point scalar formulas".to_owned(),
        )));
    }

    let pool = build_pool(options.worker_cap)?;
    let indices: Vec<usize> = (0..source.frame_count()).collect();
    let results = catch_unwind(AssertUnwindSafe(|| {
        pool.install(|| {
            indices
                .par_iter()
                .map(|&index| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let handle = source.snapshot();
                    let frame = handle.frame(index)?;
                    let evaluator = ScalarEvaluator::new(context.clone());
                    match evaluator.evaluate(&frame, formula) {
                        Ok(value) => Some(value.into_vector(frame.len())),
                        Err(error) => {
                            warn!(frame = index, %error, "derived variable frame failed");
                            None
                        }
                    }
                })
                .collect::<Vec<_>>()
        })
    }))
    .map_err(|_| StatsError::PoolCrashed("worker panicked during derived variable".to_owned()))?;

    if cancel.is_cancelled() {
        return Err(StatsError::Cancelled);
    }
    Ok(results)
}

/// Streaming path: accumulate `sum(expr)`, `sum(expr^2)` and the sample
/// count across all points of all frames, point-weighted.
fn streaming_constant(
    source: &dyn FrameSource,
    context: &EvaluationContext,
    definition: &ConstantDefinition,
    cancel: &CancelToken,
) -> Result<f64, StatsError> {
    let validator = Validator::new(context.clone());
    let columns: Vec<String> = validator
        .used_variables(&definition.expression)?
        .into_iter()
        .collect();
    let evaluator = ScalarEvaluator::new(context.clone());
    let needs_squares = matches!(
        definition.aggregate,
        ConstantAggregate::Std | ConstantAggregate::Var
    );

    let mut sum = 0.0;
    let mut sum_squares = 0.0;
    let mut count: u64 = 0;
    for frame in source.iter_frames(&columns) {
        if cancel.is_cancelled() {
            return Err(StatsError::Cancelled);
        }
        match evaluator.evaluate(&frame, &definition.expression) {
            Ok(value) => {
                for v in value.into_vector(frame.len().max(1)) {
                    if !v.is_finite() {
                        continue;
                    }
                    sum += v;
                    if needs_squares {
                        sum_squares += v * v;
                    }
                    count += 1;
                }
            }
            Err(error) => {
                warn!(time_key = frame.time_key(), %error, "constant frame failed");
            }
        }
    }

    if count == 0 {
        return Err(StatsError::NoData {
            name: definition.name.clone(),
        });
    }
    let n = count as f64;
    let mean = sum / n;
    let value = match definition.aggregate {
        ConstantAggregate::Sum => sum,
        ConstantAggregate::Mean => mean,
        // E[x^2] - E[x]^2, clamped against catastrophic cancellation
        ConstantAggregate::Var => (sum_squares / n - mean * mean).max(0.0),
        ConstantAggregate::Std => (sum_squares / n - mean * mean).max(0.0).sqrt(),
    };
    Ok(value)
}

/// Spatial path: each frame independently grids the expression over its
/// `x`/`y` coordinates at a fixed moderate resolution and reduces the
/// grid; the constant is the unweighted mean of the per-frame scalars.
/// (Deliberately not the point-weighted reduction of the streaming path.)
fn spatial_constant(
    source: &dyn FrameSource,
    context: &EvaluationContext,
    definition: &ConstantDefinition,
    options: &BatchOptions,
    cancel: &CancelToken,
) -> Result<f64, StatsError> {
    let pool = build_pool(options.worker_cap)?;
    let indices: Vec<usize> = (0..source.frame_count()).collect();
    let reduction = definition.aggregate.reduction();
    let resolution = options.spatial_resolution;
    let expression = definition.expression.clone();

    let per_frame = catch_unwind(AssertUnwindSafe(|| {
        pool.install(|| {
            indices
                .par_iter()
                .map(|&index| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    // worker-local handle and evaluator; the context
                    // snapshot is immutable
                    let handle = source.snapshot();
                    let frame = handle.frame(index)?;
                    let evaluator = SpatialEvaluator::new(context.clone());
                    match evaluator.compute_gridded_field(
                        &frame,
                        &expression,
                        "x",
                        "y",
                        resolution,
                        false,
                    ) {
                        Ok(field) => reduce_slice(field.values.data(), reduction),
                        Err(error) => {
                            warn!(frame = index, %error, "spatial constant frame failed");
                            None
                        }
                    }
                })
                .collect::<Vec<_>>()
        })
    }))
    .map_err(|_| {
        StatsError::PoolCrashed("worker panicked during spatial constant".to_owned())
    })?;

    if cancel.is_cancelled() {
        return Err(StatsError::Cancelled);
    }

    let values: Vec<f64> = per_frame.into_iter().flatten().collect();
    if values.is_empty() {
        return Err(StatsError::NoData {
            name: definition.name.clone(),
        });
    }
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}

/// Reject a whole batch before computing anything: names must be fresh
/// identifiers and every expression must validate against the context
/// extended with the earlier definitions of the same batch.
fn validate_definitions(
    context: &EvaluationContext,
    definitions: &[ConstantDefinition],
) -> Result<(), StatsError> {
    let mut ctx = context.clone();
    let mut batch_names = BTreeSet::new();
    for definition in definitions {
        let name = definition.name.as_str();
        let reject = |reason: &str| StatsError::InvalidConstant {
            name: name.to_owned(),
            reason: reason.to_owned(),
        };

        if !is_identifier(name) {
            return Err(reject("name is not a valid identifier"));
        }
        if ctx.has_variable(name) || ctx.has_constant(name) || batch_names.contains(name) {
            return Err(reject("name collides with an existing variable or constant"));
        }
        if MathFunction::from_name(name).is_some()
            || AggregateFunction::from_name(name).is_some()
            || SpatialOperator::from_name(name).is_some()
        {
            return Err(reject("name collides with a function"));
        }
        if definition.expression.trim().is_empty() {
            return Err(reject("expression is empty"));
        }
        Validator::new(ctx.clone())
            .validate(&definition.expression)
            .map_err(|error| StatsError::InvalidConstant {
                name: name.to_owned(),
                reason: error.to_string(),
            })?;

        batch_names.insert(name.to_owned());
        // placeholder binding so later definitions can reference this one
        ctx = ctx.with_constant(name, 0.0);
    }
    Ok(())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Bounded worker pool, conservatively sized at half the available cores
/// unless capped explicitly.
fn build_pool(worker_cap: Option<usize>) -> Result<rayon::ThreadPool, StatsError> {
    let default_workers = std::thread::available_parallelism()
        .map(|n| (n.get() / 2).max(1))
        .unwrap_or(1);
    let workers = worker_cap.unwrap_or(default_workers).max(1);
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|error| StatsError::PoolCrashed(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{
        BatchOptions, CancelToken, ConstantAggregate, ConstantDefinition, RunningStats,
        StatsError, compute_base_statistics, compute_custom_constants,
        compute_derived_variable, global_constant_entries,
    };
    use ff_expr::EvaluationContext;
    use ff_frame::Frame;
    use ff_source::MemorySource;

    fn plain_frame(t: f64, p: Vec<f64>) -> Frame {
        let n = p.len();
        Frame::new(
            t,
            vec![
                ("x", (0..n).map(|i| i as f64).collect()),
                ("y", (0..n).map(|i| (i as f64) * 0.5).collect()),
                ("p", p),
            ],
        )
        .expect("frame")
    }

    fn source() -> MemorySource {
        MemorySource::new(vec![
            plain_frame(0.0, vec![1.0, 2.0]),
            plain_frame(1.0, vec![3.0, 4.0, 5.0]),
        ])
        .expect("source")
    }

    fn context() -> EvaluationContext {
        EvaluationContext::from_variables(["x", "y", "p"].map(str::to_owned))
    }

    #[test]
    fn base_statistics_cover_all_points_in_all_frames() {
        let stats = compute_base_statistics(&source(), &CancelToken::new()).expect("stats");
        let p = &stats["p"];
        assert_eq!(p.count(), 5);
        assert_eq!(p.mean(), 3.0);
        assert_eq!(p.sum(), 15.0);
        assert_eq!(p.min(), 1.0);
        assert_eq!(p.max(), 5.0);
        assert_eq!(p.variance(), 2.0);
    }

    #[test]
    fn global_entries_follow_the_naming_scheme() {
        let stats = compute_base_statistics(&source(), &CancelToken::new()).expect("stats");
        let entries = global_constant_entries(&stats);
        let names: Vec<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
        assert!(names.contains(&"p_global_mean"));
        assert!(names.contains(&"p_global_std"));
        assert!(names.contains(&"x_global_max"));
        let mean = entries
            .iter()
            .find(|(name, _)| name == "p_global_mean")
            .expect("entry")
            .1;
        assert_eq!(mean, 3.0);
    }

    #[test]
    fn streaming_constants_are_point_weighted() {
        // frames of different sizes: mean weights every point equally
        let defs = [ConstantDefinition {
            name: "p_avg".to_owned(),
            aggregate: ConstantAggregate::Mean,
            expression: "p".to_owned(),
        }];
        let out = compute_custom_constants(
            &source(),
            &context(),
            &defs,
            &BatchOptions::default(),
            &CancelToken::new(),
        )
        .expect("constants");
        assert_eq!(out, vec![("p_avg".to_owned(), 3.0)]);
    }

    #[test]
    fn streaming_variance_uses_expectation_identity() {
        let defs = [
            ConstantDefinition {
                name: "p_var".to_owned(),
                aggregate: ConstantAggregate::Var,
                expression: "p".to_owned(),
            },
            ConstantDefinition {
                name: "p_std".to_owned(),
                aggregate: ConstantAggregate::Std,
                expression: "p".to_owned(),
            },
        ];
        let out = compute_custom_constants(
            &source(),
            &context(),
            &defs,
            &BatchOptions::default(),
            &CancelToken::new(),
        )
        .expect("constants");
        assert!((out[0].1 - 2.0).abs() < 1e-12);
        assert!((out[1].1 - 2.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn later_definitions_see_earlier_ones() {
        let defs = [
            ConstantDefinition {
                name: "p_avg".to_owned(),
                aggregate: ConstantAggregate::Mean,
                expression: "p".to_owned(),
            },
            ConstantDefinition {
                name: "p_avg_doubled".to_owned(),
                aggregate: ConstantAggregate::Mean,
                expression: "p_avg * 2".to_owned(),
            },
        ];
        let out = compute_custom_constants(
            &source(),
            &context(),
            &defs,
            &BatchOptions::default(),
            &CancelToken::new(),
        )
        .expect("constants");
        assert_eq!(out[1], ("p_avg_doubled".to_owned(), 6.0));
    }

    #[test]
    fn invalid_definitions_fail_before_any_compute() {
        let cases = [
            ("1bad", "p", "not a valid identifier"),
            ("p", "p", "collides"),
            ("pi", "p", "collides"),
            ("mean", "p", "collides with a function"),
            ("fine", "undefined_thing", "unknown identifier"),
        ];
        for (name, expression, needle) in cases {
            let defs = [ConstantDefinition {
                name: name.to_owned(),
                aggregate: ConstantAggregate::Mean,
                expression: expression.to_owned(),
            }];
            let err = compute_custom_constants(
                &source(),
                &context(),
                &defs,
                &BatchOptions::default(),
                &CancelToken::new(),
            )
            .expect_err("must fail");
            assert!(
                err.to_string().contains(needle),
                "{name}: {err}"
            );
        }
    }

    #[test]
    fn spatial_constants_average_per_frame_reductions() {
        // two lattice frames with a rigid-rotation flow: curl == 2
        let mut frames = Vec::new();
        for t in 0..2 {
            let n = 9;
            let mut xs = Vec::new();
            let mut ys = Vec::new();
            let mut u = Vec::new();
            let mut v = Vec::new();
            for r in 0..n {
                for c in 0..n {
                    let x = c as f64 / (n - 1) as f64;
                    let y = r as f64 / (n - 1) as f64;
                    xs.push(x);
                    ys.push(y);
                    u.push(-y);
                    v.push(x);
                }
            }
            frames.push(
                Frame::new(t as f64, vec![("x", xs), ("y", ys), ("u", u), ("v", v)])
                    .expect("frame"),
            );
        }
        let source = MemorySource::new(frames).expect("source");
        let context = EvaluationContext::from_variables(["x", "y", "u", "v"].map(str::to_owned));

        let defs = [ConstantDefinition {
            name: "mean_vorticity".to_owned(),
            aggregate: ConstantAggregate::Mean,
            expression: "curl(u, v)".to_owned(),
        }];
        let options = BatchOptions {
            spatial_resolution: (9, 9),
            worker_cap: Some(2),
        };
        let out = compute_custom_constants(&source, &context, &defs, &options, &CancelToken::new())
            .expect("constants");
        assert!((out[0].1 - 2.0).abs() < 1e-6, "{}", out[0].1);
    }

    #[test]
    fn cancellation_surfaces_as_a_distinct_error() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let defs = [ConstantDefinition {
            name: "p_avg".to_owned(),
            aggregate: ConstantAggregate::Mean,
            expression: "p".to_owned(),
        }];
        let err = compute_custom_constants(
            &source(),
            &context(),
            &defs,
            &BatchOptions::default(),
            &cancel,
        )
        .expect_err("must cancel");
        assert!(matches!(err, StatsError::Cancelled));
    }

    #[test]
    fn derived_variables_come_back_per_frame() {
        let out = compute_derived_variable(
            &source(),
            &context(),
            "p * 2",
            &BatchOptions::default(),
            &CancelToken::new(),
        )
        .expect("derived");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Some(vec![2.0, 4.0]));
        assert_eq!(out[1], Some(vec![6.0, 8.0, 10.0]));
    }

    #[test]
    fn derived_variables_reject_spatial_formulas() {
        let err = compute_derived_variable(
            &source(),
            &context(),
            "grad_x(p)",
            &BatchOptions::default(),
            &CancelToken::new(),
        )
        .expect_err("must fail");
        assert!(matches!(err, StatsError::Formula(_)));
    }

    #[test]
    fn merged_running_stats_match_a_single_pass() {
        // deterministic pseudo-random samples, chunked unevenly
        let mut samples = Vec::new();
        let mut state: u64 = 0x2545_F491_4F6C_DD1D;
        for _ in 0..200 {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            samples.push(((state >> 33) as f64) / u32::MAX as f64 * 10.0 - 5.0);
        }

        let mut single = RunningStats::new();
        for &v in &samples {
            single.push(v);
        }

        let mut combined = RunningStats::new();
        for chunk in samples.chunks(17) {
            let mut partial = RunningStats::new();
            for &v in chunk {
                partial.push(v);
            }
            combined = RunningStats::merge(&combined, &partial);
        }

        assert_eq!(combined.count(), single.count());
        assert!((combined.mean() - single.mean()).abs() < 1e-10);
        assert!((combined.variance() - single.variance()).abs() < 1e-10);
        assert_eq!(combined.min(), single.min());
        assert_eq!(combined.max(), single.max());
    }
}
