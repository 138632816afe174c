use ff_columnar::reduce_slice;
use ff_frame::Frame;
use ff_types::Value;

use crate::FormulaError;
use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::context::EvaluationContext;
use crate::functions::{AggregateFunction, MathFunction, SpatialOperator};
use crate::parse::parse_formula;

/// Evaluates validated formulas point-wise against one frame.
///
/// Aggregate sub-expressions are resolved by a structural transform: each
/// aggregate call subtree is evaluated over the full frame, reduced to a
/// scalar, and replaced by a constant leaf before the final point-wise
/// pass. Evaluation sees a closed scope only — frame columns, the constant
/// namespace, and the math dispatch table.
#[derive(Debug, Clone)]
pub struct ScalarEvaluator {
    context: EvaluationContext,
}

impl ScalarEvaluator {
    #[must_use]
    pub fn new(context: EvaluationContext) -> Self {
        Self { context }
    }

    #[must_use]
    pub fn context(&self) -> &EvaluationContext {
        &self.context
    }

    /// Evaluate a formula string against a frame.
    pub fn evaluate(&self, frame: &Frame, formula: &str) -> Result<Value, FormulaError> {
        let trimmed = formula.trim();
        if trimmed.is_empty() {
            return Err(FormulaError::Evaluation("empty formula".to_owned()));
        }
        // Fast path: a formula that IS a column name returns the column
        // unchanged.
        if let Some(column) = frame.column(trimmed) {
            return Ok(column.to_value());
        }
        let expr = parse_formula(trimmed)?;
        self.evaluate_parsed(frame, &expr)
    }

    /// Evaluate an already-parsed expression tree against a frame.
    pub fn evaluate_parsed(&self, frame: &Frame, expr: &Expr) -> Result<Value, FormulaError> {
        if expr.contains_spatial() {
            return Err(FormulaError::Validation(
                "spatial operators require the gridded evaluation path".to_owned(),
            ));
        }
        let resolved = self.resolve_aggregates(expr.clone(), frame)?;
        self.eval_expr(&resolved, frame)
    }

    /// Replace every aggregate call subtree with a constant leaf holding
    /// its frame-level reduction. Innermost aggregates resolve first, so
    /// nested calls like `std(p - mean(p))` see their inner scalar.
    fn resolve_aggregates(&self, expr: Expr, frame: &Frame) -> Result<Expr, FormulaError> {
        let expr = match expr {
            Expr::Number { .. } | Expr::Name { .. } => expr,
            Expr::Unary { op, operand } => Expr::Unary {
                op,
                operand: Box::new(self.resolve_aggregates(*operand, frame)?),
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op,
                left: Box::new(self.resolve_aggregates(*left, frame)?),
                right: Box::new(self.resolve_aggregates(*right, frame)?),
            },
            Expr::Call { function, args } => {
                let args = args
                    .into_iter()
                    .map(|arg| self.resolve_aggregates(arg, frame))
                    .collect::<Result<Vec<_>, _>>()?;
                match AggregateFunction::from_name(&function) {
                    Some(aggregate) => {
                        if args.len() != 1 {
                            return Err(FormulaError::Arity {
                                function: aggregate.name().to_owned(),
                                expected: 1,
                                found: args.len(),
                            });
                        }
                        let inner = self.eval_expr(&args[0], frame)?;
                        let samples = inner.into_vector(frame.len().max(1));
                        let value = reduce_slice(&samples, aggregate.reduction())
                            .unwrap_or(f64::NAN);
                        Expr::Number { value }
                    }
                    None => Expr::Call { function, args },
                }
            }
        };
        Ok(expr)
    }

    fn eval_expr(&self, expr: &Expr, frame: &Frame) -> Result<Value, FormulaError> {
        match expr {
            Expr::Number { value } => Ok(Value::Scalar(*value)),
            Expr::Name { id } => self.resolve_name(id, frame),
            Expr::Unary { op, operand } => {
                let value = self.eval_expr(operand, frame)?;
                Ok(match op {
                    UnaryOp::Plus => value,
                    UnaryOp::Neg => value.map(|v| -v),
                })
            }
            Expr::Binary { op, left, right } => {
                let lhs = self.eval_expr(left, frame)?;
                let rhs = self.eval_expr(right, frame)?;
                apply_binary(*op, lhs, rhs)
            }
            Expr::Call { function, args } => self.eval_call(function, args, frame),
        }
    }

    fn resolve_name(&self, id: &str, frame: &Frame) -> Result<Value, FormulaError> {
        if let Some(column) = frame.column(id) {
            return Ok(column.to_value());
        }
        if let Some(value) = self.context.constant(id) {
            return Ok(Value::Scalar(value));
        }
        Err(FormulaError::UnknownVariable(id.to_owned()))
    }

    fn eval_call(
        &self,
        function: &str,
        args: &[Expr],
        frame: &Frame,
    ) -> Result<Value, FormulaError> {
        if let Some(math) = MathFunction::from_name(function) {
            if args.len() != math.arity() {
                return Err(FormulaError::Evaluation(format!(
                    "{function} expects {} argument(s), found {}",
                    math.arity(),
                    args.len()
                )));
            }
            if math.arity() == 1 {
                let value = self.eval_expr(&args[0], frame)?;
                return Ok(value.map(|v| math.apply1(v)));
            }
            let lhs = self.eval_expr(&args[0], frame)?;
            let rhs = self.eval_expr(&args[1], frame)?;
            return lhs
                .zip_with(rhs, |a, b| math.apply2(a, b))
                .map_err(|error| FormulaError::Evaluation(error.to_string()));
        }
        if AggregateFunction::from_name(function).is_some() {
            // resolve_aggregates rewrote every aggregate call before the
            // point-wise pass; reaching one here is a caller bug.
            return Err(FormulaError::Evaluation(format!(
                "unresolved aggregate call: {function}"
            )));
        }
        if SpatialOperator::from_name(function).is_some() {
            return Err(FormulaError::Validation(
                "spatial operators require the gridded evaluation path".to_owned(),
            ));
        }
        Err(FormulaError::UnknownFunction(function.to_owned()))
    }
}

pub(crate) fn apply_binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, FormulaError> {
    let f = binary_fn(op);
    lhs.zip_with(rhs, f)
        .map_err(|error| FormulaError::Evaluation(error.to_string()))
}

pub(crate) fn binary_fn(op: BinaryOp) -> fn(f64, f64) -> f64 {
    match op {
        BinaryOp::Add => |a, b| a + b,
        BinaryOp::Sub => |a, b| a - b,
        BinaryOp::Mul => |a, b| a * b,
        BinaryOp::Div => |a, b| a / b,
        BinaryOp::Pow => f64::powf,
    }
}
