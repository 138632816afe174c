use std::collections::BTreeSet;

use crate::FormulaError;
use crate::ast::Expr;
use crate::context::EvaluationContext;
use crate::functions::{AggregateFunction, MathFunction, SpatialOperator};
use crate::parse::parse_formula;

/// Static allow-list validation of formulas against an immutable context
/// snapshot. Rebuilt (not mutated) whenever the active dataset's schema or
/// global statistics change.
#[derive(Debug, Clone)]
pub struct Validator {
    context: EvaluationContext,
}

impl Validator {
    #[must_use]
    pub fn new(context: EvaluationContext) -> Self {
        Self { context }
    }

    #[must_use]
    pub fn context(&self) -> &EvaluationContext {
        &self.context
    }

    /// Check a formula string. Empty or whitespace-only input is valid
    /// ("no formula").
    pub fn validate(&self, formula: &str) -> Result<(), FormulaError> {
        if formula.trim().is_empty() {
            return Ok(());
        }
        let expr = parse_formula(formula)?;
        self.check(&expr)
    }

    /// Registered data columns referenced as bare identifiers anywhere in
    /// the formula. Drives minimal fetch / transfer sets.
    pub fn used_variables(&self, formula: &str) -> Result<BTreeSet<String>, FormulaError> {
        if formula.trim().is_empty() {
            return Ok(BTreeSet::new());
        }
        let expr = parse_formula(formula)?;
        let mut used = BTreeSet::new();
        expr.for_each_name(&mut |id| {
            if self.context.has_variable(id) {
                used.insert(id.to_owned());
            }
        });
        Ok(used)
    }

    fn check(&self, expr: &Expr) -> Result<(), FormulaError> {
        match expr {
            Expr::Number { .. } => Ok(()),
            Expr::Name { id } => self.check_name(id),
            Expr::Unary { operand, .. } => self.check(operand),
            Expr::Binary { left, right, .. } => {
                self.check(left)?;
                self.check(right)
            }
            Expr::Call { function, args } => self.check_call(function, args),
        }
    }

    fn check_name(&self, id: &str) -> Result<(), FormulaError> {
        // Bare aggregate names are ambiguous with variable use and always
        // rejected, even though they are allowed function identifiers.
        if let Some(aggregate) = AggregateFunction::from_name(id) {
            return Err(FormulaError::Validation(format!(
                "aggregate function '{}' cannot be used as a variable",
                aggregate.name()
            )));
        }
        if self.context.has_variable(id)
            || self.context.has_constant(id)
            || MathFunction::from_name(id).is_some()
            || SpatialOperator::from_name(id).is_some()
        {
            return Ok(());
        }
        Err(FormulaError::Validation(format!(
            "unknown identifier: {id}"
        )))
    }

    fn check_call(&self, function: &str, args: &[Expr]) -> Result<(), FormulaError> {
        if let Some(aggregate) = AggregateFunction::from_name(function) {
            if args.len() != 1 {
                return Err(FormulaError::Arity {
                    function: aggregate.name().to_owned(),
                    expected: 1,
                    found: args.len(),
                });
            }
            return self.check(&args[0]);
        }
        if MathFunction::from_name(function).is_some()
            || SpatialOperator::from_name(function).is_some()
        {
            for arg in args {
                self.check(arg)?;
            }
            return Ok(());
        }
        Err(FormulaError::Validation(format!(
            "unknown function: {function}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::Validator;
    use crate::FormulaError;
    use crate::context::EvaluationContext;

    fn validator() -> Validator {
        let context = EvaluationContext::from_variables(
            ["x", "y", "p", "u", "v"].map(str::to_owned),
        );
        Validator::new(context)
    }

    #[test]
    fn well_formed_formulas_validate() {
        let v = validator();
        for formula in [
            "",
            "   ",
            "p",
            "sin(x) + cos(y) * 2",
            "mean(p) + std(p - mean(p))",
            "grad_x(p * pi)",
            "curl(u, v) + laplacian(p)",
            "min(u, v) ** 2",
            "2 * pi * p_global_mean",
        ] {
            let outcome = if formula.contains("p_global_mean") {
                Validator::new(
                    v.context().with_constant("p_global_mean", 1.0),
                )
                .validate(formula)
            } else {
                v.validate(formula)
            };
            assert!(outcome.is_ok(), "{formula}: {outcome:?}");
        }
    }

    #[test]
    fn unregistered_identifiers_are_rejected() {
        let err = validator().validate("pressure + 1").expect_err("must fail");
        assert!(matches!(err, FormulaError::Validation(_)));
    }

    #[test]
    fn bare_aggregate_names_are_rejected() {
        let err = validator().validate("mean + 1").expect_err("must fail");
        assert!(
            matches!(err, FormulaError::Validation(ref msg) if msg.contains("mean")),
            "{err:?}"
        );
    }

    #[test]
    fn aggregate_arity_is_enforced() {
        let err = validator().validate("mean(p, u)").expect_err("must fail");
        assert_eq!(
            err,
            FormulaError::Arity {
                function: "mean".to_owned(),
                expected: 1,
                found: 2,
            }
        );
    }

    #[test]
    fn unknown_functions_are_rejected() {
        let err = validator().validate("smooth(p)").expect_err("must fail");
        assert!(matches!(err, FormulaError::Validation(ref msg) if msg.contains("smooth")));
    }

    #[test]
    fn disallowed_syntax_is_rejected_as_syntax_error() {
        for formula in ["p = 1", "p.mean", "p[0]", "\"label\""] {
            let err = validator().validate(formula).expect_err("must fail");
            assert!(matches!(err, FormulaError::Syntax(_)), "{formula}");
        }
    }

    #[test]
    fn used_variables_returns_registered_columns_only() {
        let used = validator()
            .used_variables("sin(x) * p + pi + mean(u)")
            .expect("used");
        let names: Vec<&str> = used.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["p", "u", "x"]);
    }
}
