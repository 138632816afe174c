use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Scalar constants visible to every formula: fixed science constants,
/// autogenerated `{var}_global_*` statistics, and user-defined custom
/// constants. Persisted externally; rebuilt here at dataset-load time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstantNamespace {
    entries: BTreeMap<String, f64>,
}

impl ConstantNamespace {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Process-wide fixed science constants (SI values).
    #[must_use]
    pub fn science() -> Self {
        let mut namespace = Self::empty();
        namespace.insert("pi", std::f64::consts::PI);
        namespace.insert("e", std::f64::consts::E);
        namespace.insert("g", 9.806_65);
        namespace.insert("c", 299_792_458.0);
        namespace.insert("h", 6.626_070_15e-34);
        namespace.insert("k_B", 1.380_649e-23);
        namespace.insert("N_A", 6.022_140_76e23);
        namespace.insert("R", 8.314_462_618);
        namespace
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.entries.insert(name.into(), value);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = (String, f64)>) {
        self.entries.extend(entries);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries.get(name).copied()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), *value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Immutable snapshot of everything a formula may reference: the dataset's
/// registered column names and the constant namespace. Schema or statistics
/// changes rebuild the context; nothing mutates a shared one. Workers
/// receive their own clone at dispatch time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    variables: BTreeSet<String>,
    constants: ConstantNamespace,
}

impl EvaluationContext {
    #[must_use]
    pub fn new(
        variables: impl IntoIterator<Item = String>,
        constants: ConstantNamespace,
    ) -> Self {
        Self {
            variables: variables.into_iter().collect(),
            constants,
        }
    }

    /// Context over a schema with the science constants preloaded.
    #[must_use]
    pub fn from_variables(variables: impl IntoIterator<Item = String>) -> Self {
        Self::new(variables, ConstantNamespace::science())
    }

    #[must_use]
    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains(name)
    }

    #[must_use]
    pub fn variables(&self) -> &BTreeSet<String> {
        &self.variables
    }

    #[must_use]
    pub fn constant(&self, name: &str) -> Option<f64> {
        self.constants.get(name)
    }

    #[must_use]
    pub fn has_constant(&self, name: &str) -> bool {
        self.constants.contains(name)
    }

    #[must_use]
    pub fn constants(&self) -> &ConstantNamespace {
        &self.constants
    }

    /// New context with one more constant bound; used to thread a custom
    /// constant batch where later definitions see earlier ones.
    #[must_use]
    pub fn with_constant(&self, name: impl Into<String>, value: f64) -> Self {
        let mut next = self.clone();
        next.constants.insert(name, value);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::{ConstantNamespace, EvaluationContext};

    #[test]
    fn science_constants_are_present() {
        let constants = ConstantNamespace::science();
        assert_eq!(constants.get("pi"), Some(std::f64::consts::PI));
        assert_eq!(constants.get("c"), Some(299_792_458.0));
        assert!(constants.contains("k_B"));
        assert!(!constants.contains("tau"));
    }

    #[test]
    fn with_constant_leaves_the_original_untouched() {
        let base = EvaluationContext::from_variables(["p".to_owned()]);
        let extended = base.with_constant("p_half", 0.5);

        assert!(extended.has_constant("p_half"));
        assert!(!base.has_constant("p_half"));
        assert!(extended.has_variable("p"));
    }

    #[test]
    fn namespace_round_trips_through_serde() {
        let mut constants = ConstantNamespace::empty();
        constants.insert("p_global_mean", 3.25);
        let json = serde_json::to_string(&constants).expect("serialize");
        let back: ConstantNamespace = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, constants);
    }
}
