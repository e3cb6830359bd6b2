//! Hyperparameter search space definitions and concrete values.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::errors::{SlResult, SpaceError};

/// A single hyperparameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Hyperparameter name (e.g. "learning_rate").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a hyperparameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
    /// A fixed value that is never searched.
    Const { value: serde_json::Value },
}

impl ParameterKind {
    /// Whether search methods may change this dimension.
    pub fn is_searchable(&self) -> bool {
        !matches!(self, ParameterKind::Const { .. })
    }
}

/// A concrete hyperparameter value produced by a search method.
///
/// Values are tagged so that integers, floats and JSON scalars survive a
/// snapshot round trip without changing representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    Float(f64),
    Int(i64),
    Json(serde_json::Value),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// One concrete point in the search space, keyed by hyperparameter name.
pub type Hyperparameters = BTreeMap<String, ParameterValue>;

/// The full search space: an ordered list of hyperparameter definitions.
///
/// Declaration order matters: sampling consumes randomness in this order and
/// grid enumeration varies the last dimension fastest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    pub fn add_const(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Const { value },
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|param| param.name == name)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Check ranges, choices and name uniqueness.
    pub fn validate(&self) -> SlResult<()> {
        let mut seen = BTreeSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(SpaceError::DuplicateName {
                    name: param.name.clone(),
                }
                .into());
            }
            match &param.kind {
                ParameterKind::FloatRange { low, high } if !(low <= high) => {
                    return Err(SpaceError::InvalidRange {
                        name: param.name.clone(),
                        low: *low,
                        high: *high,
                    }
                    .into());
                }
                ParameterKind::IntRange { low, high } if low > high => {
                    return Err(SpaceError::InvalidRange {
                        name: param.name.clone(),
                        low: *low as f64,
                        high: *high as f64,
                    }
                    .into());
                }
                ParameterKind::LogUniform { low, high } => {
                    if !(*low > 0.0 && *high > 0.0) {
                        return Err(SpaceError::InvalidLogRange {
                            name: param.name.clone(),
                        }
                        .into());
                    }
                    if low > high {
                        return Err(SpaceError::InvalidRange {
                            name: param.name.clone(),
                            low: *low,
                            high: *high,
                        }
                        .into());
                    }
                }
                ParameterKind::Choice { values } if values.is_empty() => {
                    return Err(SpaceError::EmptyChoices {
                        name: param.name.clone(),
                    }
                    .into());
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SlError;

    #[test]
    fn search_space_builder_chain() {
        let space = SearchSpace::new()
            .add_int("a", 1, 10)
            .add_float("b", 0.0, 1.0)
            .add_log_uniform("c", 0.001, 100.0)
            .add_choice("d", vec![serde_json::json!(true), serde_json::json!(false)])
            .add_const("e", serde_json::json!("adam"));
        assert_eq!(space.len(), 5);
        assert!(space.validate().is_ok());
        assert!(!space.get("e").unwrap().kind.is_searchable());
    }

    #[test]
    fn validate_rejects_bad_ranges() {
        let space = SearchSpace::new().add_float("x", 1.0, 0.0);
        assert!(matches!(
            space.validate(),
            Err(SlError::Space(SpaceError::InvalidRange { .. }))
        ));

        let space = SearchSpace::new().add_log_uniform("lr", 0.0, 1.0);
        assert!(matches!(
            space.validate(),
            Err(SlError::Space(SpaceError::InvalidLogRange { .. }))
        ));

        let space = SearchSpace::new().add_choice("opt", vec![]);
        assert!(matches!(
            space.validate(),
            Err(SlError::Space(SpaceError::EmptyChoices { .. }))
        ));
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let space = SearchSpace::new().add_int("x", 0, 1).add_float("x", 0.0, 1.0);
        assert!(matches!(
            space.validate(),
            Err(SlError::Space(SpaceError::DuplicateName { .. }))
        ));
    }

    #[test]
    fn parameter_values_keep_their_kind_through_json() {
        let mut hparams = Hyperparameters::new();
        hparams.insert("layers".into(), ParameterValue::Int(4));
        hparams.insert("dropout".into(), ParameterValue::Float(5.0));
        hparams.insert("units".into(), ParameterValue::Json(serde_json::json!(64)));

        let json = serde_json::to_string(&hparams).unwrap();
        let back: Hyperparameters = serde_json::from_str(&json).unwrap();
        assert_eq!(hparams, back);
    }
}
