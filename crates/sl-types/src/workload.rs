//! Units of training work and the payloads the executor reports back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::errors::{SearcherError, SlResult};

/// The unit training lengths are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Records,
    Batches,
    Epochs,
}

impl Default for Unit {
    fn default() -> Self {
        Self::Batches
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Records => write!(f, "records"),
            Self::Batches => write!(f, "batches"),
            Self::Epochs => write!(f, "epochs"),
        }
    }
}

/// An amount of training work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Length {
    pub unit: Unit,
    pub units: u64,
}

impl Length {
    pub fn new(unit: Unit, units: u64) -> Self {
        Self { unit, units }
    }

    pub fn batches(units: u64) -> Self {
        Self::new(Unit::Batches, units)
    }

    pub fn records(units: u64) -> Self {
        Self::new(Unit::Records, units)
    }

    pub fn epochs(units: u64) -> Self {
        Self::new(Unit::Epochs, units)
    }

    /// Same unit, different amount.
    pub fn with_units(self, units: u64) -> Self {
        Self { units, ..self }
    }
}

impl Default for Length {
    fn default() -> Self {
        Self::batches(0)
    }
}

impl std::fmt::Display for Length {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.units, self.unit)
    }
}

/// Metrics reported with a completed validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub metrics: BTreeMap<String, f64>,
}

impl ValidationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Look up the searcher metric. NaN and infinite values are rejected, as
    /// they would not survive a JSON snapshot.
    pub fn metric(&self, name: &str) -> SlResult<f64> {
        let value = self
            .metrics
            .get(name)
            .copied()
            .ok_or_else(|| SearcherError::MetricNotFound {
                metric: name.to_string(),
            })?;
        if !value.is_finite() {
            return Err(SearcherError::InvalidMetric {
                metric: name.to_string(),
                value,
            }
            .into());
        }
        Ok(value)
    }
}

/// Metadata reported with a completed checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetrics {
    pub uuid: Option<Uuid>,
    /// Stored files and their sizes in bytes.
    pub resources: BTreeMap<String, u64>,
}

/// Why a trial stopped before finishing the operations it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitedReason {
    /// The trial crashed.
    Errored,
    /// The trial reported a metric the searcher could not use.
    InvalidMetric,
    /// The trial rejected its hyperparameters.
    InvalidHyperparameters,
    /// A user stopped the trial.
    UserRequested,
    /// The platform cancelled the trial.
    Cancelled,
}

impl std::fmt::Display for ExitedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Errored => "errored",
            Self::InvalidMetric => "invalid metric",
            Self::InvalidHyperparameters => "invalid hyperparameters",
            Self::UserRequested => "user requested",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
