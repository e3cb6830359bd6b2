//! Searcher configuration: shared settings plus exactly one search method.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{ConfigError, SlResult};
use crate::space::Hyperparameters;
use crate::workload::{Length, Unit};

/// Whether the searcher metric should be maximized or minimized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Minimize
    }
}

impl ObjectiveDirection {
    pub fn from_smaller_is_better(smaller_is_better: bool) -> Self {
        if smaller_is_better {
            Self::Minimize
        } else {
            Self::Maximize
        }
    }

    /// Map a raw metric onto a scale where smaller is always better.
    pub fn normalize(&self, metric: f64) -> f64 {
        match self {
            Self::Minimize => metric,
            Self::Maximize => -metric,
        }
    }
}

fn default_divisor() -> f64 {
    4.0
}

fn default_perturb_interval() -> usize {
    1
}

fn invalid(field: &str, message: impl Into<String>) -> crate::SlError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
    .into()
}

fn check_length(field: &str, length: &Length) -> SlResult<()> {
    if length.units == 0 {
        return Err(invalid(field, "must be at least one unit"));
    }
    Ok(())
}

fn check_divisor(divisor: f64) -> SlResult<()> {
    if !divisor.is_finite() || divisor <= 1.0 {
        return Err(invalid("divisor", format!("must be greater than 1, got {divisor}")));
    }
    Ok(())
}

fn check_positive(field: &str, value: usize) -> SlResult<()> {
    if value == 0 {
        return Err(invalid(field, "must be at least 1"));
    }
    Ok(())
}

fn check_fraction(field: &str, value: f64, max: f64) -> SlResult<()> {
    if !(0.0..=max).contains(&value) {
        return Err(invalid(field, format!("must be within [0, {max}], got {value}")));
    }
    Ok(())
}

/// Train one trial with fixed (or sampled) hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleConfig {
    pub max_length: Length,
    /// Fixed hyperparameters; sampled from the search space when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyperparameters: Option<Hyperparameters>,
}

impl SingleConfig {
    pub fn new(max_length: Length) -> Self {
        Self {
            max_length,
            hyperparameters: None,
        }
    }

    pub fn with_hyperparameters(mut self, hparams: Hyperparameters) -> Self {
        self.hyperparameters = Some(hparams);
        self
    }

    pub fn validate(&self) -> SlResult<()> {
        check_length("max_length", &self.max_length)
    }
}

/// Independent random draws from the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomConfig {
    pub max_trials: usize,
    pub max_length: Length,
    /// Zero means every trial is created up front.
    #[serde(default)]
    pub max_concurrent_trials: usize,
}

impl RandomConfig {
    pub fn new(max_trials: usize, max_length: Length) -> Self {
        Self {
            max_trials,
            max_length,
            max_concurrent_trials: 0,
        }
    }

    pub fn with_max_concurrent_trials(mut self, n: usize) -> Self {
        self.max_concurrent_trials = n;
        self
    }

    pub fn validate(&self) -> SlResult<()> {
        check_positive("max_trials", self.max_trials)?;
        check_length("max_length", &self.max_length)
    }
}

/// Exhaustive search over the discretized search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub max_length: Length,
    /// Number of grid points per numeric hyperparameter.
    #[serde(default)]
    pub divisions: BTreeMap<String, usize>,
    /// Zero means every grid point is created up front.
    #[serde(default)]
    pub max_concurrent_trials: usize,
}

impl GridConfig {
    pub fn new(max_length: Length) -> Self {
        Self {
            max_length,
            divisions: BTreeMap::new(),
            max_concurrent_trials: 0,
        }
    }

    pub fn with_divisions(mut self, name: impl Into<String>, divisions: usize) -> Self {
        self.divisions.insert(name.into(), divisions);
        self
    }

    pub fn with_max_concurrent_trials(mut self, n: usize) -> Self {
        self.max_concurrent_trials = n;
        self
    }

    pub fn validate(&self) -> SlResult<()> {
        check_length("max_length", &self.max_length)?;
        for (name, divisions) in &self.divisions {
            check_positive(&format!("divisions.{name}"), *divisions)?;
        }
        Ok(())
    }
}

/// Synchronous successive halving over a single bracket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHalvingConfig {
    pub num_rungs: usize,
    #[serde(default = "default_divisor")]
    pub divisor: f64,
    pub max_length: Length,
    /// Total training budget; determines the rung-0 population.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<Length>,
    /// Explicit rung-0 population; takes the place of `budget`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_trials: Option<usize>,
}

impl SyncHalvingConfig {
    pub fn with_budget(num_rungs: usize, divisor: f64, max_length: Length, budget: Length) -> Self {
        Self {
            num_rungs,
            divisor,
            max_length,
            budget: Some(budget),
            num_trials: None,
        }
    }

    pub fn with_num_trials(
        num_rungs: usize,
        divisor: f64,
        max_length: Length,
        num_trials: usize,
    ) -> Self {
        Self {
            num_rungs,
            divisor,
            max_length,
            budget: None,
            num_trials: Some(num_trials),
        }
    }

    pub fn validate(&self) -> SlResult<()> {
        check_positive("num_rungs", self.num_rungs)?;
        check_divisor(self.divisor)?;
        check_length("max_length", &self.max_length)?;
        match (&self.budget, self.num_trials) {
            (Some(budget), None) => {
                check_length("budget", budget)?;
                if budget.unit != self.max_length.unit {
                    return Err(invalid("budget", "unit must match max_length"));
                }
                Ok(())
            }
            (None, Some(num_trials)) => check_positive("num_trials", num_trials),
            _ => Err(invalid(
                "budget",
                "exactly one of budget and num_trials must be set",
            )),
        }
    }
}

/// Asynchronous successive halving (ASHA).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncHalvingConfig {
    pub num_rungs: usize,
    #[serde(default = "default_divisor")]
    pub divisor: f64,
    pub max_length: Length,
    pub max_trials: usize,
    /// Zero means `max_trials`.
    #[serde(default)]
    pub max_concurrent_trials: usize,
}

impl AsyncHalvingConfig {
    pub fn new(num_rungs: usize, divisor: f64, max_length: Length, max_trials: usize) -> Self {
        Self {
            num_rungs,
            divisor,
            max_length,
            max_trials,
            max_concurrent_trials: 0,
        }
    }

    pub fn with_max_concurrent_trials(mut self, n: usize) -> Self {
        self.max_concurrent_trials = n;
        self
    }

    pub fn validate(&self) -> SlResult<()> {
        check_positive("num_rungs", self.num_rungs)?;
        check_divisor(self.divisor)?;
        check_length("max_length", &self.max_length)?;
        check_positive("max_trials", self.max_trials)
    }
}

/// How an adaptive searcher trades bracket count against bracket depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveMode {
    /// One bracket with the deepest rung ladder.
    Aggressive,
    /// Roughly half of the possible bracket depths, deepest first.
    Standard,
    /// Every bracket depth from the deepest down to a single rung.
    Conservative,
}

impl Default for AdaptiveMode {
    fn default() -> Self {
        Self::Standard
    }
}

impl AdaptiveMode {
    /// Rung counts for each bracket, deepest first.
    pub fn bracket_rungs(&self, max_rungs: usize) -> Vec<usize> {
        let max_rungs = max_rungs.max(1);
        let count = match self {
            Self::Aggressive => 1,
            Self::Standard => (max_rungs + 2) / 2,
            Self::Conservative => max_rungs,
        };
        (0..count).map(|i| max_rungs - i).collect()
    }
}

/// Hyperband over synchronous halving brackets sharing a total budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    #[serde(default)]
    pub mode: AdaptiveMode,
    #[serde(default = "default_divisor")]
    pub divisor: f64,
    pub max_rungs: usize,
    pub max_length: Length,
    pub budget: Length,
}

impl AdaptiveConfig {
    pub fn validate(&self) -> SlResult<()> {
        check_positive("max_rungs", self.max_rungs)?;
        check_divisor(self.divisor)?;
        check_length("max_length", &self.max_length)?;
        check_length("budget", &self.budget)?;
        if self.budget.unit != self.max_length.unit {
            return Err(invalid("budget", "unit must match max_length"));
        }
        Ok(())
    }
}

/// Hyperband over synchronous halving brackets sharing a trial count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveSimpleConfig {
    #[serde(default)]
    pub mode: AdaptiveMode,
    #[serde(default = "default_divisor")]
    pub divisor: f64,
    pub max_rungs: usize,
    pub max_length: Length,
    pub max_trials: usize,
}

impl AdaptiveSimpleConfig {
    pub fn validate(&self) -> SlResult<()> {
        check_positive("max_rungs", self.max_rungs)?;
        check_divisor(self.divisor)?;
        check_length("max_length", &self.max_length)?;
        check_positive("max_trials", self.max_trials)
    }
}

/// Hyperband over asynchronous halving brackets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveAshaConfig {
    #[serde(default)]
    pub mode: AdaptiveMode,
    #[serde(default = "default_divisor")]
    pub divisor: f64,
    pub max_rungs: usize,
    pub max_length: Length,
    pub max_trials: usize,
    /// Zero picks one slot per `divisor` trials in the smallest bracket.
    #[serde(default)]
    pub max_concurrent_trials: usize,
    /// Explicit bracket depths; overrides `mode` when non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bracket_rungs: Vec<usize>,
}

impl AdaptiveAshaConfig {
    pub fn validate(&self) -> SlResult<()> {
        check_positive("max_rungs", self.max_rungs)?;
        check_divisor(self.divisor)?;
        check_length("max_length", &self.max_length)?;
        check_positive("max_trials", self.max_trials)?;
        for rungs in &self.bracket_rungs {
            check_positive("bracket_rungs", *rungs)?;
        }
        Ok(())
    }
}

/// Population-based training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PbtConfig {
    pub population_size: usize,
    pub num_rounds: usize,
    /// Training done by every member between checkpoints.
    pub length_per_round: Length,
    /// Run exploit/explore every this many rounds.
    #[serde(default = "default_perturb_interval")]
    pub perturb_interval: usize,
    /// Fraction of the population replaced at each exploit step.
    pub truncate_fraction: f64,
    pub resample_probability: f64,
    pub perturb_factor: f64,
}

impl PbtConfig {
    pub fn validate(&self) -> SlResult<()> {
        check_positive("population_size", self.population_size)?;
        check_positive("num_rounds", self.num_rounds)?;
        check_length("length_per_round", &self.length_per_round)?;
        check_positive("perturb_interval", self.perturb_interval)?;
        check_fraction("truncate_fraction", self.truncate_fraction, 0.5)?;
        check_fraction("resample_probability", self.resample_probability, 1.0)?;
        if !(0.0..1.0).contains(&self.perturb_factor) {
            return Err(invalid(
                "perturb_factor",
                format!("must be within [0, 1), got {}", self.perturb_factor),
            ));
        }
        Ok(())
    }
}

/// The single search method selected by a [`SearcherConfig`].
#[derive(Debug, Clone, PartialEq)]
pub enum SearcherVariant {
    Single(SingleConfig),
    Random(RandomConfig),
    Grid(GridConfig),
    SyncHalving(SyncHalvingConfig),
    AsyncHalving(AsyncHalvingConfig),
    Adaptive(AdaptiveConfig),
    AdaptiveSimple(AdaptiveSimpleConfig),
    AdaptiveAsha(AdaptiveAshaConfig),
    Pbt(PbtConfig),
}

impl SearcherVariant {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Single(_) => "single",
            Self::Random(_) => "random",
            Self::Grid(_) => "grid",
            Self::SyncHalving(_) => "sync_halving",
            Self::AsyncHalving(_) => "async_halving",
            Self::Adaptive(_) => "adaptive",
            Self::AdaptiveSimple(_) => "adaptive_simple",
            Self::AdaptiveAsha(_) => "adaptive_asha",
            Self::Pbt(_) => "pbt",
        }
    }

    pub fn validate(&self) -> SlResult<()> {
        match self {
            Self::Single(c) => c.validate(),
            Self::Random(c) => c.validate(),
            Self::Grid(c) => c.validate(),
            Self::SyncHalving(c) => c.validate(),
            Self::AsyncHalving(c) => c.validate(),
            Self::Adaptive(c) => c.validate(),
            Self::AdaptiveSimple(c) => c.validate(),
            Self::AdaptiveAsha(c) => c.validate(),
            Self::Pbt(c) => c.validate(),
        }
    }

    /// The unit the method measures training work in.
    pub fn unit(&self) -> Unit {
        match self {
            Self::Single(c) => c.max_length.unit,
            Self::Random(c) => c.max_length.unit,
            Self::Grid(c) => c.max_length.unit,
            Self::SyncHalving(c) => c.max_length.unit,
            Self::AsyncHalving(c) => c.max_length.unit,
            Self::Adaptive(c) => c.max_length.unit,
            Self::AdaptiveSimple(c) => c.max_length.unit,
            Self::AdaptiveAsha(c) => c.max_length.unit,
            Self::Pbt(c) => c.length_per_round.unit,
        }
    }
}

/// Top-level searcher configuration.
///
/// Exactly one method field must be populated; [`SearcherConfig::variant`]
/// enforces that before any search method is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearcherConfig {
    /// Validation metric the searcher optimizes.
    pub metric: String,
    #[serde(default)]
    pub direction: ObjectiveDirection,
    /// Seed of the search RNG.
    #[serde(default)]
    pub seed: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single: Option<SingleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random: Option<RandomConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<GridConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_halving: Option<SyncHalvingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_halving: Option<AsyncHalvingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<AdaptiveConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive_simple: Option<AdaptiveSimpleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive_asha: Option<AdaptiveAshaConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pbt: Option<PbtConfig>,
}

impl SearcherConfig {
    /// A config with no method selected yet.
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            direction: ObjectiveDirection::default(),
            seed: 0,
            single: None,
            random: None,
            grid: None,
            sync_halving: None,
            async_halving: None,
            adaptive: None,
            adaptive_simple: None,
            adaptive_asha: None,
            pbt: None,
        }
    }

    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Populate the field for `variant`. Other populated fields are kept, so
    /// calling this twice with different methods yields an invalid config.
    pub fn with_method(mut self, variant: SearcherVariant) -> Self {
        match variant {
            SearcherVariant::Single(c) => self.single = Some(c),
            SearcherVariant::Random(c) => self.random = Some(c),
            SearcherVariant::Grid(c) => self.grid = Some(c),
            SearcherVariant::SyncHalving(c) => self.sync_halving = Some(c),
            SearcherVariant::AsyncHalving(c) => self.async_halving = Some(c),
            SearcherVariant::Adaptive(c) => self.adaptive = Some(c),
            SearcherVariant::AdaptiveSimple(c) => self.adaptive_simple = Some(c),
            SearcherVariant::AdaptiveAsha(c) => self.adaptive_asha = Some(c),
            SearcherVariant::Pbt(c) => self.pbt = Some(c),
        }
        self
    }

    pub fn from_json_str(json: &str) -> SlResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The selected method, after checking that exactly one is populated and
    /// that its settings are valid.
    pub fn variant(&self) -> SlResult<SearcherVariant> {
        let mut variants = Vec::new();
        if let Some(c) = &self.single {
            variants.push(SearcherVariant::Single(c.clone()));
        }
        if let Some(c) = &self.random {
            variants.push(SearcherVariant::Random(c.clone()));
        }
        if let Some(c) = &self.grid {
            variants.push(SearcherVariant::Grid(c.clone()));
        }
        if let Some(c) = &self.sync_halving {
            variants.push(SearcherVariant::SyncHalving(c.clone()));
        }
        if let Some(c) = &self.async_halving {
            variants.push(SearcherVariant::AsyncHalving(c.clone()));
        }
        if let Some(c) = &self.adaptive {
            variants.push(SearcherVariant::Adaptive(c.clone()));
        }
        if let Some(c) = &self.adaptive_simple {
            variants.push(SearcherVariant::AdaptiveSimple(c.clone()));
        }
        if let Some(c) = &self.adaptive_asha {
            variants.push(SearcherVariant::AdaptiveAsha(c.clone()));
        }
        if let Some(c) = &self.pbt {
            variants.push(SearcherVariant::Pbt(c.clone()));
        }

        match variants.len() {
            0 => Err(ConfigError::NoSearcherVariant.into()),
            1 => {
                let variant = variants.remove(0);
                variant.validate()?;
                Ok(variant)
            }
            _ => Err(ConfigError::MultipleSearcherVariants {
                variants: variants.iter().map(|v| v.name().to_string()).collect(),
            }
            .into()),
        }
    }

    pub fn validate(&self) -> SlResult<()> {
        if self.metric.trim().is_empty() {
            return Err(invalid("metric", "must not be empty"));
        }
        self.variant().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SlError;

    fn random_config() -> SearcherConfig {
        SearcherConfig::new("loss")
            .with_seed(42)
            .with_method(SearcherVariant::Random(RandomConfig::new(
                3,
                Length::batches(100),
            )))
    }

    #[test]
    fn exactly_one_variant() {
        let config = random_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.variant().unwrap().name(), "random");
    }

    #[test]
    fn no_variant_is_an_error() {
        let config = SearcherConfig::new("loss");
        assert!(matches!(
            config.variant(),
            Err(SlError::Config(ConfigError::NoSearcherVariant))
        ));
    }

    #[test]
    fn multiple_variants_is_an_error() {
        let config = random_config().with_method(SearcherVariant::Grid(GridConfig::new(
            Length::batches(100),
        )));
        match config.variant() {
            Err(SlError::Config(ConfigError::MultipleSearcherVariants { variants })) => {
                assert_eq!(variants, vec!["random".to_string(), "grid".to_string()]);
            }
            other => panic!("expected MultipleSearcherVariants, got {other:?}"),
        }
    }

    #[test]
    fn sync_halving_needs_budget_or_trials() {
        let mut config = SyncHalvingConfig::with_num_trials(3, 3.0, Length::batches(90), 9);
        assert!(config.validate().is_ok());
        config.budget = Some(Length::batches(1000));
        assert!(config.validate().is_err());
        config.num_trials = None;
        assert!(config.validate().is_ok());
        config.budget = Some(Length::epochs(1000));
        assert!(config.validate().is_err());
    }

    #[test]
    fn divisor_must_exceed_one() {
        let config = AsyncHalvingConfig::new(3, 1.0, Length::batches(90), 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn pbt_bounds() {
        let mut config = PbtConfig {
            population_size: 8,
            num_rounds: 5,
            length_per_round: Length::batches(10),
            perturb_interval: 1,
            truncate_fraction: 0.25,
            resample_probability: 0.2,
            perturb_factor: 0.2,
        };
        assert!(config.validate().is_ok());
        config.truncate_fraction = 0.75;
        assert!(config.validate().is_err());
    }

    #[test]
    fn adaptive_mode_brackets() {
        assert_eq!(AdaptiveMode::Aggressive.bracket_rungs(5), vec![5]);
        assert_eq!(AdaptiveMode::Standard.bracket_rungs(5), vec![5, 4, 3]);
        assert_eq!(AdaptiveMode::Standard.bracket_rungs(4), vec![4, 3, 2]);
        assert_eq!(AdaptiveMode::Conservative.bracket_rungs(3), vec![3, 2, 1]);
        assert_eq!(AdaptiveMode::Standard.bracket_rungs(1), vec![1]);
    }

    #[test]
    fn parse_from_json() {
        let json = r#"{
            "metric": "accuracy",
            "direction": "maximize",
            "seed": 7,
            "async_halving": {
                "num_rungs": 3,
                "max_length": {"unit": "epochs", "units": 9},
                "max_trials": 16
            }
        }"#;
        let config = SearcherConfig::from_json_str(json).unwrap();
        assert_eq!(config.direction, ObjectiveDirection::Maximize);
        match config.variant().unwrap() {
            SearcherVariant::AsyncHalving(c) => {
                assert_eq!(c.divisor, 4.0);
                assert_eq!(c.max_concurrent_trials, 0);
                assert_eq!(c.max_length, Length::epochs(9));
            }
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn normalize_direction() {
        assert_eq!(ObjectiveDirection::Minimize.normalize(0.3), 0.3);
        assert_eq!(ObjectiveDirection::Maximize.normalize(0.3), -0.3);
        assert_eq!(
            ObjectiveDirection::from_smaller_is_better(false),
            ObjectiveDirection::Maximize
        );
    }
}
