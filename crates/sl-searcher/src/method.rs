//! The search method contract and the factory that builds one method from a
//! searcher configuration.

use serde::{Deserialize, Serialize};
use sl_types::{
    Checkpoint, CheckpointMetrics, ExitedReason, ObjectiveDirection, Operation, RequestId,
    SearcherConfig, SearcherVariant, SlResult, SnapshotError, Train, Unit, Validate,
    ValidationMetrics,
};
use tracing::info;

use crate::adaptive::{new_adaptive_asha_search, new_adaptive_search, new_adaptive_simple_search};
use crate::async_halving::AsyncHalvingSearch;
use crate::context::Context;
use crate::grid::GridSearch;
use crate::pbt::PbtSearch;
use crate::random::RandomSearch;
use crate::single::SingleSearch;
use crate::snapshot::MethodSnapshot;
use crate::sync_halving::SyncHalvingSearch;

/// Explicit discriminant for every search method implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethodType {
    Single,
    Random,
    Grid,
    SyncHalving,
    AsyncHalving,
    Adaptive,
    AdaptiveSimple,
    AdaptiveAsha,
    Pbt,
}

impl std::fmt::Display for SearchMethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Single => "single",
            Self::Random => "random",
            Self::Grid => "grid",
            Self::SyncHalving => "sync_halving",
            Self::AsyncHalving => "async_halving",
            Self::Adaptive => "adaptive",
            Self::AdaptiveSimple => "adaptive_simple",
            Self::AdaptiveAsha => "adaptive_asha",
            Self::Pbt => "pbt",
        };
        f.write_str(name)
    }
}

/// The validation metric a method ranks trials by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub metric: String,
    pub direction: ObjectiveDirection,
}

impl Objective {
    pub fn new(metric: impl Into<String>, direction: ObjectiveDirection) -> Self {
        Self {
            metric: metric.into(),
            direction,
        }
    }

    /// The searcher metric on a smaller-is-better scale.
    pub fn score(&self, metrics: &ValidationMetrics) -> SlResult<f64> {
        Ok(self.direction.normalize(metrics.metric(&self.metric)?))
    }
}

/// A hyperparameter search algorithm.
///
/// The executor calls these hooks strictly sequentially; each returns the
/// operations the method wants carried out next. Default hooks do nothing,
/// except [`trial_exited_early`](SearchMethod::trial_exited_early) which shuts
/// the search down as failed. Methods that can absorb a lost trial override
/// it.
pub trait SearchMethod: std::fmt::Debug + Send {
    fn method_type(&self) -> SearchMethodType;

    /// The unit training lengths are expressed in.
    fn unit(&self) -> Unit;

    /// Called exactly once when the search starts.
    fn initial_operations(&mut self, ctx: &mut Context<'_>) -> SlResult<Vec<Operation>>;

    fn trial_created(
        &mut self,
        _ctx: &mut Context<'_>,
        _request_id: RequestId,
    ) -> SlResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn train_completed(
        &mut self,
        _ctx: &mut Context<'_>,
        _request_id: RequestId,
        _train: &Train,
    ) -> SlResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn checkpoint_completed(
        &mut self,
        _ctx: &mut Context<'_>,
        _request_id: RequestId,
        _checkpoint: &Checkpoint,
        _metrics: &CheckpointMetrics,
    ) -> SlResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn validation_completed(
        &mut self,
        _ctx: &mut Context<'_>,
        _request_id: RequestId,
        _validate: &Validate,
        _metrics: &ValidationMetrics,
    ) -> SlResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn trial_closed(
        &mut self,
        _ctx: &mut Context<'_>,
        _request_id: RequestId,
    ) -> SlResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn trial_exited_early(
        &mut self,
        _ctx: &mut Context<'_>,
        _request_id: RequestId,
        _reason: ExitedReason,
    ) -> SlResult<Vec<Operation>> {
        Ok(vec![Operation::shutdown_failure()])
    }

    /// Training work the whole search is planned to do.
    fn expected_units(&self) -> f64;

    /// Completion fraction in `[0, 1]` for the given amount of finished
    /// training work.
    fn progress(&self, total_units_completed: f64) -> f64 {
        let expected = self.expected_units();
        if expected <= 0.0 {
            return 0.0;
        }
        (total_units_completed / expected).clamp(0.0, 1.0)
    }

    /// Stateless methods produce no snapshot.
    fn snapshot(&self) -> SlResult<Option<MethodSnapshot>> {
        Ok(None)
    }

    fn restore(&mut self, snapshot: Option<&MethodSnapshot>) -> SlResult<()> {
        match snapshot {
            None => Ok(()),
            Some(_) => Err(SnapshotError::UnexpectedState {
                method: self.method_type().to_string(),
            }
            .into()),
        }
    }
}

/// Build the search method selected by `config`.
///
/// Fails when zero or several methods are configured, or when the selected
/// method's settings are invalid.
pub fn new_search_method(config: &SearcherConfig) -> SlResult<Box<dyn SearchMethod>> {
    let variant = config.variant()?;
    let objective = Objective::new(config.metric.clone(), config.direction);
    info!("Building {} search method for metric {}", variant.name(), objective.metric);

    let method: Box<dyn SearchMethod> = match variant {
        SearcherVariant::Single(c) => Box::new(SingleSearch::new(c)),
        SearcherVariant::Random(c) => Box::new(RandomSearch::new(c)),
        SearcherVariant::Grid(c) => Box::new(GridSearch::new(c)),
        SearcherVariant::SyncHalving(c) => Box::new(SyncHalvingSearch::new(c, objective)),
        SearcherVariant::AsyncHalving(c) => Box::new(AsyncHalvingSearch::new(c, objective)),
        SearcherVariant::Adaptive(c) => Box::new(new_adaptive_search(&c, objective)),
        SearcherVariant::AdaptiveSimple(c) => Box::new(new_adaptive_simple_search(&c, objective)),
        SearcherVariant::AdaptiveAsha(c) => Box::new(new_adaptive_asha_search(&c, objective)),
        SearcherVariant::Pbt(c) => Box::new(PbtSearch::new(c, objective)),
    };
    Ok(method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sl_types::{
        AdaptiveAshaConfig, AdaptiveMode, ConfigError, GridConfig, Length, PbtConfig,
        RandomConfig, SingleConfig, SlError,
    };

    #[test]
    fn factory_matches_variant() {
        let cases = vec![
            (
                SearcherVariant::Single(SingleConfig::new(Length::batches(10))),
                SearchMethodType::Single,
            ),
            (
                SearcherVariant::Random(RandomConfig::new(4, Length::batches(10))),
                SearchMethodType::Random,
            ),
            (
                SearcherVariant::Grid(GridConfig::new(Length::batches(10))),
                SearchMethodType::Grid,
            ),
            (
                SearcherVariant::AdaptiveAsha(AdaptiveAshaConfig {
                    mode: AdaptiveMode::Standard,
                    divisor: 3.0,
                    max_rungs: 3,
                    max_length: Length::batches(90),
                    max_trials: 20,
                    max_concurrent_trials: 0,
                    bracket_rungs: Vec::new(),
                }),
                SearchMethodType::AdaptiveAsha,
            ),
            (
                SearcherVariant::Pbt(PbtConfig {
                    population_size: 4,
                    num_rounds: 2,
                    length_per_round: Length::batches(10),
                    perturb_interval: 1,
                    truncate_fraction: 0.25,
                    resample_probability: 0.1,
                    perturb_factor: 0.2,
                }),
                SearchMethodType::Pbt,
            ),
        ];

        for (variant, expected) in cases {
            let config = SearcherConfig::new("loss").with_method(variant);
            let method = new_search_method(&config).unwrap();
            assert_eq!(method.method_type(), expected);
            assert_eq!(method.unit(), Unit::Batches);
        }
    }

    #[test]
    fn factory_rejects_missing_variant() {
        let config = SearcherConfig::new("loss");
        assert!(matches!(
            new_search_method(&config),
            Err(SlError::Config(ConfigError::NoSearcherVariant))
        ));
    }

    #[test]
    fn objective_normalizes_metric() {
        let objective = Objective::new("accuracy", ObjectiveDirection::Maximize);
        let metrics = ValidationMetrics::new().with_metric("accuracy", 0.9);
        assert_eq!(objective.score(&metrics).unwrap(), -0.9);
    }

    #[test]
    fn default_restore_refuses_a_blob() {
        let mut method = SingleSearch::new(SingleConfig::new(Length::batches(10)));
        assert!(method.restore(None).is_ok());
        let blob = MethodSnapshot::encode(SearchMethodType::Single, 1, &0u32).unwrap();
        assert!(matches!(
            method.restore(Some(&blob)),
            Err(SlError::Snapshot(SnapshotError::UnexpectedState { .. }))
        ));
    }
}
