//! The driver that owns one search method together with its RNG and search
//! space, checks incoming events and supports snapshot/restore of the whole
//! search.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use sl_types::{
    Checkpoint, CheckpointMetrics, ExitedReason, Operation, RequestId, SearchSpace,
    SearcherConfig, SearcherError, Shutdown, SlResult, SnapshotError, Train, Unit, Validate,
    ValidationMetrics,
};
use tracing::{debug, info, warn};

use crate::context::{Context, RngState, SearchRng};
use crate::method::{new_search_method, Objective, SearchMethod, SearchMethodType};
use crate::sample::check_grid_divisions;
use crate::snapshot::MethodSnapshot;

const SNAPSHOT_VERSION: u32 = 1;

/// Best validation seen so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestValidation {
    pub request_id: RequestId,
    /// Raw metric as reported.
    pub metric: f64,
    /// Metric on the smaller-is-better scale.
    pub score: f64,
}

/// Bookkeeping the driver keeps independently of the search method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearcherState {
    pub trials_requested: BTreeSet<RequestId>,
    pub trials_created: BTreeSet<RequestId>,
    pub trials_closed: BTreeSet<RequestId>,
    pub trials_exited: BTreeSet<RequestId>,
    /// Units trained per trial.
    pub trial_progress: BTreeMap<RequestId, f64>,
    pub total_units_completed: f64,
    pub best: Option<BestValidation>,
    pub shutdown: Option<Shutdown>,
    pub initialized: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SearcherSnapshot {
    version: u32,
    method: SearchMethodType,
    rng: RngState,
    state: SearcherState,
    method_state: Option<MethodSnapshot>,
}

/// Drives one search method.
///
/// Every event is checked against the trials the method actually requested,
/// and nothing is accepted once the search has shut down.
#[derive(Debug)]
pub struct Searcher {
    objective: Objective,
    space: SearchSpace,
    rng: SearchRng,
    method: Box<dyn SearchMethod>,
    state: SearcherState,
}

impl Searcher {
    pub fn new(config: &SearcherConfig, space: SearchSpace) -> SlResult<Self> {
        config.validate()?;
        space.validate()?;
        if let Some(grid) = &config.grid {
            check_grid_divisions(&space, &grid.divisions)?;
        }
        let method = new_search_method(config)?;
        Ok(Self {
            objective: Objective::new(config.metric.clone(), config.direction),
            space,
            rng: SearchRng::seed_from_u64(config.seed),
            method,
            state: SearcherState::default(),
        })
    }

    /// Rebuild a searcher from `config` and `space` and resume it from a
    /// snapshot taken with [`Searcher::snapshot`].
    pub fn restore(
        config: &SearcherConfig,
        space: SearchSpace,
        snapshot: &serde_json::Value,
    ) -> SlResult<Self> {
        let snapshot: SearcherSnapshot = serde_json::from_value(snapshot.clone())?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                method: "searcher".to_string(),
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            }
            .into());
        }
        let mut searcher = Self::new(config, space)?;
        if snapshot.method != searcher.method.method_type() {
            return Err(SnapshotError::MethodMismatch {
                expected: searcher.method.method_type().to_string(),
                found: snapshot.method.to_string(),
            }
            .into());
        }
        searcher.method.restore(snapshot.method_state.as_ref())?;
        searcher.rng = SearchRng::from_state(&snapshot.rng);
        searcher.state = snapshot.state;
        info!(
            "Restored {} search with {} trials requested",
            searcher.method.method_type(),
            searcher.state.trials_requested.len()
        );
        Ok(searcher)
    }

    pub fn snapshot(&self) -> SlResult<serde_json::Value> {
        let snapshot = SearcherSnapshot {
            version: SNAPSHOT_VERSION,
            method: self.method.method_type(),
            rng: self.rng.state(),
            state: self.state.clone(),
            method_state: self.method.snapshot()?,
        };
        Ok(serde_json::to_value(snapshot)?)
    }

    pub fn method_type(&self) -> SearchMethodType {
        self.method.method_type()
    }

    pub fn unit(&self) -> Unit {
        self.method.unit()
    }

    pub fn state(&self) -> &SearcherState {
        &self.state
    }

    pub fn shutdown(&self) -> Option<Shutdown> {
        self.state.shutdown
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.shutdown.is_some()
    }

    /// Completion fraction in `[0, 1]`; exactly 1 once the search shut down.
    pub fn progress(&self) -> f64 {
        if self.is_shutdown() {
            return 1.0;
        }
        let progress = self.method.progress(self.state.total_units_completed);
        if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        }
    }

    fn check_live(&self) -> SlResult<()> {
        if self.is_shutdown() {
            return Err(SearcherError::AlreadyShutdown.into());
        }
        Ok(())
    }

    fn check_requested(&self, request_id: RequestId) -> SlResult<()> {
        self.check_live()?;
        if !self.state.trials_requested.contains(&request_id) {
            return Err(SearcherError::UnknownRequest { request_id }.into());
        }
        if self.state.trials_closed.contains(&request_id) {
            return Err(SearcherError::AlreadyClosed { request_id }.into());
        }
        Ok(())
    }

    fn record(&mut self, ops: SlResult<Vec<Operation>>) -> SlResult<Vec<Operation>> {
        let ops = ops?;
        for op in &ops {
            match op {
                Operation::Create(create) => {
                    self.state.trials_requested.insert(create.request_id);
                }
                Operation::Shutdown(shutdown) => {
                    if shutdown.failure {
                        warn!("Search {} shutting down after a failure", self.method.method_type());
                    } else {
                        info!(
                            "Search {} complete after {} trials",
                            self.method.method_type(),
                            self.state.trials_requested.len()
                        );
                    }
                    self.state.shutdown = Some(*shutdown);
                }
                _ => {}
            }
        }
        Ok(ops)
    }

    pub fn initial_operations(&mut self) -> SlResult<Vec<Operation>> {
        self.check_live()?;
        if self.state.initialized {
            return Err(SearcherError::AlreadyInitialized.into());
        }
        self.state.initialized = true;
        info!(
            "Starting {} search on metric {}",
            self.method.method_type(),
            self.objective.metric
        );
        let mut ctx = Context::new(&mut self.rng, &self.space);
        let ops = self.method.initial_operations(&mut ctx);
        self.record(ops)
    }

    pub fn trial_created(&mut self, request_id: RequestId) -> SlResult<Vec<Operation>> {
        self.check_requested(request_id)?;
        self.state.trials_created.insert(request_id);
        debug!("Trial {request_id} created");
        let mut ctx = Context::new(&mut self.rng, &self.space);
        let ops = self.method.trial_created(&mut ctx, request_id);
        self.record(ops)
    }

    pub fn train_completed(
        &mut self,
        request_id: RequestId,
        train: &Train,
    ) -> SlResult<Vec<Operation>> {
        self.check_requested(request_id)?;
        let units = train.length.units as f64;
        *self.state.trial_progress.entry(request_id).or_default() += units;
        self.state.total_units_completed += units;
        debug!("Trial {request_id} trained {}", train.length);
        let mut ctx = Context::new(&mut self.rng, &self.space);
        let ops = self.method.train_completed(&mut ctx, request_id, train);
        self.record(ops)
    }

    pub fn checkpoint_completed(
        &mut self,
        request_id: RequestId,
        checkpoint: &Checkpoint,
        metrics: &CheckpointMetrics,
    ) -> SlResult<Vec<Operation>> {
        self.check_requested(request_id)?;
        debug!("Trial {request_id} checkpointed");
        let mut ctx = Context::new(&mut self.rng, &self.space);
        let ops = self
            .method
            .checkpoint_completed(&mut ctx, request_id, checkpoint, metrics);
        self.record(ops)
    }

    pub fn validation_completed(
        &mut self,
        request_id: RequestId,
        validate: &Validate,
        metrics: &ValidationMetrics,
    ) -> SlResult<Vec<Operation>> {
        self.check_requested(request_id)?;
        let metric = metrics.metric(&self.objective.metric)?;
        let score = self.objective.direction.normalize(metric);
        debug!("Trial {request_id} validated with {} = {metric}", self.objective.metric);

        let mut ctx = Context::new(&mut self.rng, &self.space);
        let ops = self
            .method
            .validation_completed(&mut ctx, request_id, validate, metrics);
        let ops = self.record(ops)?;
        if self.state.best.as_ref().map_or(true, |best| score < best.score) {
            self.state.best = Some(BestValidation {
                request_id,
                metric,
                score,
            });
        }
        Ok(ops)
    }

    pub fn trial_closed(&mut self, request_id: RequestId) -> SlResult<Vec<Operation>> {
        self.check_requested(request_id)?;
        self.state.trials_closed.insert(request_id);
        debug!("Trial {request_id} closed");
        let mut ctx = Context::new(&mut self.rng, &self.space);
        let ops = self.method.trial_closed(&mut ctx, request_id);
        self.record(ops)
    }

    pub fn trial_exited_early(
        &mut self,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> SlResult<Vec<Operation>> {
        self.check_requested(request_id)?;
        self.state.trials_exited.insert(request_id);
        warn!("Trial {request_id} exited early: {reason}");
        let mut ctx = Context::new(&mut self.rng, &self.space);
        let ops = self.method.trial_exited_early(&mut ctx, request_id, reason);
        self.record(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sl_types::{
        ConfigError, GridConfig, Length, RandomConfig, SearcherVariant, SingleConfig, SlError,
    };

    fn random_config(max_trials: usize) -> SearcherConfig {
        SearcherConfig::new("loss")
            .with_seed(42)
            .with_method(SearcherVariant::Random(RandomConfig::new(
                max_trials,
                Length::batches(100),
            )))
    }

    fn space() -> SearchSpace {
        SearchSpace::new()
            .add_float("dropout", 0.0, 0.5)
            .add_log_uniform("lr", 1e-4, 1e-1)
    }

    fn creates(ops: &[Operation]) -> Vec<RequestId> {
        ops.iter()
            .filter_map(|op| match op {
                Operation::Create(create) => Some(create.request_id),
                _ => None,
            })
            .collect()
    }

    fn run_trial(searcher: &mut Searcher, id: RequestId, loss: f64) -> Vec<Operation> {
        searcher.trial_created(id).unwrap();
        searcher
            .train_completed(
                id,
                &Train {
                    request_id: id,
                    length: Length::batches(100),
                },
            )
            .unwrap();
        let metrics = ValidationMetrics::new().with_metric("loss", loss);
        searcher
            .validation_completed(id, &Validate { request_id: id }, &metrics)
            .unwrap();
        searcher.trial_closed(id).unwrap()
    }

    #[test]
    fn random_three_trials_in_any_order() {
        let mut searcher = Searcher::new(&random_config(3), space()).unwrap();
        let ids = creates(&searcher.initial_operations().unwrap());
        assert_eq!(ids.len(), 3);

        assert!(run_trial(&mut searcher, ids[1], 0.3).is_empty());
        assert!(run_trial(&mut searcher, ids[2], 0.1).is_empty());
        let ops = run_trial(&mut searcher, ids[0], 0.2);
        assert_eq!(ops, vec![Operation::shutdown()]);
        assert_eq!(searcher.shutdown(), Some(Shutdown { failure: false }));
        assert_eq!(searcher.progress(), 1.0);
        assert_eq!(searcher.state().best.as_ref().unwrap().request_id, ids[2]);
    }

    #[test]
    fn same_seed_same_operations() {
        let mut a = Searcher::new(&random_config(3), space()).unwrap();
        let mut b = Searcher::new(&random_config(3), space()).unwrap();
        assert_eq!(a.initial_operations().unwrap(), b.initial_operations().unwrap());
    }

    #[test]
    fn rejects_unknown_and_late_events() {
        let mut searcher = Searcher::new(&random_config(1), space()).unwrap();
        let ids = creates(&searcher.initial_operations().unwrap());
        assert!(matches!(
            searcher.initial_operations(),
            Err(SlError::Searcher(SearcherError::AlreadyInitialized))
        ));

        let stranger = RequestId::generate(&mut SearchRng::seed_from_u64(77));
        assert!(matches!(
            searcher.trial_created(stranger),
            Err(SlError::Searcher(SearcherError::UnknownRequest { .. }))
        ));

        assert_eq!(run_trial(&mut searcher, ids[0], 0.5), vec![Operation::shutdown()]);
        assert!(matches!(
            searcher.trial_closed(ids[0]),
            Err(SlError::Searcher(SearcherError::AlreadyShutdown))
        ));
    }

    #[test]
    fn grid_divisions_are_checked_at_construction() {
        let grid_config = |config: GridConfig| {
            SearcherConfig::new("loss").with_method(SearcherVariant::Grid(config))
        };
        let partial = GridConfig::new(Length::batches(10)).with_divisions("dropout", 3);
        assert!(matches!(
            Searcher::new(&grid_config(partial), space()),
            Err(SlError::Config(ConfigError::MissingGridDivisions { name })) if name == "lr"
        ));

        let full = GridConfig::new(Length::batches(10))
            .with_divisions("dropout", 3)
            .with_divisions("lr", 2);
        let mut searcher = Searcher::new(&grid_config(full), space()).unwrap();
        assert_eq!(creates(&searcher.initial_operations().unwrap()).len(), 6);
    }

    #[test]
    fn missing_metric_is_an_error() {
        let mut searcher = Searcher::new(&random_config(1), space()).unwrap();
        let ids = creates(&searcher.initial_operations().unwrap());
        let metrics = ValidationMetrics::new().with_metric("accuracy", 0.5);
        assert!(matches!(
            searcher.validation_completed(ids[0], &Validate { request_id: ids[0] }, &metrics),
            Err(SlError::Searcher(SearcherError::MetricNotFound { .. }))
        ));
    }

    #[test]
    fn snapshot_resume_matches_uninterrupted_run() {
        let mut original = Searcher::new(&random_config(4), space()).unwrap();
        let ids = creates(&original.initial_operations().unwrap());
        run_trial(&mut original, ids[0], 0.4);

        let snapshot = original.snapshot().unwrap();
        let mut resumed = Searcher::restore(&random_config(4), space(), &snapshot).unwrap();
        assert_eq!(resumed.state(), original.state());

        for (id, loss) in ids.iter().skip(1).zip([0.3, 0.2, 0.1]) {
            assert_eq!(run_trial(&mut original, *id, loss), run_trial(&mut resumed, *id, loss));
        }
        assert!(resumed.is_shutdown());
    }

    #[test]
    fn restore_refuses_other_methods_and_versions() {
        let mut searcher = Searcher::new(&random_config(2), space()).unwrap();
        searcher.initial_operations().unwrap();
        let mut snapshot = searcher.snapshot().unwrap();

        let single = SearcherConfig::new("loss").with_method(SearcherVariant::Single(
            SingleConfig::new(Length::batches(10)),
        ));
        assert!(matches!(
            Searcher::restore(&single, space(), &snapshot),
            Err(SlError::Snapshot(SnapshotError::MethodMismatch { .. }))
        ));

        snapshot["version"] = serde_json::json!(99);
        assert!(matches!(
            Searcher::restore(&random_config(2), space(), &snapshot),
            Err(SlError::Snapshot(SnapshotError::UnsupportedVersion { found: 99, .. }))
        ));
    }

    #[test]
    fn failure_shutdown_is_recorded() {
        let config = SearcherConfig::new("loss").with_method(SearcherVariant::Single(
            SingleConfig::new(Length::batches(10)),
        ));
        let mut searcher = Searcher::new(&config, space()).unwrap();
        let ids = creates(&searcher.initial_operations().unwrap());
        let ops = searcher
            .trial_exited_early(ids[0], ExitedReason::Errored)
            .unwrap();
        assert_eq!(ops, vec![Operation::shutdown_failure()]);
        assert_eq!(searcher.shutdown(), Some(Shutdown { failure: true }));
    }
}
