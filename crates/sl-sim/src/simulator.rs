// Deterministic trial executor
// Carries out searcher operations one at a time, in a seeded random order across trials

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};
use uuid::Uuid;

use sl_searcher::{BestValidation, SearchMethodType, Searcher};
use sl_types::{
    CheckpointMetrics, ExitedReason, Hyperparameters, ObjectiveDirection, Operation, RequestId,
    SearchSpace, SearcherConfig, Shutdown, SlResult, ValidationMetrics,
};

use crate::objective::SyntheticObjective;
use crate::SimulationInput;

fn default_noise() -> f64 {
    0.01
}

fn default_max_events() -> usize {
    100_000
}

/// Executor behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Seed of the executor's own RNG, independent of the searcher seed.
    #[serde(default)]
    pub seed: u64,
    /// Chance that a training step crashes its trial.
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default = "default_noise")]
    pub noise: f64,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Snapshot and restore the searcher every this many events; 0 disables.
    #[serde(default)]
    pub snapshot_interval: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            failure_rate: 0.0,
            noise: default_noise(),
            max_events: default_max_events(),
            snapshot_interval: 0,
        }
    }
}

impl SimulationConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate;
        self
    }

    pub fn with_snapshot_interval(mut self, events: usize) -> Self {
        self.snapshot_interval = events;
        self
    }
}

/// Outcome of a simulated search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub method: SearchMethodType,
    pub shutdown: Option<Shutdown>,
    /// No trial had work left but the searcher never shut down.
    pub stalled: bool,
    pub events: usize,
    pub trials_created: usize,
    pub trials_closed: usize,
    pub trials_exited: usize,
    pub total_units: f64,
    pub progress: f64,
    pub best: Option<BestValidation>,
}

#[derive(Debug)]
struct SimTrial {
    hparams: Hyperparameters,
    queue: VecDeque<Operation>,
    units: f64,
    closed: bool,
}

/// A searcher wired to a fake executor.
#[derive(Debug)]
pub struct Simulation {
    config: SimulationConfig,
    searcher_config: SearcherConfig,
    space: SearchSpace,
    searcher: Searcher,
    objective: SyntheticObjective,
    rng: ChaCha8Rng,
    trials: BTreeMap<RequestId, SimTrial>,
    operations: Vec<Operation>,
    progress_history: Vec<f64>,
    events: usize,
    stalled: bool,
}

impl Simulation {
    pub fn new(
        searcher_config: SearcherConfig,
        space: SearchSpace,
        config: SimulationConfig,
    ) -> SlResult<Self> {
        let searcher = Searcher::new(&searcher_config, space.clone())?;
        Ok(Self {
            objective: SyntheticObjective::new(config.noise),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            searcher_config,
            space,
            searcher,
            trials: BTreeMap::new(),
            operations: Vec::new(),
            progress_history: Vec::new(),
            events: 0,
            stalled: false,
        })
    }

    pub fn from_input(input: SimulationInput) -> SlResult<Self> {
        Self::new(input.searcher, input.hyperparameters, input.simulation)
    }

    /// Every operation the searcher emitted, in order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Searcher progress after every event.
    pub fn progress_history(&self) -> &[f64] {
        &self.progress_history
    }

    pub fn searcher(&self) -> &Searcher {
        &self.searcher
    }

    /// Replace the searcher with one restored from its own snapshot.
    pub fn snapshot_and_restore(&mut self) -> SlResult<()> {
        let snapshot = self.searcher.snapshot()?;
        self.searcher = Searcher::restore(&self.searcher_config, self.space.clone(), &snapshot)?;
        debug!("Searcher restored from snapshot after {} events", self.events);
        Ok(())
    }

    /// Run until the searcher shuts down, nothing is left to do or the event
    /// limit is hit.
    pub fn run(&mut self) -> SlResult<SimulationReport> {
        info!("Simulating {} search", self.searcher.method_type());
        let ops = self.searcher.initial_operations()?;
        self.dispatch(ops);

        while !self.searcher.is_shutdown() && self.events < self.config.max_events {
            let ready: Vec<RequestId> = self
                .trials
                .iter()
                .filter(|(_, trial)| !trial.closed && !trial.queue.is_empty())
                .map(|(id, _)| *id)
                .collect();
            if ready.is_empty() {
                warn!("No trial has work left but the search is still running");
                self.stalled = true;
                break;
            }

            let request_id = ready[self.rng.gen_range(0..ready.len())];
            let ops = self.execute(request_id)?;
            self.events += 1;
            self.dispatch(ops);
            self.progress_history.push(self.searcher.progress());

            if self.config.snapshot_interval > 0
                && self.events % self.config.snapshot_interval == 0
                && !self.searcher.is_shutdown()
            {
                self.snapshot_and_restore()?;
            }
        }

        let report = self.report();
        info!(
            "Simulation finished after {} events with {} trials",
            report.events, report.trials_created
        );
        Ok(report)
    }

    fn report(&self) -> SimulationReport {
        let state = self.searcher.state();
        SimulationReport {
            method: self.searcher.method_type(),
            shutdown: self.searcher.shutdown(),
            stalled: self.stalled,
            events: self.events,
            trials_created: state.trials_requested.len(),
            trials_closed: state.trials_closed.len(),
            trials_exited: state.trials_exited.len(),
            total_units: state.total_units_completed,
            progress: self.searcher.progress(),
            best: state.best.clone(),
        }
    }

    fn dispatch(&mut self, ops: Vec<Operation>) {
        for op in ops {
            self.operations.push(op.clone());
            match op {
                Operation::Create(create) => {
                    let units = create
                        .parent
                        .and_then(|parent| self.trials.get(&parent))
                        .map_or(0.0, |parent| parent.units);
                    self.trials.insert(
                        create.request_id,
                        SimTrial {
                            hparams: create.hparams.clone(),
                            queue: VecDeque::from([Operation::Create(create)]),
                            units,
                            closed: false,
                        },
                    );
                }
                Operation::Shutdown(_) => {}
                other => {
                    let trial = other
                        .request_id()
                        .and_then(|request_id| self.trials.get_mut(&request_id));
                    match trial {
                        Some(trial) if !trial.closed => trial.queue.push_back(other),
                        _ => debug!("Dropping {other} for a finished trial"),
                    }
                }
            }
        }
    }

    fn execute(&mut self, request_id: RequestId) -> SlResult<Vec<Operation>> {
        let Some(trial) = self.trials.get_mut(&request_id) else {
            return Ok(Vec::new());
        };
        let Some(op) = trial.queue.pop_front() else {
            return Ok(Vec::new());
        };

        match op {
            Operation::Create(_) => self.searcher.trial_created(request_id),
            Operation::Train(train) => {
                let failure_rate = self.config.failure_rate.clamp(0.0, 1.0);
                if failure_rate > 0.0 && self.rng.gen_bool(failure_rate) {
                    return self.fail(request_id);
                }
                trial.units += train.length.units as f64;
                self.searcher.train_completed(request_id, &train)
            }
            Operation::Validate(validate) => {
                let loss = self.objective.evaluate(&trial.hparams, trial.units, &mut self.rng);
                let value = match self.searcher_config.direction {
                    ObjectiveDirection::Minimize => loss,
                    ObjectiveDirection::Maximize => -loss,
                };
                let metrics =
                    ValidationMetrics::new().with_metric(self.searcher_config.metric.clone(), value);
                self.searcher
                    .validation_completed(request_id, &validate, &metrics)
            }
            Operation::Checkpoint(checkpoint) => {
                let metrics = CheckpointMetrics {
                    uuid: Some(Uuid::from_u128(self.rng.gen())),
                    resources: BTreeMap::from([("state.bin".to_string(), 1024)]),
                };
                self.searcher
                    .checkpoint_completed(request_id, &checkpoint, &metrics)
            }
            Operation::Close(_) => {
                trial.closed = true;
                trial.queue.clear();
                self.searcher.trial_closed(request_id)
            }
            Operation::Shutdown(_) => Ok(Vec::new()),
        }
    }

    /// Crash a trial: report the exit, then tear it down.
    fn fail(&mut self, request_id: RequestId) -> SlResult<Vec<Operation>> {
        if let Some(trial) = self.trials.get_mut(&request_id) {
            trial.closed = true;
            trial.queue.clear();
        }
        let mut ops = self
            .searcher
            .trial_exited_early(request_id, ExitedReason::Errored)?;
        if !self.searcher.is_shutdown() {
            ops.extend(self.searcher.trial_closed(request_id)?);
        }
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sl_types::{
        AdaptiveAshaConfig, AdaptiveConfig, AdaptiveMode, AdaptiveSimpleConfig,
        AsyncHalvingConfig, GridConfig, Length, PbtConfig, RandomConfig, SearcherVariant,
        SingleConfig, SyncHalvingConfig,
    };

    fn space() -> SearchSpace {
        SearchSpace::new()
            .add_float("dropout", 0.0, 0.5)
            .add_int("layers", 1, 8)
            .add_log_uniform("lr", 1e-4, 1e-1)
            .add_choice("optimizer", vec![json!("adam"), json!("sgd")])
            .add_const("batch_size", json!(64))
    }

    fn searcher_config(variant: SearcherVariant) -> SearcherConfig {
        SearcherConfig::new("validation_loss")
            .with_seed(42)
            .with_method(variant)
    }

    fn all_methods() -> Vec<SearcherVariant> {
        vec![
            SearcherVariant::Single(SingleConfig::new(Length::batches(50))),
            SearcherVariant::Random(
                RandomConfig::new(5, Length::batches(20)).with_max_concurrent_trials(2),
            ),
            SearcherVariant::Grid(
                GridConfig::new(Length::batches(20))
                    .with_divisions("dropout", 2)
                    .with_divisions("layers", 2)
                    .with_divisions("lr", 2)
                    .with_max_concurrent_trials(3),
            ),
            SearcherVariant::SyncHalving(SyncHalvingConfig::with_num_trials(
                3,
                3.0,
                Length::batches(90),
                9,
            )),
            SearcherVariant::AsyncHalving(
                AsyncHalvingConfig::new(3, 3.0, Length::batches(90), 12)
                    .with_max_concurrent_trials(4),
            ),
            SearcherVariant::Adaptive(AdaptiveConfig {
                mode: AdaptiveMode::Standard,
                divisor: 3.0,
                max_rungs: 3,
                max_length: Length::batches(90),
                budget: Length::batches(900),
            }),
            SearcherVariant::AdaptiveSimple(AdaptiveSimpleConfig {
                mode: AdaptiveMode::Conservative,
                divisor: 3.0,
                max_rungs: 2,
                max_length: Length::batches(90),
                max_trials: 8,
            }),
            SearcherVariant::AdaptiveAsha(AdaptiveAshaConfig {
                mode: AdaptiveMode::Standard,
                divisor: 3.0,
                max_rungs: 3,
                max_length: Length::batches(90),
                max_trials: 16,
                max_concurrent_trials: 4,
                bracket_rungs: Vec::new(),
            }),
            SearcherVariant::Pbt(PbtConfig {
                population_size: 4,
                num_rounds: 3,
                length_per_round: Length::batches(10),
                perturb_interval: 1,
                truncate_fraction: 0.25,
                resample_probability: 0.2,
                perturb_factor: 0.2,
            }),
        ]
    }

    fn simulate(variant: SearcherVariant, config: SimulationConfig) -> Simulation {
        let mut sim = Simulation::new(searcher_config(variant), space(), config).unwrap();
        sim.run().unwrap();
        sim
    }

    fn assert_monotone(history: &[f64]) {
        for pair in history.windows(2) {
            assert!(pair[1] >= pair[0], "progress went from {} to {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn every_method_runs_to_completion() {
        for variant in all_methods() {
            let name = variant.name();
            let sim = simulate(variant, SimulationConfig::default().with_seed(1));
            let report = sim.report();
            assert!(!report.stalled, "{name} stalled");
            assert_eq!(report.shutdown, Some(Shutdown { failure: false }), "{name}");
            assert_eq!(report.progress, 1.0, "{name}");
            assert_eq!(report.trials_closed, report.trials_created, "{name}");
            assert!(report.best.is_some(), "{name}");
            assert_monotone(sim.progress_history());
        }
    }

    #[test]
    fn snapshot_resume_does_not_change_the_operation_stream() {
        for variant in all_methods() {
            let name = variant.name();
            let straight = simulate(variant.clone(), SimulationConfig::default().with_seed(3));
            let resumed = simulate(
                variant,
                SimulationConfig::default()
                    .with_seed(3)
                    .with_snapshot_interval(7),
            );
            assert_eq!(straight.operations(), resumed.operations(), "{name}");
            assert_eq!(straight.report(), resumed.report(), "{name}");
        }
    }

    #[test]
    fn tolerant_methods_survive_crashing_trials() {
        let tolerant = all_methods()
            .into_iter()
            .filter(|variant| !matches!(variant, SearcherVariant::Single(_)));
        for variant in tolerant {
            let name = variant.name();
            let sim = simulate(
                variant,
                SimulationConfig::default().with_seed(9).with_failure_rate(0.15),
            );
            let report = sim.report();
            assert!(!report.stalled, "{name} stalled");
            assert_eq!(report.shutdown, Some(Shutdown { failure: false }), "{name}");
        }
    }

    #[test]
    fn single_trial_crash_fails_the_search() {
        let sim = simulate(
            SearcherVariant::Single(SingleConfig::new(Length::batches(50))),
            SimulationConfig::default().with_failure_rate(1.0),
        );
        let report = sim.report();
        assert_eq!(report.shutdown, Some(Shutdown { failure: true }));
        assert_eq!(report.trials_exited, 1);
    }

    #[test]
    fn random_three_trials_seed_42() {
        let variant = SearcherVariant::Random(RandomConfig::new(3, Length::batches(100)));
        let sim = simulate(variant.clone(), SimulationConfig::default().with_seed(5));
        let draws: Vec<&Hyperparameters> = sim
            .operations()
            .iter()
            .filter_map(|op| match op {
                Operation::Create(create) => Some(&create.hparams),
                _ => None,
            })
            .collect();
        assert_eq!(draws.len(), 3);
        assert_eq!(sim.operations().last(), Some(&Operation::shutdown()));
        assert_eq!(sim.report().progress, 1.0);

        // a different executor order leaves the draws untouched
        let other = simulate(variant, SimulationConfig::default().with_seed(6));
        let other_draws: Vec<&Hyperparameters> = other
            .operations()
            .iter()
            .filter_map(|op| match op {
                Operation::Create(create) => Some(&create.hparams),
                _ => None,
            })
            .collect();
        assert_eq!(draws, other_draws);
    }

    #[test]
    fn pbt_children_record_their_source() {
        let sim = simulate(all_methods().pop().unwrap(), SimulationConfig::default().with_seed(2));
        let children: Vec<_> = sim
            .operations()
            .iter()
            .filter_map(|op| match op {
                Operation::Create(create) => create.parent.map(|parent| (parent, create)),
                _ => None,
            })
            .collect();
        assert!(!children.is_empty());
        for (parent, child) in children {
            // the source was checkpointed before the child appeared
            let checkpoint = sim
                .operations()
                .iter()
                .position(|op| *op == Operation::checkpoint(parent));
            let created = sim
                .operations()
                .iter()
                .position(|op| op.request_id() == Some(child.request_id));
            assert!(checkpoint < created);
        }
    }

    #[test]
    fn input_parses_from_json() {
        let json = r#"{
            "searcher": {
                "metric": "validation_loss",
                "seed": 7,
                "random": {"max_trials": 2, "max_length": {"unit": "batches", "units": 10}}
            },
            "hyperparameters": {
                "parameters": [
                    {"name": "lr", "kind": {"type": "log_uniform", "low": 0.0001, "high": 0.1}}
                ]
            },
            "simulation": {"seed": 3}
        }"#;
        let input = SimulationInput::from_json_str(json).unwrap();
        assert_eq!(input.simulation.seed, 3);
        assert_eq!(input.simulation.max_events, 100_000);
        let mut sim = Simulation::from_input(input).unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.trials_created, 2);
        assert_eq!(report.shutdown, Some(Shutdown { failure: false }));
    }
}
