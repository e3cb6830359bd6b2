//! Synchronous successive halving over a single bracket.
//!
//! Every rung is a barrier: nobody advances until all trials of the rung have
//! reported. The best `ceil(n / divisor)` are then promoted by checkpointing
//! them and warm-starting a child trial for the next rung; the rest are
//! closed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use sl_types::{
    Checkpoint, CheckpointMetrics, Create, ExitedReason, Hyperparameters, Operation, RequestId,
    SearcherError, SlResult, SyncHalvingConfig, Unit, Validate, ValidationMetrics,
};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::method::{Objective, SearchMethod, SearchMethodType};
use crate::sample::sample_all;
use crate::snapshot::MethodSnapshot;

const SNAPSHOT_VERSION: u32 = 1;

/// Metric recorded for trials that never produced a usable one.
pub(crate) const WORST_METRIC: f64 = f64::MAX;

/// Target length of every rung: `max(1, floor(max_units / divisor^(R-1-k)))`.
pub(crate) fn rung_units(max_units: u64, num_rungs: usize, divisor: f64) -> Vec<u64> {
    (0..num_rungs)
        .map(|k| {
            let shrink = divisor.powi((num_rungs - 1 - k) as i32);
            ((max_units as f64 / shrink).floor() as u64).max(1)
        })
        .collect()
}

/// Training each rung adds on top of the previous one.
pub(crate) fn rung_deltas(units: &[u64]) -> Vec<u64> {
    units
        .iter()
        .enumerate()
        .map(|(k, target)| match k {
            0 => *target,
            _ => target.saturating_sub(units[k - 1]).max(1),
        })
        .collect()
}

fn rung_sizes(num_trials: usize, num_rungs: usize, divisor: f64) -> Vec<usize> {
    let mut sizes = Vec::with_capacity(num_rungs);
    let mut size = num_trials;
    for _ in 0..num_rungs {
        sizes.push(size);
        size = ((size as f64 / divisor).ceil() as usize).max(1);
    }
    sizes
}

/// How many of a rung's `entered` trials move up: `ceil(entered / divisor)`,
/// at least one unless the rung is empty.
fn promotion_quota(entered: usize, divisor: f64) -> usize {
    match entered {
        0 => 0,
        n => ((n as f64 / divisor).ceil() as usize).max(1),
    }
}

fn expected_units(sizes: &[usize], deltas: &[u64]) -> u64 {
    sizes
        .iter()
        .zip(deltas)
        .map(|(size, delta)| *size as u64 * delta)
        .sum()
}

/// The largest rung-0 population whose expected work fits `budget`.
fn trials_for_budget(budget: u64, num_rungs: usize, divisor: f64, deltas: &[u64]) -> usize {
    let mut lo = 1usize;
    let mut hi = (budget / deltas[0].max(1)).max(1) as usize;
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if expected_units(&rung_sizes(mid, num_rungs, divisor), deltas) <= budget {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    lo
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TrialMetric {
    request_id: RequestId,
    metric: f64,
    promoted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Rung {
    start_trials: usize,
    metrics: Vec<TrialMetric>,
    advanced: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SyncHalvingState {
    rungs: Vec<Rung>,
    trial_rungs: BTreeMap<RequestId, usize>,
    trial_hparams: BTreeMap<RequestId, Hyperparameters>,
    early_exit_trials: BTreeSet<RequestId>,
    /// Promoted trials waiting for their checkpoint, keyed to the rung their
    /// child will start in.
    pending_handoffs: BTreeMap<RequestId, usize>,
    closed_trials: BTreeSet<RequestId>,
    trials_created: usize,
    search_complete: bool,
    shutdown_sent: bool,
}

/// Synchronous successive halving.
#[derive(Debug, Clone)]
pub struct SyncHalvingSearch {
    config: SyncHalvingConfig,
    objective: Objective,
    units: Vec<u64>,
    deltas: Vec<u64>,
    sizes: Vec<usize>,
    state: SyncHalvingState,
}

impl SyncHalvingSearch {
    pub fn new(config: SyncHalvingConfig, objective: Objective) -> Self {
        let num_rungs = config.num_rungs.max(1);
        let units = rung_units(config.max_length.units, num_rungs, config.divisor);
        let deltas = rung_deltas(&units);
        let num_trials = match (config.num_trials, &config.budget) {
            (Some(n), _) => n.max(1),
            (None, Some(budget)) => trials_for_budget(budget.units, num_rungs, config.divisor, &deltas),
            (None, None) => 1,
        };
        let sizes = rung_sizes(num_trials, num_rungs, config.divisor);
        let rungs = sizes
            .iter()
            .map(|size| Rung {
                start_trials: *size,
                ..Rung::default()
            })
            .collect();
        Self {
            config,
            objective,
            units,
            deltas,
            sizes,
            state: SyncHalvingState {
                rungs,
                ..SyncHalvingState::default()
            },
        }
    }

    /// Planned population of every rung.
    pub fn rung_sizes(&self) -> &[usize] {
        &self.sizes
    }

    fn rung_of(&self, request_id: RequestId) -> SlResult<usize> {
        self.state
            .trial_rungs
            .get(&request_id)
            .copied()
            .ok_or_else(|| SearcherError::UnknownRequest { request_id }.into())
    }

    fn start_trial(&mut self, request_id: RequestId, rung: usize) -> Vec<Operation> {
        self.state.trial_rungs.insert(request_id, rung);
        self.state.trials_created += 1;
        vec![
            Operation::train(request_id, self.config.max_length.with_units(self.deltas[rung])),
            Operation::validate(request_id),
        ]
    }

    /// Advance every rung whose barrier is satisfied, starting at `rung`.
    fn advance(&mut self, mut rung: usize) -> Vec<Operation> {
        let mut ops = Vec::new();
        let top = self.state.rungs.len() - 1;
        loop {
            let current = &mut self.state.rungs[rung];
            if current.advanced || current.metrics.len() < current.start_trials {
                break;
            }
            current.advanced = true;

            if rung == top {
                for trial in &current.metrics {
                    if !self.state.early_exit_trials.contains(&trial.request_id) {
                        ops.push(Operation::close(trial.request_id));
                    }
                }
                self.state.search_complete = true;
                info!("Synchronous halving completed its top rung");
                break;
            }

            current
                .metrics
                .sort_by(|a, b| a.metric.total_cmp(&b.metric));
            let quota = promotion_quota(current.start_trials, self.config.divisor);
            let mut promoted = 0;
            for trial in current.metrics.iter_mut() {
                if self.state.early_exit_trials.contains(&trial.request_id) {
                    continue;
                }
                if promoted < quota {
                    trial.promoted = true;
                    promoted += 1;
                    self.state.pending_handoffs.insert(trial.request_id, rung + 1);
                    ops.push(Operation::checkpoint(trial.request_id));
                } else {
                    ops.push(Operation::close(trial.request_id));
                }
            }
            debug!("Rung {rung} promoted {promoted} of {} trials", current.metrics.len());
            self.state.rungs[rung + 1].start_trials = promoted;
            rung += 1;
        }
        ops
    }

    fn maybe_shutdown(&mut self, ops: &mut Vec<Operation>) {
        if self.state.search_complete
            && !self.state.shutdown_sent
            && self.state.pending_handoffs.is_empty()
            && self.state.closed_trials.len() == self.state.trials_created
        {
            self.state.shutdown_sent = true;
            info!(
                "Synchronous halving finished after {} trials",
                self.state.trials_created
            );
            ops.push(Operation::shutdown());
        }
    }
}

impl SearchMethod for SyncHalvingSearch {
    fn method_type(&self) -> SearchMethodType {
        SearchMethodType::SyncHalving
    }

    fn unit(&self) -> Unit {
        self.config.max_length.unit
    }

    fn initial_operations(&mut self, ctx: &mut Context<'_>) -> SlResult<Vec<Operation>> {
        info!(
            "Synchronous halving with rung sizes {:?} and rung lengths {:?}",
            self.sizes, self.units
        );
        let mut ops = Vec::new();
        for _ in 0..self.sizes[0] {
            let hparams = sample_all(ctx.space, ctx.rng);
            let create = Create::new(ctx.rng, hparams.clone());
            let request_id = create.request_id;
            self.state.trial_hparams.insert(request_id, hparams);
            ops.push(create.into());
            ops.extend(self.start_trial(request_id, 0));
        }
        Ok(ops)
    }

    fn checkpoint_completed(
        &mut self,
        ctx: &mut Context<'_>,
        request_id: RequestId,
        _checkpoint: &Checkpoint,
        _metrics: &CheckpointMetrics,
    ) -> SlResult<Vec<Operation>> {
        let Some(rung) = self.state.pending_handoffs.remove(&request_id) else {
            return Ok(Vec::new());
        };
        let hparams = self
            .state
            .trial_hparams
            .get(&request_id)
            .cloned()
            .ok_or(SearcherError::UnknownRequest { request_id })?;
        let child = Create::from_parent(ctx.rng, hparams.clone(), request_id);
        let child_id = child.request_id;
        self.state.trial_hparams.insert(child_id, hparams);
        debug!("Promoted trial {request_id} continues as {child_id} in rung {rung}");

        let mut ops = vec![child.into()];
        ops.extend(self.start_trial(child_id, rung));
        ops.push(Operation::close(request_id));
        Ok(ops)
    }

    fn validation_completed(
        &mut self,
        _ctx: &mut Context<'_>,
        request_id: RequestId,
        _validate: &Validate,
        metrics: &ValidationMetrics,
    ) -> SlResult<Vec<Operation>> {
        let rung = self.rung_of(request_id)?;
        if self.state.rungs[rung]
            .metrics
            .iter()
            .any(|trial| trial.request_id == request_id)
        {
            return Err(SearcherError::DuplicateValidation { request_id, rung }.into());
        }
        let metric = self.objective.score(metrics)?;
        self.state.rungs[rung].metrics.push(TrialMetric {
            request_id,
            metric,
            promoted: false,
        });
        let mut ops = self.advance(rung);
        self.maybe_shutdown(&mut ops);
        Ok(ops)
    }

    fn trial_closed(
        &mut self,
        _ctx: &mut Context<'_>,
        request_id: RequestId,
    ) -> SlResult<Vec<Operation>> {
        self.rung_of(request_id)?;
        self.state.closed_trials.insert(request_id);
        let mut ops = Vec::new();
        self.maybe_shutdown(&mut ops);
        Ok(ops)
    }

    fn trial_exited_early(
        &mut self,
        _ctx: &mut Context<'_>,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> SlResult<Vec<Operation>> {
        let rung = self.rung_of(request_id)?;
        warn!("Synchronous halving trial {request_id} exited early at rung {rung}: {reason}");
        self.state.early_exit_trials.insert(request_id);

        let mut ops = Vec::new();
        if let Some(next) = self.state.pending_handoffs.remove(&request_id) {
            let start = &mut self.state.rungs[next].start_trials;
            *start = start.saturating_sub(1);
            ops.extend(self.advance(next));
        } else if !self.state.rungs[rung]
            .metrics
            .iter()
            .any(|trial| trial.request_id == request_id)
        {
            self.state.rungs[rung].metrics.push(TrialMetric {
                request_id,
                metric: WORST_METRIC,
                promoted: false,
            });
            ops.extend(self.advance(rung));
        }
        self.maybe_shutdown(&mut ops);
        Ok(ops)
    }

    fn expected_units(&self) -> f64 {
        expected_units(&self.sizes, &self.deltas) as f64
    }

    fn snapshot(&self) -> SlResult<Option<MethodSnapshot>> {
        MethodSnapshot::encode(self.method_type(), SNAPSHOT_VERSION, &self.state).map(Some)
    }

    fn restore(&mut self, snapshot: Option<&MethodSnapshot>) -> SlResult<()> {
        self.state = MethodSnapshot::decode(snapshot, self.method_type(), SNAPSHOT_VERSION)?;
        Ok(())
    }
}
