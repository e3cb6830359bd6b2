//! Asynchronous successive halving (ASHA).
//!
//! Same rung ladder as the synchronous variant but without a barrier: each
//! report is ranked against everything ever reported at that rung and the
//! trial is promoted right away when it lands in the top `1/divisor`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use sl_types::{
    AsyncHalvingConfig, Checkpoint, CheckpointMetrics, Create, ExitedReason, Hyperparameters,
    Operation, RequestId, SearcherError, SlResult, Unit, Validate, ValidationMetrics,
};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::method::{Objective, SearchMethod, SearchMethodType};
use crate::sample::sample_all;
use crate::snapshot::MethodSnapshot;
use crate::sync_halving::{rung_deltas, rung_units, WORST_METRIC};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct AsyncHalvingState {
    /// Sorted metrics ever reported per rung.
    rung_metrics: Vec<Vec<f64>>,
    trial_rungs: BTreeMap<RequestId, usize>,
    trial_hparams: BTreeMap<RequestId, Hyperparameters>,
    reported_trials: BTreeSet<RequestId>,
    early_exit_trials: BTreeSet<RequestId>,
    /// Trials currently holding a concurrency slot.
    active_trials: BTreeSet<RequestId>,
    pending_handoffs: BTreeMap<RequestId, usize>,
    closed_trials: BTreeSet<RequestId>,
    trials_created: usize,
    base_trials_created: usize,
    invalid_trials: usize,
    shutdown_sent: bool,
}

/// Asynchronous successive halving.
#[derive(Debug, Clone)]
pub struct AsyncHalvingSearch {
    config: AsyncHalvingConfig,
    objective: Objective,
    deltas: Vec<u64>,
    state: AsyncHalvingState,
}

impl AsyncHalvingSearch {
    pub fn new(config: AsyncHalvingConfig, objective: Objective) -> Self {
        let num_rungs = config.num_rungs.max(1);
        let deltas = rung_deltas(&rung_units(
            config.max_length.units,
            num_rungs,
            config.divisor,
        ));
        Self {
            config,
            objective,
            deltas,
            state: AsyncHalvingState {
                rung_metrics: vec![Vec::new(); num_rungs],
                ..AsyncHalvingState::default()
            },
        }
    }

    fn concurrency(&self) -> usize {
        match self.config.max_concurrent_trials {
            0 => self.config.max_trials,
            n => n.min(self.config.max_trials),
        }
    }

    fn top_rung(&self) -> usize {
        self.deltas.len() - 1
    }

    fn remaining_base_trials(&self) -> usize {
        let counted = self.state.base_trials_created - self.state.invalid_trials;
        self.config.max_trials.saturating_sub(counted)
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
        self.state.active_trials.insert(request_id);
        self.state.trials_created += 1;
        vec![
            Operation::train(request_id, self.config.max_length.with_units(self.deltas[rung])),
            Operation::validate(request_id),
        ]
    }

    /// Fill free slots with fresh rung-0 trials while the trial budget lasts.
    fn fill_slots(&mut self, ctx: &mut Context<'_>) -> Vec<Operation> {
        let mut ops = Vec::new();
        while self.remaining_base_trials() > 0
            && self.state.active_trials.len() < self.concurrency()
        {
            let hparams = sample_all(ctx.space, ctx.rng);
            let create = Create::new(ctx.rng, hparams.clone());
            let request_id = create.request_id;
            self.state.trial_hparams.insert(request_id, hparams);
            self.state.base_trials_created += 1;
            ops.push(create.into());
            ops.extend(self.start_trial(request_id, 0));
        }
        ops
    }

    fn maybe_shutdown(&mut self, ops: &mut Vec<Operation>) {
        if !self.state.shutdown_sent
            && self.remaining_base_trials() == 0
            && self.state.active_trials.is_empty()
            && self.state.pending_handoffs.is_empty()
            && self.state.closed_trials.len() == self.state.trials_created
        {
            self.state.shutdown_sent = true;
            info!(
                "Asynchronous halving finished after {} trials",
                self.state.trials_created
            );
            ops.push(Operation::shutdown());
        }
    }
}

impl SearchMethod for AsyncHalvingSearch {
    fn method_type(&self) -> SearchMethodType {
        SearchMethodType::AsyncHalving
    }

    fn unit(&self) -> Unit {
        self.config.max_length.unit
    }

    fn initial_operations(&mut self, ctx: &mut Context<'_>) -> SlResult<Vec<Operation>> {
        info!(
            "Asynchronous halving over {} rungs with {} trials, {} at a time",
            self.deltas.len(),
            self.config.max_trials,
            self.concurrency()
        );
        Ok(self.fill_slots(ctx))
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
        self.state.active_trials.remove(&request_id);
        debug!("Promoted trial {request_id} continues as {child_id} in rung {rung}");

        let mut ops = vec![child.into()];
        ops.extend(self.start_trial(child_id, rung));
        ops.push(Operation::close(request_id));
        Ok(ops)
    }

    fn validation_completed(
        &mut self,
        ctx: &mut Context<'_>,
        request_id: RequestId,
        _validate: &Validate,
        metrics: &ValidationMetrics,
    ) -> SlResult<Vec<Operation>> {
        let rung = self.rung_of(request_id)?;
        if self.state.reported_trials.contains(&request_id) {
            return Err(SearcherError::DuplicateValidation { request_id, rung }.into());
        }
        let metric = self.objective.score(metrics)?;
        self.state.reported_trials.insert(request_id);

        let top = self.top_rung();
        let history = &mut self.state.rung_metrics[rung];
        let rank = history.partition_point(|m| *m <= metric);
        history.insert(rank, metric);
        let reported = history.len();
        let quota = (reported as f64 / self.config.divisor).floor() as usize;

        let mut ops = Vec::new();
        if rung < top && rank < quota {
            debug!("Trial {request_id} ranked {rank} of {reported} at rung {rung}, promoting");
            self.state.pending_handoffs.insert(request_id, rung + 1);
            ops.push(Operation::checkpoint(request_id));
        } else {
            ops.push(Operation::close(request_id));
            self.state.active_trials.remove(&request_id);
            ops.extend(self.fill_slots(ctx));
        }
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
        ctx: &mut Context<'_>,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> SlResult<Vec<Operation>> {
        let rung = self.rung_of(request_id)?;
        warn!("Asynchronous halving trial {request_id} exited early at rung {rung}: {reason}");
        if !self.state.early_exit_trials.insert(request_id) {
            return Ok(Vec::new());
        }
        if reason == ExitedReason::InvalidHyperparameters && rung == 0 {
            self.state.invalid_trials += 1;
        }
        self.state.pending_handoffs.remove(&request_id);
        if self.state.reported_trials.insert(request_id) {
            self.state.rung_metrics[rung].push(WORST_METRIC);
        }
        self.state.active_trials.remove(&request_id);

        let mut ops = self.fill_slots(ctx);
        self.maybe_shutdown(&mut ops);
        Ok(ops)
    }

    /// Rough total work: `floor(max_trials / divisor^k)` trials reach rung `k`.
    fn expected_units(&self) -> f64 {
        self.deltas
            .iter()
            .enumerate()
            .map(|(k, delta)| {
                let reach = (self.config.max_trials as f64 / self.config.divisor.powi(k as i32)).floor();
                reach * *delta as f64
            })
            .sum::<f64>()
            .max(1.0)
    }

    fn snapshot(&self) -> SlResult<Option<MethodSnapshot>> {
        MethodSnapshot::encode(self.method_type(), SNAPSHOT_VERSION, &self.state).map(Some)
    }

    fn restore(&mut self, snapshot: Option<&MethodSnapshot>) -> SlResult<()> {
        self.state = MethodSnapshot::decode(snapshot, self.method_type(), SNAPSHOT_VERSION)?;
        Ok(())
    }
}
