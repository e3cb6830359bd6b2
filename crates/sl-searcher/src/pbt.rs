//! Population-based training.
//!
//! A fixed number of population slots train in rounds. At the end of every
//! `perturb_interval`-th round the worst members are replaced by warm-started
//! copies of the best ones, with explored hyperparameters.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use sl_types::{
    Checkpoint, CheckpointMetrics, Create, ExitedReason, Hyperparameters, Operation, PbtConfig,
    RequestId, SearcherError, SlResult, Unit, Validate, ValidationMetrics,
};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::method::{Objective, SearchMethod, SearchMethodType};
use crate::sample::{explore, sample_all};
use crate::snapshot::MethodSnapshot;

const SNAPSHOT_VERSION: u32 = 1;

/// The trial currently occupying one population slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationMember {
    pub request_id: RequestId,
    pub hparams: Hyperparameters,
    /// The member this one was warm-started from.
    pub parent: Option<RequestId>,
    /// Last normalized metric, smaller is better.
    pub fitness: Option<f64>,
    pub exited: bool,
}

impl PopulationMember {
    fn new(create: &Create) -> Self {
        Self {
            request_id: create.request_id,
            hparams: create.hparams.clone(),
            parent: create.parent,
            fitness: None,
            exited: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PbtState {
    members: Vec<PopulationMember>,
    /// Slot of every trial ever created, current or replaced.
    trial_slots: BTreeMap<RequestId, usize>,
    /// Slots that reported in the current round.
    reported: BTreeSet<usize>,
    rounds_completed: usize,
    /// Replacements waiting on their source's checkpoint.
    pending_exploits: BTreeMap<RequestId, Vec<(usize, Hyperparameters)>>,
    ancestry: BTreeMap<RequestId, RequestId>,
    closed_trials: BTreeSet<RequestId>,
    trials_created: usize,
    finished: bool,
    shutdown_sent: bool,
}

/// Population-based training.
#[derive(Debug, Clone)]
pub struct PbtSearch {
    config: PbtConfig,
    objective: Objective,
    state: PbtState,
}

impl PbtSearch {
    pub fn new(config: PbtConfig, objective: Objective) -> Self {
        Self {
            config,
            objective,
            state: PbtState::default(),
        }
    }

    pub fn population(&self) -> &[PopulationMember] {
        &self.state.members
    }

    /// Parent of every warm-started trial.
    pub fn ancestry(&self) -> &BTreeMap<RequestId, RequestId> {
        &self.state.ancestry
    }

    pub fn rounds_completed(&self) -> usize {
        self.state.rounds_completed
    }

    fn train_round(&self, request_id: RequestId) -> [Operation; 2] {
        [
            Operation::train(request_id, self.config.length_per_round),
            Operation::validate(request_id),
        ]
    }

    /// Put `create` into `slot` and start its first round.
    fn occupy(&mut self, slot: usize, create: Create) -> Vec<Operation> {
        let member = PopulationMember::new(&create);
        let request_id = create.request_id;
        if let Some(parent) = create.parent {
            self.state.ancestry.insert(request_id, parent);
        }
        self.state.trial_slots.insert(request_id, slot);
        self.state.trials_created += 1;
        if slot < self.state.members.len() {
            self.state.members[slot] = member;
        } else {
            self.state.members.push(member);
        }
        let mut ops = vec![create.into()];
        ops.extend(self.train_round(request_id));
        ops
    }

    fn fresh_member(&mut self, ctx: &mut Context<'_>, slot: usize) -> Vec<Operation> {
        let hparams = sample_all(ctx.space, ctx.rng);
        let create = Create::new(ctx.rng, hparams);
        self.occupy(slot, create)
    }

    fn is_pending_replacement(&self, slot: usize) -> bool {
        self.state
            .pending_exploits
            .values()
            .any(|targets| targets.iter().any(|(target, _)| *target == slot))
    }

    /// Exited members report implicitly, unless a replacement is on its way.
    fn start_round(&mut self) {
        self.state.reported = (0..self.state.members.len())
            .filter(|slot| self.state.members[*slot].exited && !self.is_pending_replacement(*slot))
            .collect();
    }

    fn round_complete(&self) -> bool {
        self.state.reported.len() == self.config.population_size
    }

    fn end_rounds(&mut self, ctx: &mut Context<'_>) -> Vec<Operation> {
        let mut ops = Vec::new();
        while !self.state.finished && self.round_complete() {
            self.state.rounds_completed += 1;
            let round = self.state.rounds_completed;

            if round >= self.config.num_rounds {
                info!("Population-based training finished {round} rounds");
                self.state.finished = true;
                for member in &self.state.members {
                    if !member.exited {
                        ops.push(Operation::close(member.request_id));
                    }
                }
                break;
            }

            if round % self.config.perturb_interval == 0 {
                ops.extend(self.exploit_and_explore(ctx));
            } else {
                for member in &self.state.members {
                    if !member.exited {
                        ops.extend(self.train_round(member.request_id));
                    }
                }
            }
            self.start_round();
        }
        ops
    }

    fn exploit_and_explore(&mut self, ctx: &mut Context<'_>) -> Vec<Operation> {
        let members = &self.state.members;
        let mut ranked: Vec<usize> = (0..members.len()).filter(|s| !members[*s].exited).collect();
        ranked.sort_by(|a, b| {
            let fa = members[*a].fitness.unwrap_or(f64::MAX);
            let fb = members[*b].fitness.unwrap_or(f64::MAX);
            fa.total_cmp(&fb).then(a.cmp(b))
        });

        let truncate =
            ((self.config.truncate_fraction * self.config.population_size as f64).floor() as usize)
                .min(ranked.len());
        let mut replaced: Vec<usize> = (0..members.len()).filter(|s| members[*s].exited).collect();
        replaced.extend(ranked[ranked.len() - truncate..].iter().rev());
        let replaced_set: BTreeSet<usize> = replaced.iter().copied().collect();

        let mut ops = Vec::new();
        let mut fresh = Vec::new();
        let mut kept: BTreeSet<usize> = BTreeSet::new();
        for (i, slot) in replaced.iter().copied().enumerate() {
            let target = &self.state.members[slot];
            let target_fitness = if target.exited {
                f64::MAX
            } else {
                target.fitness.unwrap_or(f64::MAX)
            };
            let source = ranked.get(i).copied().filter(|source| {
                !replaced_set.contains(source)
                    && self.state.members[*source].fitness.unwrap_or(f64::MAX) < target_fitness
            });

            match source {
                Some(source) => {
                    let source_member = &self.state.members[source];
                    let source_id = source_member.request_id;
                    let hparams = explore(
                        ctx.space,
                        &source_member.hparams,
                        self.config.resample_probability,
                        self.config.perturb_factor,
                        ctx.rng,
                    );
                    debug!("Slot {slot} will be replaced from slot {source} ({source_id})");
                    if !target.exited {
                        ops.push(Operation::close(target.request_id));
                    }
                    let targets = self.state.pending_exploits.entry(source_id).or_default();
                    if targets.is_empty() {
                        ops.push(Operation::checkpoint(source_id));
                    }
                    targets.push((slot, hparams));
                }
                None if target.exited => fresh.push(slot),
                None => {
                    kept.insert(slot);
                }
            }
        }

        for slot in 0..self.state.members.len() {
            let member = &self.state.members[slot];
            if !member.exited && (!replaced_set.contains(&slot) || kept.contains(&slot)) {
                ops.extend(self.train_round(member.request_id));
            }
        }
        for slot in fresh {
            debug!("Slot {slot} has no better source, resampling");
            ops.extend(self.fresh_member(ctx, slot));
        }
        ops
    }

    fn maybe_shutdown(&mut self, ops: &mut Vec<Operation>) {
        if self.state.finished
            && !self.state.shutdown_sent
            && self.state.pending_exploits.is_empty()
            && self.state.closed_trials.len() == self.state.trials_created
        {
            self.state.shutdown_sent = true;
            ops.push(Operation::shutdown());
        }
    }

    fn slot_of(&self, request_id: RequestId) -> SlResult<usize> {
        self.state
            .trial_slots
            .get(&request_id)
            .copied()
            .ok_or_else(|| SearcherError::UnknownRequest { request_id }.into())
    }
}

impl SearchMethod for PbtSearch {
    fn method_type(&self) -> SearchMethodType {
        SearchMethodType::Pbt
    }

    fn unit(&self) -> Unit {
        self.config.length_per_round.unit
    }

    fn initial_operations(&mut self, ctx: &mut Context<'_>) -> SlResult<Vec<Operation>> {
        info!(
            "Population-based training with {} members for {} rounds",
            self.config.population_size, self.config.num_rounds
        );
        let mut ops = Vec::new();
        for slot in 0..self.config.population_size {
            ops.extend(self.fresh_member(ctx, slot));
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
        self.slot_of(request_id)?;
        let Some(targets) = self.state.pending_exploits.remove(&request_id) else {
            return Ok(Vec::new());
        };
        let mut ops = Vec::new();
        for (slot, hparams) in targets {
            let child = Create::from_parent(ctx.rng, hparams, request_id);
            debug!("Slot {slot} now runs {} from {request_id}", child.request_id);
            ops.extend(self.occupy(slot, child));
        }
        Ok(ops)
    }

    fn validation_completed(
        &mut self,
        ctx: &mut Context<'_>,
        request_id: RequestId,
        _validate: &Validate,
        metrics: &ValidationMetrics,
    ) -> SlResult<Vec<Operation>> {
        let slot = self.slot_of(request_id)?;
        if self.state.members[slot].request_id != request_id || self.state.finished {
            return Ok(Vec::new());
        }
        if !self.state.reported.insert(slot) {
            return Err(SearcherError::DuplicateValidation {
                request_id,
                rung: self.state.rounds_completed,
            }
            .into());
        }
        self.state.members[slot].fitness = Some(self.objective.score(metrics)?);
        let mut ops = self.end_rounds(ctx);
        self.maybe_shutdown(&mut ops);
        Ok(ops)
    }

    fn trial_closed(
        &mut self,
        _ctx: &mut Context<'_>,
        request_id: RequestId,
    ) -> SlResult<Vec<Operation>> {
        self.slot_of(request_id)?;
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
        let slot = self.slot_of(request_id)?;
        warn!("Population member {request_id} in slot {slot} exited early: {reason}");

        let mut ops = Vec::new();
        // replacements waiting on this trial's checkpoint start from scratch
        if let Some(targets) = self.state.pending_exploits.remove(&request_id) {
            for (target, _) in targets {
                ops.extend(self.fresh_member(ctx, target));
            }
        }

        let member = &mut self.state.members[slot];
        if member.request_id == request_id && !member.exited {
            member.exited = true;
            member.fitness = None;
            if !self.state.finished {
                self.state.reported.insert(slot);
                ops.extend(self.end_rounds(ctx));
            }
        }
        self.maybe_shutdown(&mut ops);
        Ok(ops)
    }

    fn expected_units(&self) -> f64 {
        self.config.population_size as f64
            * self.config.num_rounds as f64
            * self.config.length_per_round.units as f64
    }

    fn snapshot(&self) -> SlResult<Option<MethodSnapshot>> {
        MethodSnapshot::encode(self.method_type(), SNAPSHOT_VERSION, &self.state).map(Some)
    }

    fn restore(&mut self, snapshot: Option<&MethodSnapshot>) -> SlResult<()> {
        self.state = MethodSnapshot::decode(snapshot, self.method_type(), SNAPSHOT_VERSION)?;
        Ok(())
    }
}
