//! Runs several independent sub-searches side by side as one search.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use sl_types::{
    Checkpoint, CheckpointMetrics, ExitedReason, Operation, RequestId, SearcherError, SlResult,
    SnapshotError, Train, Unit, Validate, ValidationMetrics,
};
use tracing::{debug, info};

use crate::context::Context;
use crate::method::{SearchMethod, SearchMethodType};
use crate::snapshot::MethodSnapshot;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TournamentState {
    trial_table: BTreeMap<RequestId, usize>,
    sub_search_shutdowns: Vec<bool>,
    shutdown_sent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TournamentSnapshot {
    state: TournamentState,
    sub_searches: Vec<Option<MethodSnapshot>>,
}

/// Owns one sub-search per bracket and routes every trial event to the
/// bracket that created the trial.
///
/// Sub-search shutdowns are absorbed; a single shutdown is emitted once every
/// bracket is done. A failing bracket shuts the whole search down at once.
#[derive(Debug)]
pub struct TournamentSearch {
    method_type: SearchMethodType,
    unit: Unit,
    sub_searches: Vec<Box<dyn SearchMethod>>,
    state: TournamentState,
}

impl TournamentSearch {
    pub fn new(
        method_type: SearchMethodType,
        unit: Unit,
        sub_searches: Vec<Box<dyn SearchMethod>>,
    ) -> Self {
        let brackets = sub_searches.len();
        Self {
            method_type,
            unit,
            sub_searches,
            state: TournamentState {
                sub_search_shutdowns: vec![false; brackets],
                ..TournamentState::default()
            },
        }
    }

    pub fn num_brackets(&self) -> usize {
        self.sub_searches.len()
    }

    fn bracket_of(&self, request_id: RequestId) -> SlResult<usize> {
        self.state
            .trial_table
            .get(&request_id)
            .copied()
            .ok_or_else(|| SearcherError::UnknownRequest { request_id }.into())
    }

    /// Record new trials and fold sub-search shutdowns into one.
    fn mark_created(&mut self, bracket: usize, ops: Vec<Operation>) -> Vec<Operation> {
        let mut routed = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                Operation::Create(ref create) => {
                    self.state.trial_table.insert(create.request_id, bracket);
                    routed.push(op);
                }
                Operation::Shutdown(shutdown) if shutdown.failure => {
                    if !self.state.shutdown_sent {
                        info!("Bracket {bracket} failed, shutting down the search");
                        self.state.shutdown_sent = true;
                        routed.push(op);
                    }
                }
                Operation::Shutdown(_) => {
                    debug!("Bracket {bracket} finished");
                    self.state.sub_search_shutdowns[bracket] = true;
                }
                _ => routed.push(op),
            }
        }
        if !self.state.shutdown_sent && self.state.sub_search_shutdowns.iter().all(|done| *done) {
            info!("All {} brackets finished", self.sub_searches.len());
            self.state.shutdown_sent = true;
            routed.push(Operation::shutdown());
        }
        routed
    }
}

impl SearchMethod for TournamentSearch {
    fn method_type(&self) -> SearchMethodType {
        self.method_type
    }

    fn unit(&self) -> Unit {
        self.unit
    }

    fn initial_operations(&mut self, ctx: &mut Context<'_>) -> SlResult<Vec<Operation>> {
        let mut ops = Vec::new();
        for bracket in 0..self.sub_searches.len() {
            let sub_ops = self.sub_searches[bracket].initial_operations(ctx)?;
            ops.extend(self.mark_created(bracket, sub_ops));
        }
        Ok(ops)
    }

    fn trial_created(
        &mut self,
        ctx: &mut Context<'_>,
        request_id: RequestId,
    ) -> SlResult<Vec<Operation>> {
        let bracket = self.bracket_of(request_id)?;
        let ops = self.sub_searches[bracket].trial_created(ctx, request_id)?;
        Ok(self.mark_created(bracket, ops))
    }

    fn train_completed(
        &mut self,
        ctx: &mut Context<'_>,
        request_id: RequestId,
        train: &Train,
    ) -> SlResult<Vec<Operation>> {
        let bracket = self.bracket_of(request_id)?;
        let ops = self.sub_searches[bracket].train_completed(ctx, request_id, train)?;
        Ok(self.mark_created(bracket, ops))
    }

    fn checkpoint_completed(
        &mut self,
        ctx: &mut Context<'_>,
        request_id: RequestId,
        checkpoint: &Checkpoint,
        metrics: &CheckpointMetrics,
    ) -> SlResult<Vec<Operation>> {
        let bracket = self.bracket_of(request_id)?;
        let ops =
            self.sub_searches[bracket].checkpoint_completed(ctx, request_id, checkpoint, metrics)?;
        Ok(self.mark_created(bracket, ops))
    }

    fn validation_completed(
        &mut self,
        ctx: &mut Context<'_>,
        request_id: RequestId,
        validate: &Validate,
        metrics: &ValidationMetrics,
    ) -> SlResult<Vec<Operation>> {
        let bracket = self.bracket_of(request_id)?;
        let ops =
            self.sub_searches[bracket].validation_completed(ctx, request_id, validate, metrics)?;
        Ok(self.mark_created(bracket, ops))
    }

    fn trial_closed(
        &mut self,
        ctx: &mut Context<'_>,
        request_id: RequestId,
    ) -> SlResult<Vec<Operation>> {
        let bracket = self.bracket_of(request_id)?;
        let ops = self.sub_searches[bracket].trial_closed(ctx, request_id)?;
        Ok(self.mark_created(bracket, ops))
    }

    fn trial_exited_early(
        &mut self,
        ctx: &mut Context<'_>,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> SlResult<Vec<Operation>> {
        let bracket = self.bracket_of(request_id)?;
        let ops = self.sub_searches[bracket].trial_exited_early(ctx, request_id, reason)?;
        Ok(self.mark_created(bracket, ops))
    }

    /// Planned work of every bracket together, so progress weighs brackets
    /// by their size.
    fn expected_units(&self) -> f64 {
        self.sub_searches.iter().map(|sub| sub.expected_units()).sum()
    }

    fn snapshot(&self) -> SlResult<Option<MethodSnapshot>> {
        let sub_searches = self
            .sub_searches
            .iter()
            .map(|sub| sub.snapshot())
            .collect::<SlResult<Vec<_>>>()?;
        let snapshot = TournamentSnapshot {
            state: self.state.clone(),
            sub_searches,
        };
        MethodSnapshot::encode(self.method_type, SNAPSHOT_VERSION, &snapshot).map(Some)
    }

    fn restore(&mut self, snapshot: Option<&MethodSnapshot>) -> SlResult<()> {
        let snapshot: TournamentSnapshot =
            MethodSnapshot::decode(snapshot, self.method_type, SNAPSHOT_VERSION)?;
        if snapshot.sub_searches.len() != self.sub_searches.len()
            || snapshot.state.sub_search_shutdowns.len() != self.sub_searches.len()
        {
            return Err(SnapshotError::MethodMismatch {
                expected: format!("{} with {} brackets", self.method_type, self.sub_searches.len()),
                found: format!(
                    "{} with {} brackets",
                    self.method_type,
                    snapshot.sub_searches.len()
                ),
            }
            .into());
        }
        for (sub, sub_snapshot) in self.sub_searches.iter_mut().zip(&snapshot.sub_searches) {
            sub.restore(sub_snapshot.as_ref())?;
        }
        self.state = snapshot.state;
        Ok(())
    }
}
