//! Exhaustive search over the discretized search space.

use serde::{Deserialize, Serialize};
use sl_types::{
    Create, ExitedReason, GridConfig, Hyperparameters, Operation, RequestId, SlResult, Unit,
    Validate, ValidationMetrics,
};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::method::{SearchMethod, SearchMethodType};
use crate::sample::grid;
use crate::snapshot::MethodSnapshot;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct GridState {
    combos: Vec<Hyperparameters>,
    cursor: usize,
    pending_trials: usize,
}

/// One trial per grid point, created in enumeration order.
#[derive(Debug, Clone)]
pub struct GridSearch {
    config: GridConfig,
    state: GridState,
}

impl GridSearch {
    pub fn new(config: GridConfig) -> Self {
        Self {
            config,
            state: GridState::default(),
        }
    }

    fn next_trial(&mut self, ctx: &mut Context<'_>) -> Vec<Operation> {
        let Some(hparams) = self.state.combos.get(self.state.cursor).cloned() else {
            return Vec::new();
        };
        self.state.cursor += 1;
        self.state.pending_trials += 1;
        let create = Create::new(ctx.rng, hparams);
        let request_id = create.request_id;
        debug!(
            "Grid search created trial {request_id} for point {}/{}",
            self.state.cursor,
            self.state.combos.len()
        );
        vec![
            create.into(),
            Operation::train(request_id, self.config.max_length),
            Operation::validate(request_id),
        ]
    }
}

impl SearchMethod for GridSearch {
    fn method_type(&self) -> SearchMethodType {
        SearchMethodType::Grid
    }

    fn unit(&self) -> Unit {
        self.config.max_length.unit
    }

    fn initial_operations(&mut self, ctx: &mut Context<'_>) -> SlResult<Vec<Operation>> {
        self.state.combos = grid(ctx.space, &self.config.divisions)?;
        let initial = match self.config.max_concurrent_trials {
            0 => self.state.combos.len(),
            n => n.min(self.state.combos.len()),
        };
        info!(
            "Grid search over {} points, {} at a time",
            self.state.combos.len(),
            initial
        );
        let mut ops = Vec::new();
        for _ in 0..initial {
            ops.extend(self.next_trial(ctx));
        }
        Ok(ops)
    }

    fn validation_completed(
        &mut self,
        _ctx: &mut Context<'_>,
        request_id: RequestId,
        _validate: &Validate,
        _metrics: &ValidationMetrics,
    ) -> SlResult<Vec<Operation>> {
        Ok(vec![Operation::close(request_id)])
    }

    fn trial_closed(
        &mut self,
        ctx: &mut Context<'_>,
        _request_id: RequestId,
    ) -> SlResult<Vec<Operation>> {
        self.state.pending_trials = self.state.pending_trials.saturating_sub(1);
        let ops = self.next_trial(ctx);
        if !ops.is_empty() {
            return Ok(ops);
        }
        if self.state.pending_trials == 0 {
            info!("Grid search finished all {} points", self.state.combos.len());
            return Ok(vec![Operation::shutdown()]);
        }
        Ok(Vec::new())
    }

    fn trial_exited_early(
        &mut self,
        _ctx: &mut Context<'_>,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> SlResult<Vec<Operation>> {
        warn!("Grid search trial {request_id} exited early: {reason}");
        Ok(Vec::new())
    }

    fn expected_units(&self) -> f64 {
        self.state.combos.len() as f64 * self.config.max_length.units as f64
    }

    fn snapshot(&self) -> SlResult<Option<MethodSnapshot>> {
        MethodSnapshot::encode(self.method_type(), SNAPSHOT_VERSION, &self.state).map(Some)
    }

    fn restore(&mut self, snapshot: Option<&MethodSnapshot>) -> SlResult<()> {
        self.state = MethodSnapshot::decode(snapshot, self.method_type(), SNAPSHOT_VERSION)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SearchRng;
    use serde_json::json;
    use sl_types::{Length, SearchSpace};

    fn space() -> SearchSpace {
        SearchSpace::new()
            .add_int("layers", 1, 3)
            .add_choice("optimizer", vec![json!("adam"), json!("sgd")])
    }

    fn config() -> GridConfig {
        GridConfig::new(Length::batches(10)).with_divisions("layers", 3)
    }

    fn created(ops: &[Operation]) -> Vec<(RequestId, Hyperparameters)> {
        ops.iter()
            .filter_map(|op| match op {
                Operation::Create(create) => Some((create.request_id, create.hparams.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn one_trial_per_point() {
        let space = space();
        let mut rng = SearchRng::seed_from_u64(0);
        let mut ctx = Context::new(&mut rng, &space);
        let mut search = GridSearch::new(config());

        let trials = created(&search.initial_operations(&mut ctx).unwrap());
        assert_eq!(trials.len(), 6);
        let expected = grid(&space, &config().divisions).unwrap();
        let hparams: Vec<Hyperparameters> = trials.iter().map(|(_, h)| h.clone()).collect();
        assert_eq!(hparams, expected);

        let (last, rest) = trials.split_last().unwrap();
        for (id, _) in rest {
            assert!(search.trial_closed(&mut ctx, *id).unwrap().is_empty());
        }
        assert_eq!(
            search.trial_closed(&mut ctx, last.0).unwrap(),
            vec![Operation::shutdown()]
        );
        assert_eq!(search.progress(60.0), 1.0);
    }

    #[test]
    fn trickle_walks_the_grid_in_order() {
        let space = space();
        let mut rng = SearchRng::seed_from_u64(0);
        let mut ctx = Context::new(&mut rng, &space);
        let mut search = GridSearch::new(config().with_max_concurrent_trials(2));

        let mut live = created(&search.initial_operations(&mut ctx).unwrap());
        assert_eq!(live.len(), 2);
        let mut seen = live.iter().map(|(_, h)| h.clone()).collect::<Vec<_>>();
        let mut shutdown = false;
        while let Some((id, _)) = live.pop() {
            let ops = search.trial_closed(&mut ctx, id).unwrap();
            shutdown |= ops.contains(&Operation::shutdown());
            let next = created(&ops);
            seen.extend(next.iter().map(|(_, h)| h.clone()));
            live.extend(next);
        }
        assert!(shutdown);
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn early_exit_counts_as_finished_point() {
        let space = space();
        let mut rng = SearchRng::seed_from_u64(0);
        let mut ctx = Context::new(&mut rng, &space);
        let mut search = GridSearch::new(config().with_max_concurrent_trials(1));

        let first = created(&search.initial_operations(&mut ctx).unwrap());
        let ops = search
            .trial_exited_early(&mut ctx, first[0].0, ExitedReason::Errored)
            .unwrap();
        assert!(ops.is_empty());
        let next = created(&search.trial_closed(&mut ctx, first[0].0).unwrap());
        assert_eq!(next.len(), 1);
        assert_eq!(search.state.cursor, 2);
    }

    #[test]
    fn missing_divisions_fail_initialization() {
        let space = SearchSpace::new().add_float("dropout", 0.0, 0.5);
        let mut rng = SearchRng::seed_from_u64(0);
        let mut ctx = Context::new(&mut rng, &space);
        let mut search = GridSearch::new(GridConfig::new(Length::batches(10)));
        assert!(search.initial_operations(&mut ctx).is_err());
    }
}
