//! Independent random draws from the search space.

use serde::{Deserialize, Serialize};
use sl_types::{
    Create, ExitedReason, Operation, RandomConfig, RequestId, SlResult, Unit, Validate,
    ValidationMetrics,
};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::method::{SearchMethod, SearchMethodType};
use crate::sample::sample_all;
use crate::snapshot::MethodSnapshot;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RandomState {
    created_trials: usize,
    pending_trials: usize,
}

/// Creates `max_trials` trials, at most `max_concurrent_trials` at a time.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    config: RandomConfig,
    state: RandomState,
}

impl RandomSearch {
    pub fn new(config: RandomConfig) -> Self {
        Self {
            config,
            state: RandomState::default(),
        }
    }

    fn concurrency(&self) -> usize {
        match self.config.max_concurrent_trials {
            0 => self.config.max_trials,
            n => n.min(self.config.max_trials),
        }
    }

    fn create_trial(&mut self, ctx: &mut Context<'_>) -> Vec<Operation> {
        let hparams = sample_all(ctx.space, ctx.rng);
        let create = Create::new(ctx.rng, hparams);
        let request_id = create.request_id;
        self.state.created_trials += 1;
        self.state.pending_trials += 1;
        debug!(
            "Random search created trial {request_id} ({}/{})",
            self.state.created_trials, self.config.max_trials
        );
        vec![
            create.into(),
            Operation::train(request_id, self.config.max_length),
            Operation::validate(request_id),
        ]
    }
}

impl SearchMethod for RandomSearch {
    fn method_type(&self) -> SearchMethodType {
        SearchMethodType::Random
    }

    fn unit(&self) -> Unit {
        self.config.max_length.unit
    }

    fn initial_operations(&mut self, ctx: &mut Context<'_>) -> SlResult<Vec<Operation>> {
        info!(
            "Random search starting {} of {} trials",
            self.concurrency(),
            self.config.max_trials
        );
        let mut ops = Vec::new();
        for _ in 0..self.concurrency() {
            ops.extend(self.create_trial(ctx));
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
        if self.state.created_trials < self.config.max_trials {
            return Ok(self.create_trial(ctx));
        }
        if self.state.pending_trials == 0 {
            info!("Random search finished {} trials", self.state.created_trials);
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
        warn!("Random search trial {request_id} exited early: {reason}");
        if reason == ExitedReason::InvalidHyperparameters {
            self.state.created_trials = self.state.created_trials.saturating_sub(1);
        }
        Ok(Vec::new())
    }

    fn expected_units(&self) -> f64 {
        self.config.max_trials as f64 * self.config.max_length.units as f64
    }

    fn snapshot(&self) -> SlResult<Option<MethodSnapshot>> {
        MethodSnapshot::encode(self.method_type(), SNAPSHOT_VERSION, &self.state).map(Some)
    }

    fn restore(&mut self, snapshot: Option<&MethodSnapshot>) -> SlResult<()> {
        self.state = MethodSnapshot::decode(snapshot, self.method_type(), SNAPSHOT_VERSION)?;
        Ok(())
    }
}
