//! Train exactly one trial to completion.

use sl_types::{
    Create, Operation, RequestId, SingleConfig, SlResult, Unit, Validate, ValidationMetrics,
};
use tracing::info;

use crate::context::Context;
use crate::method::{SearchMethod, SearchMethodType};
use crate::sample::sample_all;

/// One trial with configured or sampled hyperparameters. Holds no state
/// beyond its configuration.
#[derive(Debug, Clone)]
pub struct SingleSearch {
    config: SingleConfig,
}

impl SingleSearch {
    pub fn new(config: SingleConfig) -> Self {
        Self { config }
    }
}

impl SearchMethod for SingleSearch {
    fn method_type(&self) -> SearchMethodType {
        SearchMethodType::Single
    }

    fn unit(&self) -> Unit {
        self.config.max_length.unit
    }

    fn initial_operations(&mut self, ctx: &mut Context<'_>) -> SlResult<Vec<Operation>> {
        let hparams = match &self.config.hyperparameters {
            Some(hparams) => hparams.clone(),
            None => sample_all(ctx.space, ctx.rng),
        };
        let create = Create::new(ctx.rng, hparams);
        let request_id = create.request_id;
        info!("Single search training trial {request_id} for {}", self.config.max_length);
        Ok(vec![
            create.into(),
            Operation::train(request_id, self.config.max_length),
            Operation::validate(request_id),
        ])
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
        _ctx: &mut Context<'_>,
        _request_id: RequestId,
    ) -> SlResult<Vec<Operation>> {
        Ok(vec![Operation::shutdown()])
    }

    fn expected_units(&self) -> f64 {
        self.config.max_length.units as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SearchRng;
    use serde_json::json;
    use sl_types::{ExitedReason, Hyperparameters, Length, ParameterValue, SearchSpace};

    fn space() -> SearchSpace {
        SearchSpace::new().add_float("lr", 0.001, 0.1)
    }

    #[test]
    fn emits_create_train_validate_then_close_and_shutdown() {
        let space = space();
        let mut rng = SearchRng::seed_from_u64(1);
        let mut ctx = Context::new(&mut rng, &space);
        let mut search = SingleSearch::new(SingleConfig::new(Length::batches(100)));

        let ops = search.initial_operations(&mut ctx).unwrap();
        assert_eq!(ops.len(), 3);
        let id = match &ops[0] {
            Operation::Create(create) => {
                assert!(create.hparams.contains_key("lr"));
                create.request_id
            }
            other => panic!("expected create, got {other}"),
        };
        assert_eq!(ops[1], Operation::train(id, Length::batches(100)));
        assert_eq!(ops[2], Operation::validate(id));

        let validate = Validate { request_id: id };
        let metrics = ValidationMetrics::new().with_metric("loss", 0.1);
        let ops = search
            .validation_completed(&mut ctx, id, &validate, &metrics)
            .unwrap();
        assert_eq!(ops, vec![Operation::close(id)]);
        assert_eq!(search.trial_closed(&mut ctx, id).unwrap(), vec![Operation::shutdown()]);
    }

    #[test]
    fn configured_hyperparameters_are_used() {
        let space = space();
        let mut rng = SearchRng::seed_from_u64(1);
        let mut ctx = Context::new(&mut rng, &space);
        let mut hparams = Hyperparameters::new();
        hparams.insert("lr".into(), ParameterValue::Json(json!(0.5)));
        let mut search =
            SingleSearch::new(SingleConfig::new(Length::batches(10)).with_hyperparameters(hparams.clone()));

        let ops = search.initial_operations(&mut ctx).unwrap();
        match &ops[0] {
            Operation::Create(create) => assert_eq!(create.hparams, hparams),
            other => panic!("expected create, got {other}"),
        }
    }

    #[test]
    fn early_exit_fails_the_search() {
        let space = space();
        let mut rng = SearchRng::seed_from_u64(1);
        let mut ctx = Context::new(&mut rng, &space);
        let mut search = SingleSearch::new(SingleConfig::new(Length::batches(10)));
        let ops = search.initial_operations(&mut ctx).unwrap();
        let id = ops[0].request_id().unwrap();
        let ops = search
            .trial_exited_early(&mut ctx, id, ExitedReason::Errored)
            .unwrap();
        assert_eq!(ops, vec![Operation::shutdown_failure()]);
    }

    #[test]
    fn progress_is_fraction_of_max_length() {
        let search = SingleSearch::new(SingleConfig::new(Length::batches(200)));
        assert_eq!(search.progress(0.0), 0.0);
        assert_eq!(search.progress(50.0), 0.25);
        assert_eq!(search.progress(400.0), 1.0);
    }
}
