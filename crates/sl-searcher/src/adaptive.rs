//! Hyperband-style searches: a tournament of halving brackets of decreasing
//! depth.

use sl_types::{
    AdaptiveAshaConfig, AdaptiveConfig, AdaptiveSimpleConfig, AsyncHalvingConfig, SyncHalvingConfig,
};
use tracing::info;

use crate::async_halving::AsyncHalvingSearch;
use crate::method::{Objective, SearchMethod, SearchMethodType};
use crate::sync_halving::SyncHalvingSearch;
use crate::tournament::TournamentSearch;

/// Split `total` evenly, at least one each, remainder to the first bracket.
fn split_evenly(total: u64, brackets: usize) -> Vec<u64> {
    let share = (total / brackets as u64).max(1);
    let mut shares = vec![share; brackets];
    shares[0] += total.saturating_sub(share * brackets as u64);
    shares
}

/// Trials per bracket, summing to exactly `max_trials`.
///
/// Every bracket gets one trial and the rest are split by the weights
/// `divisor^(r-1) / r`, so deeper brackets start more trials. The rounding
/// remainder goes to the first (deepest) bracket. With fewer trials than
/// brackets only the deepest `max_trials` brackets are kept.
pub fn bracket_trials(max_trials: usize, divisor: f64, bracket_rungs: &[usize]) -> Vec<usize> {
    let brackets = bracket_rungs.len().min(max_trials);
    let weights: Vec<f64> = bracket_rungs[..brackets]
        .iter()
        .map(|rungs| divisor.powi(*rungs as i32 - 1) / *rungs as f64)
        .collect();
    let total: f64 = weights.iter().sum();
    let spare = max_trials - brackets;
    let mut trials: Vec<usize> = weights
        .iter()
        .map(|w| 1 + (spare as f64 * w / total).floor() as usize)
        .collect();
    let assigned: usize = trials.iter().sum();
    if let Some(first) = trials.first_mut() {
        *first += max_trials.saturating_sub(assigned);
    }
    trials
}

/// Concurrency per bracket. A zero limit gives every bracket one slot per
/// `divisor` trials of the smallest bracket, and at least one.
pub fn bracket_concurrency(
    max_concurrent_trials: usize,
    divisor: f64,
    bracket_trials: &[usize],
) -> Vec<usize> {
    if bracket_trials.is_empty() {
        return Vec::new();
    }
    if max_concurrent_trials == 0 {
        let smallest = bracket_trials.iter().copied().min().unwrap_or(1);
        let slots = ((smallest as f64 / divisor).floor() as usize).max(1);
        return vec![slots; bracket_trials.len()];
    }
    split_evenly(max_concurrent_trials as u64, bracket_trials.len())
        .into_iter()
        .map(|slots| slots as usize)
        .collect()
}

/// Synchronous halving brackets sharing one training budget.
pub fn new_adaptive_search(config: &AdaptiveConfig, objective: Objective) -> TournamentSearch {
    let rungs = config.mode.bracket_rungs(config.max_rungs);
    let budgets = split_evenly(config.budget.units, rungs.len());
    let brackets: Vec<Box<dyn SearchMethod>> = rungs
        .iter()
        .zip(&budgets)
        .map(|(num_rungs, budget)| {
            info!("Adaptive bracket with {num_rungs} rungs and a budget of {budget} units");
            Box::new(SyncHalvingSearch::new(
                SyncHalvingConfig::with_budget(
                    *num_rungs,
                    config.divisor,
                    config.max_length,
                    config.budget.with_units(*budget),
                ),
                objective.clone(),
            )) as Box<dyn SearchMethod>
        })
        .collect();
    TournamentSearch::new(SearchMethodType::Adaptive, config.max_length.unit, brackets)
}

/// Synchronous halving brackets sharing a trial count.
pub fn new_adaptive_simple_search(
    config: &AdaptiveSimpleConfig,
    objective: Objective,
) -> TournamentSearch {
    let mut rungs = config.mode.bracket_rungs(config.max_rungs);
    let trials = bracket_trials(config.max_trials, config.divisor, &rungs);
    rungs.truncate(trials.len());
    let brackets: Vec<Box<dyn SearchMethod>> = rungs
        .iter()
        .zip(&trials)
        .map(|(num_rungs, num_trials)| {
            info!("Adaptive bracket with {num_rungs} rungs and {num_trials} trials");
            Box::new(SyncHalvingSearch::new(
                SyncHalvingConfig::with_num_trials(
                    *num_rungs,
                    config.divisor,
                    config.max_length,
                    *num_trials,
                ),
                objective.clone(),
            )) as Box<dyn SearchMethod>
        })
        .collect();
    TournamentSearch::new(
        SearchMethodType::AdaptiveSimple,
        config.max_length.unit,
        brackets,
    )
}

/// Asynchronous halving brackets sharing a trial count and a concurrency
/// limit. Explicit `bracket_rungs` take precedence over the mode.
pub fn new_adaptive_asha_search(config: &AdaptiveAshaConfig, objective: Objective) -> TournamentSearch {
    let mut rungs = if config.bracket_rungs.is_empty() {
        config.mode.bracket_rungs(config.max_rungs)
    } else {
        config.bracket_rungs.clone()
    };
    let trials = bracket_trials(config.max_trials, config.divisor, &rungs);
    rungs.truncate(trials.len());
    let slots = bracket_concurrency(config.max_concurrent_trials, config.divisor, &trials);
    let brackets: Vec<Box<dyn SearchMethod>> = rungs
        .iter()
        .zip(trials.iter().zip(&slots))
        .map(|(num_rungs, (max_trials, slots))| {
            info!(
                "Adaptive ASHA bracket with {num_rungs} rungs, {max_trials} trials, {slots} at a time"
            );
            Box::new(AsyncHalvingSearch::new(
                AsyncHalvingConfig::new(*num_rungs, config.divisor, config.max_length, *max_trials)
                    .with_max_concurrent_trials(*slots),
                objective.clone(),
            )) as Box<dyn SearchMethod>
        })
        .collect();
    TournamentSearch::new(
        SearchMethodType::AdaptiveAsha,
        config.max_length.unit,
        brackets,
    )
}
