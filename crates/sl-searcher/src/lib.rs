//! # sl-searcher
//!
//! The search-method engine for Searchlight.
//!
//! A [`SearchMethod`] is an event-driven state machine: the trial executor
//! reports lifecycle events (trial created, training/validation/checkpoint
//! completed, trial closed or exited early) and the method answers with
//! [`Operation`](sl_types::Operation)s to carry out. Provides single, random
//! and grid search, synchronous and asynchronous successive halving, the
//! Hyperband-style adaptive wrappers and population-based training, plus the
//! [`Searcher`] driver that owns the RNG and supports snapshot/restore.

mod adaptive;
mod async_halving;
mod context;
mod grid;
mod method;
mod pbt;
mod random;
mod sample;
mod searcher;
mod single;
mod snapshot;
mod sync_halving;
mod tournament;

pub use adaptive::{
    bracket_concurrency, bracket_trials, new_adaptive_asha_search, new_adaptive_search,
    new_adaptive_simple_search,
};
pub use async_halving::AsyncHalvingSearch;
pub use context::{Context, RngState, SearchRng};
pub use grid::GridSearch;
pub use method::{new_search_method, Objective, SearchMethod, SearchMethodType};
pub use pbt::{PbtSearch, PopulationMember};
pub use random::RandomSearch;
pub use sample::{explore, grid, sample_all, sample_one};
pub use searcher::{BestValidation, Searcher, SearcherState};
pub use single::SingleSearch;
pub use snapshot::MethodSnapshot;
pub use sync_halving::SyncHalvingSearch;
pub use tournament::TournamentSearch;
