// Searchlight simulator
// Drives a searcher against a fake trial executor with a synthetic objective

pub mod objective;
pub mod simulator;

use serde::{Deserialize, Serialize};
use sl_types::{SearchSpace, SearcherConfig};

pub use objective::SyntheticObjective;
pub use simulator::{Simulation, SimulationConfig, SimulationReport};

/// Everything needed to run one simulated search, as read from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationInput {
    pub searcher: SearcherConfig,
    pub hyperparameters: SearchSpace,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl SimulationInput {
    pub fn from_json_str(json: &str) -> sl_types::SlResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
