use anyhow::Context;
use sl_sim::{Simulation, SimulationInput};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SEARCHLIGHT_CONFIG").ok())
        .context("usage: sl-sim <config.json> (or set SEARCHLIGHT_CONFIG)")?;

    let json = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let input = SimulationInput::from_json_str(&json).with_context(|| format!("parsing {path}"))?;
    let mut simulation = Simulation::from_input(input)?;
    let report = simulation.run()?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.stalled {
        anyhow::bail!("search stalled after {} events", report.events);
    }
    Ok(())
}
