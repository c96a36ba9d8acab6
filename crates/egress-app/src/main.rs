//! Command-line driver for the egress evacuation simulator.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use egress_core::{CrowdConfig, Role, Scenario, Simulation, StepSummary};
use serde_json::json;
use tracing::{error, info, warn};

/// Floor-field cellular-automaton evacuation simulator.
#[derive(Debug, Parser)]
#[command(name = "egress", version, about = "Simulate pedestrian evacuation on a discrete grid")]
struct Cli {
    /// Scenario file: grid, exits, obstacles, field coefficients.
    scenario: PathBuf,
    /// Agent file: population and behavioral parameters.
    agents: PathBuf,
    /// RNG seed; the same seed replays the same run byte for byte.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Step limit; defaults to the agent file's MAX_TRAVEL, then 10000.
    #[arg(long)]
    max_steps: Option<u64>,
    /// Directory receiving one snapshot file per step.
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// Rewrite the scenario here after the run, obstacles at their final
    /// positions.
    #[arg(long)]
    save_scenario: Option<PathBuf>,
    /// Write a JSON run report here.
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();
    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let scenario_text = fs::read_to_string(&cli.scenario)
        .with_context(|| format!("reading scenario file {}", cli.scenario.display()))?;
    let scenario = Scenario::parse(&scenario_text)
        .with_context(|| format!("parsing scenario file {}", cli.scenario.display()))?;
    let crowd_text = fs::read_to_string(&cli.agents)
        .with_context(|| format!("reading agent file {}", cli.agents.display()))?;
    let crowd = CrowdConfig::parse(&crowd_text)
        .with_context(|| format!("parsing agent file {}", cli.agents.display()))?;

    let max_steps = cli.max_steps.unwrap_or(if crowd.max_travel > 0 {
        u64::from(crowd.max_travel)
    } else {
        10_000
    });
    let mut sim = Simulation::new(scenario, crowd, cli.seed).context("building simulation")?;
    if let Some(dir) = &cli.snapshot {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating snapshot directory {}", dir.display()))?;
    }
    info!(
        seed = cli.seed,
        agents = sim.agents().len(),
        exits = sim.exits().len(),
        obstacles = sim.obstacles().len(),
        resolver = ?sim.resolver(),
        "starting evacuation run"
    );

    let mut steps = 0u64;
    while sim.remaining() > 0 && steps < max_steps {
        let summary = sim.step();
        steps += 1;
        info!(
            "Timestep {}: {} agent(s) remaining",
            summary.timestep.0, summary.remaining
        );
        if let Some(dir) = &cli.snapshot {
            write_snapshot(dir, &sim, &summary)?;
        }
        if let Err(violation) = sim.check_invariants() {
            error!(
                "invariant violation at timestep {}: {violation}",
                summary.timestep.0
            );
            return Ok(ExitCode::from(2));
        }
    }

    if sim.remaining() == 0 {
        info!(
            "all {} agent(s) evacuated after {} timestep(s)",
            sim.agents().len(),
            sim.timestep().0
        );
    } else {
        warn!(
            remaining = sim.remaining(),
            steps, "step limit reached before full evacuation"
        );
    }

    if let Some(path) = &cli.save_scenario {
        fs::write(path, sim.scenario_snapshot().save())
            .with_context(|| format!("saving scenario to {}", path.display()))?;
    }
    if let Some(path) = &cli.report {
        let report = build_report(&sim, steps);
        fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("writing report to {}", path.display()))?;
    }
    Ok(ExitCode::SUCCESS)
}

/// One plain-text snapshot per step: a `T W H n_agents` header, one line per
/// visible agent (`id x y role`), then one line per obstacle (`x y movable`).
fn write_snapshot(dir: &Path, sim: &Simulation, summary: &StepSummary) -> Result<()> {
    let mut out = String::new();
    out.push_str(&format!(
        "{} {} {} {}\n",
        summary.timestep.0,
        sim.grid().width(),
        sim.grid().height(),
        summary.remaining
    ));
    for (id, agent) in sim.agents().iter().enumerate() {
        if !agent.visible {
            continue;
        }
        let role = match agent.role {
            Role::Evacuee => "evacuee",
            Role::Volunteer { .. } => "volunteer",
        };
        out.push_str(&format!(
            "{id} {} {} {role}\n",
            agent.position.x, agent.position.y
        ));
    }
    for obstacle in sim.obstacles() {
        out.push_str(&format!(
            "{} {} {}\n",
            obstacle.position.x,
            obstacle.position.y,
            u8::from(obstacle.movable)
        ));
    }
    let path = dir.join(format!("step_{:05}.txt", summary.timestep.0));
    fs::write(&path, out).with_context(|| format!("writing snapshot {}", path.display()))
}

fn build_report(sim: &Simulation, steps: u64) -> serde_json::Value {
    let mut exit_usage = vec![0usize; sim.exits().len()];
    for agent in sim.agents() {
        if let Some(exit) = agent.exited_via {
            exit_usage[exit] += 1;
        }
    }
    json!({
        "steps": steps,
        "timestep": sim.timestep().0,
        "initial_agents": sim.agents().len(),
        "exited": sim.exited_count(),
        "remaining": sim.remaining(),
        "exit_usage": exit_usage,
        "logit_clamp_events": sim.clamp_events(),
        "seed": sim.seed(),
    })
}
