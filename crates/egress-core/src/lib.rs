//! Floor-field cellular-automaton evacuation model.
//!
//! A [`Simulation`] advances a crowd of agents over a discrete grid one
//! synchronous step at a time: a per-exit floor field guides movement,
//! contested cells are settled by a game-theoretic resolver, and volunteer
//! agents relocate movable obstacles out of evacuation paths. Given the same
//! configuration and seed, runs are byte-for-byte reproducible.

use thiserror::Error;

pub mod agent;
pub mod field;
pub mod game;
pub mod grid;
pub mod scenario;
pub mod sim;

pub use agent::{Agent, AgentId, PayoffHistory, Role, Strategy};
pub use field::{EXIT_WEIGHT, ExitField, FloorField, INIT_WEIGHT, OBSTACLE_WEIGHT};
pub use game::{GameParams, LOGIT_CLAMP, defect_probability};
pub use grid::{CellState, Coord, Exit, Grid, MOORE_OFFSETS, Obstacle};
pub use scenario::{CrowdConfig, Scenario, ScenarioError};
pub use sim::{ConflictResolver, Simulation, StepSummary, Timestep};

/// Errors raised when building or mutating a simulation.
#[derive(Debug, Error)]
pub enum SimError {
    /// Structurally invalid construction input.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Configuration file problem.
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    /// Coordinate outside the grid.
    #[error("coordinate ({x}, {y}) outside the {width}x{height} grid")]
    Bounds {
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
    /// Scene structure violated: bad edit, or a broken world invariant.
    #[error("topology: {0}")]
    Topology(String),
}
