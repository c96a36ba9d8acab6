//! Scenario and crowd configuration: parsing, validation, persistence.
//!
//! Both files are whitespace-delimited key-value streams. Saving emits the
//! exact same format, so `parse(save(x)) == x`.

use std::collections::{HashSet, VecDeque};
use std::fmt::Write as _;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grid::{Coord, Exit};

/// Errors raised while reading or validating configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScenarioError {
    /// Malformed token stream.
    #[error("parse: {0}")]
    Parse(String),
    /// Well-formed input describing an impossible scene.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Static scene description: grid, exits, obstacles, field coefficients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    pub width: i32,
    pub height: i32,
    pub cell_size: (f64, f64),
    pub exits: Vec<Exit>,
    pub movable: Vec<Coord>,
    pub immovable: Vec<Coord>,
    /// Diagonal step weight of the floor field.
    pub lambda: f64,
    /// Crowd-avoidance coefficient of the dynamic field.
    pub crowd_avoidance: f64,
}

/// Agent population and behavioral parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrowdConfig {
    pub agents: Vec<Coord>,
    pub panic_prob: f64,
    /// Initial (yielder, volunteer) strategy weights.
    pub init_strategy: (f64, f64),
    pub rationality: f64,
    pub herding: f64,
    pub interaction_radius_o: f64,
    pub interaction_radius_v: f64,
    pub critical_density: f64,
    /// Recruitment gain: an evacuee blocked by a movable obstacle volunteers
    /// with probability `min(1, ka * p_volunteer)`.
    pub ka: f64,
    /// Drop-off scoring weight on distance from exits.
    pub cc: f64,
    /// Drop-off scoring weight on obstacle clustering.
    pub rc: f64,
    pub min_dist_from_exits: f64,
    pub max_travel: u32,
    pub reward_cooperate: f64,
    pub cost_conflict: f64,
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            panic_prob: 0.0,
            init_strategy: (0.5, 0.5),
            rationality: 1.0,
            herding: 0.0,
            interaction_radius_o: 3.0,
            interaction_radius_v: 5.0,
            critical_density: 0.5,
            ka: 1.0,
            cc: 1.0,
            rc: 1.0,
            min_dist_from_exits: 3.0,
            max_travel: 0,
            reward_cooperate: 0.5,
            cost_conflict: 1.0,
        }
    }
}

/// Cursor over a whitespace-delimited token stream.
struct Tokens<'a> {
    inner: std::str::SplitWhitespace<'a>,
    consumed: usize,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            inner: text.split_whitespace(),
            consumed: 0,
        }
    }

    fn try_next(&mut self) -> Option<&'a str> {
        let token = self.inner.next();
        if token.is_some() {
            self.consumed += 1;
        }
        token
    }

    fn next(&mut self, what: &str) -> Result<&'a str, ScenarioError> {
        self.try_next().ok_or_else(|| {
            ScenarioError::Parse(format!(
                "unexpected end of input while reading {what} (after {} tokens)",
                self.consumed
            ))
        })
    }

    fn parse<T: FromStr>(&mut self, what: &str) -> Result<T, ScenarioError> {
        let token = self.next(what)?;
        token.parse().map_err(|_| {
            ScenarioError::Parse(format!("expected {what}, found `{token}`"))
        })
    }

    fn coord(&mut self, what: &str) -> Result<Coord, ScenarioError> {
        let x = self.parse(what)?;
        let y = self.parse(what)?;
        Ok(Coord::new(x, y))
    }

    fn coord_list(&mut self, count: usize, what: &str) -> Result<Vec<Coord>, ScenarioError> {
        (0..count).map(|_| self.coord(what)).collect()
    }
}

fn reject_duplicate(seen: &mut HashSet<&'static str>, key: &'static str) -> Result<(), ScenarioError> {
    if seen.insert(key) {
        Ok(())
    } else {
        Err(ScenarioError::Parse(format!("duplicate key `{key}`")))
    }
}

impl Scenario {
    /// Parse a scenario from its textual form.
    pub fn parse(text: &str) -> Result<Self, ScenarioError> {
        let mut tokens = Tokens::new(text);
        let mut seen = HashSet::new();
        let mut dim = None;
        let mut cell_size = (1.0, 1.0);
        let mut exits = Vec::new();
        let mut movable = Vec::new();
        let mut immovable = Vec::new();
        let mut lambda = std::f64::consts::SQRT_2;
        let mut crowd_avoidance = 0.0;

        while let Some(key) = tokens.try_next() {
            match key {
                "DIM" => {
                    reject_duplicate(&mut seen, "DIM")?;
                    let w = tokens.parse("grid width")?;
                    let h = tokens.parse("grid height")?;
                    dim = Some((w, h));
                }
                "CELL_SIZE" => {
                    reject_duplicate(&mut seen, "CELL_SIZE")?;
                    cell_size = (tokens.parse("cell width")?, tokens.parse("cell height")?);
                }
                "EXIT" => {
                    reject_duplicate(&mut seen, "EXIT")?;
                    let n: usize = tokens.parse("exit count")?;
                    for _ in 0..n {
                        let cells: usize = tokens.parse("exit cell count")?;
                        exits.push(Exit::new(tokens.coord_list(cells, "exit cell")?));
                    }
                }
                "MOVABLE" => {
                    reject_duplicate(&mut seen, "MOVABLE")?;
                    let n: usize = tokens.parse("movable obstacle count")?;
                    movable = tokens.coord_list(n, "movable obstacle")?;
                }
                "IMMOVABLE" => {
                    reject_duplicate(&mut seen, "IMMOVABLE")?;
                    let n: usize = tokens.parse("immovable obstacle count")?;
                    immovable = tokens.coord_list(n, "immovable obstacle")?;
                }
                "LAMBDA" => {
                    reject_duplicate(&mut seen, "LAMBDA")?;
                    lambda = tokens.parse("diagonal weight")?;
                }
                "CROWD_AVOIDANCE" => {
                    reject_duplicate(&mut seen, "CROWD_AVOIDANCE")?;
                    crowd_avoidance = tokens.parse("crowd avoidance coefficient")?;
                }
                other => {
                    return Err(ScenarioError::Parse(format!(
                        "unknown scenario key `{other}`"
                    )));
                }
            }
        }

        let (width, height) =
            dim.ok_or_else(|| ScenarioError::Parse("missing required key `DIM`".into()))?;
        let scenario = Self {
            width,
            height,
            cell_size,
            exits,
            movable,
            immovable,
            lambda,
            crowd_avoidance,
        };
        scenario.validate()?;
        Ok(scenario)
    }

    /// Serialize back into the input format.
    #[must_use]
    pub fn save(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "DIM {} {}", self.width, self.height);
        let _ = writeln!(out, "CELL_SIZE {} {}", self.cell_size.0, self.cell_size.1);
        let _ = writeln!(out, "EXIT {}", self.exits.len());
        for exit in &self.exits {
            let _ = write!(out, "{}", exit.cells.len());
            for cell in &exit.cells {
                let _ = write!(out, " {} {}", cell.x, cell.y);
            }
            out.push('\n');
        }
        let _ = writeln!(out, "MOVABLE {}", self.movable.len());
        for cell in &self.movable {
            let _ = writeln!(out, "{} {}", cell.x, cell.y);
        }
        let _ = writeln!(out, "IMMOVABLE {}", self.immovable.len());
        for cell in &self.immovable {
            let _ = writeln!(out, "{} {}", cell.x, cell.y);
        }
        let _ = writeln!(out, "LAMBDA {}", self.lambda);
        let _ = writeln!(out, "CROWD_AVOIDANCE {}", self.crowd_avoidance);
        out
    }

    /// Check the structural invariants of the scene.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.width <= 0 || self.height <= 0 {
            return Err(ScenarioError::Invalid(format!(
                "grid dimensions {}x{} must be positive",
                self.width, self.height
            )));
        }
        if self.cell_size.0 <= 0.0 || self.cell_size.1 <= 0.0 {
            return Err(ScenarioError::Invalid("cell size must be positive".into()));
        }
        if self.lambda <= 0.0 {
            return Err(ScenarioError::Invalid(
                "diagonal weight LAMBDA must be positive".into(),
            ));
        }
        if self.crowd_avoidance < 0.0 {
            return Err(ScenarioError::Invalid(
                "CROWD_AVOIDANCE must be non-negative".into(),
            ));
        }
        if self.exits.is_empty() {
            return Err(ScenarioError::Invalid(
                "a scenario needs at least one exit".into(),
            ));
        }

        let in_bounds =
            |c: Coord| c.x >= 0 && c.x < self.width && c.y >= 0 && c.y < self.height;
        let mut taken = HashSet::new();
        for (i, exit) in self.exits.iter().enumerate() {
            if exit.cells.is_empty() {
                return Err(ScenarioError::Invalid(format!("exit {i} has no cells")));
            }
            for &cell in &exit.cells {
                if !in_bounds(cell) {
                    return Err(ScenarioError::Invalid(format!(
                        "exit {i} cell ({}, {}) is out of bounds",
                        cell.x, cell.y
                    )));
                }
                if !taken.insert(cell) {
                    return Err(ScenarioError::Invalid(format!(
                        "cell ({}, {}) is claimed twice",
                        cell.x, cell.y
                    )));
                }
            }
            if !connected_4(&exit.cells) {
                return Err(ScenarioError::Invalid(format!(
                    "exit {i} is not a 4-connected component"
                )));
            }
        }
        for &cell in self.movable.iter().chain(&self.immovable) {
            if !in_bounds(cell) {
                return Err(ScenarioError::Invalid(format!(
                    "obstacle ({}, {}) is out of bounds",
                    cell.x, cell.y
                )));
            }
            if !taken.insert(cell) {
                return Err(ScenarioError::Invalid(format!(
                    "cell ({}, {}) is claimed twice",
                    cell.x, cell.y
                )));
            }
        }
        Ok(())
    }
}

impl CrowdConfig {
    /// Parse an agent configuration from its textual form. Every key is
    /// optional; omissions keep their defaults.
    pub fn parse(text: &str) -> Result<Self, ScenarioError> {
        let mut tokens = Tokens::new(text);
        let mut seen = HashSet::new();
        let mut config = Self::default();

        while let Some(key) = tokens.try_next() {
            match key {
                "AGENTS" => {
                    reject_duplicate(&mut seen, "AGENTS")?;
                    let n: usize = tokens.parse("agent count")?;
                    config.agents = tokens.coord_list(n, "agent position")?;
                }
                "PANIC_PROB" => {
                    reject_duplicate(&mut seen, "PANIC_PROB")?;
                    config.panic_prob = tokens.parse("panic probability")?;
                }
                "INIT_STRATEGY" => {
                    reject_duplicate(&mut seen, "INIT_STRATEGY")?;
                    config.init_strategy = (
                        tokens.parse("yielder weight")?,
                        tokens.parse("volunteer weight")?,
                    );
                }
                "RATIONALITY" => {
                    reject_duplicate(&mut seen, "RATIONALITY")?;
                    config.rationality = tokens.parse("rationality")?;
                }
                "HERDING" => {
                    reject_duplicate(&mut seen, "HERDING")?;
                    config.herding = tokens.parse("herding coefficient")?;
                }
                "INTERACTION_RADIUS_O" => {
                    reject_duplicate(&mut seen, "INTERACTION_RADIUS_O")?;
                    config.interaction_radius_o = tokens.parse("interaction radius")?;
                }
                "INTERACTION_RADIUS_V" => {
                    reject_duplicate(&mut seen, "INTERACTION_RADIUS_V")?;
                    config.interaction_radius_v = tokens.parse("interaction radius")?;
                }
                "CRITICAL_DENSITY" => {
                    reject_duplicate(&mut seen, "CRITICAL_DENSITY")?;
                    config.critical_density = tokens.parse("critical density")?;
                }
                "KA" => {
                    reject_duplicate(&mut seen, "KA")?;
                    config.ka = tokens.parse("recruitment gain")?;
                }
                "CC" => {
                    reject_duplicate(&mut seen, "CC")?;
                    config.cc = tokens.parse("drop-off distance weight")?;
                }
                "RC" => {
                    reject_duplicate(&mut seen, "RC")?;
                    config.rc = tokens.parse("drop-off cluster weight")?;
                }
                "MIN_DIST_FROM_EXITS" => {
                    reject_duplicate(&mut seen, "MIN_DIST_FROM_EXITS")?;
                    config.min_dist_from_exits = tokens.parse("minimum exit distance")?;
                }
                "MAX_TRAVEL" => {
                    reject_duplicate(&mut seen, "MAX_TRAVEL")?;
                    config.max_travel = tokens.parse("travel limit")?;
                }
                "REWARD_COOP" => {
                    reject_duplicate(&mut seen, "REWARD_COOP")?;
                    config.reward_cooperate = tokens.parse("cooperation reward")?;
                }
                "COST_CONFLICT" => {
                    reject_duplicate(&mut seen, "COST_CONFLICT")?;
                    config.cost_conflict = tokens.parse("conflict cost")?;
                }
                other => {
                    return Err(ScenarioError::Parse(format!("unknown agent key `{other}`")));
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Serialize back into the input format.
    #[must_use]
    pub fn save(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "AGENTS {}", self.agents.len());
        for agent in &self.agents {
            let _ = writeln!(out, "{} {}", agent.x, agent.y);
        }
        let _ = writeln!(out, "PANIC_PROB {}", self.panic_prob);
        let _ = writeln!(
            out,
            "INIT_STRATEGY {} {}",
            self.init_strategy.0, self.init_strategy.1
        );
        let _ = writeln!(out, "RATIONALITY {}", self.rationality);
        let _ = writeln!(out, "HERDING {}", self.herding);
        let _ = writeln!(out, "INTERACTION_RADIUS_O {}", self.interaction_radius_o);
        let _ = writeln!(out, "INTERACTION_RADIUS_V {}", self.interaction_radius_v);
        let _ = writeln!(out, "CRITICAL_DENSITY {}", self.critical_density);
        let _ = writeln!(out, "KA {}", self.ka);
        let _ = writeln!(out, "CC {}", self.cc);
        let _ = writeln!(out, "RC {}", self.rc);
        let _ = writeln!(out, "MIN_DIST_FROM_EXITS {}", self.min_dist_from_exits);
        let _ = writeln!(out, "MAX_TRAVEL {}", self.max_travel);
        let _ = writeln!(out, "REWARD_COOP {}", self.reward_cooperate);
        let _ = writeln!(out, "COST_CONFLICT {}", self.cost_conflict);
        out
    }

    /// Check the behavioral parameters.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if !(0.0..=1.0).contains(&self.panic_prob) {
            return Err(ScenarioError::Invalid(
                "PANIC_PROB must lie in [0, 1]".into(),
            ));
        }
        if self.init_strategy.0 < 0.0
            || self.init_strategy.1 < 0.0
            || self.init_strategy.0 + self.init_strategy.1 <= 0.0
        {
            return Err(ScenarioError::Invalid(
                "INIT_STRATEGY weights must be non-negative with a positive sum".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.herding) {
            return Err(ScenarioError::Invalid("HERDING must lie in [0, 1]".into()));
        }
        if self.rationality < 0.0
            || self.interaction_radius_o < 0.0
            || self.interaction_radius_v < 0.0
            || self.critical_density < 0.0
            || self.ka < 0.0
            || self.min_dist_from_exits < 0.0
            || self.cost_conflict < 0.0
        {
            return Err(ScenarioError::Invalid(
                "rationality, radii, densities, gains, and costs must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// Whether the cells form a single 4-connected component.
fn connected_4(cells: &[Coord]) -> bool {
    let set: HashSet<Coord> = cells.iter().copied().collect();
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([cells[0]]);
    visited.insert(cells[0]);
    while let Some(c) = queue.pop_front() {
        for (dx, dy) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
            let n = Coord::new(c.x + dx, c.y + dy);
            if set.contains(&n) && visited.insert(n) {
                queue.push_back(n);
            }
        }
    }
    visited.len() == set.len()
}
