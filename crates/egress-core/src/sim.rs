//! The synchronous CA update loop and its obstacle-removal phases.
//!
//! A [`Simulation`] owns the grid, exits, obstacles, floor field and agent
//! vector; one `step()` at a time runs on the calling thread. Per-exit field
//! recomputation and the density pass fan out over rayon and never touch an
//! RNG, so runs are reproducible for a fixed seed.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use ordered_float::OrderedFloat;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::SimError;
use crate::agent::{Agent, AgentId, Role, Strategy};
use crate::field::{FloorField, INIT_WEIGHT, OBSTACLE_WEIGHT, compute_anticipation, compute_attractor};
use crate::game::{ConflictOutcome, GameParams, defect_probability, resolve_volunteer, resolve_yielder};
use crate::grid::{CellState, Coord, Exit, Grid, MOORE_OFFSETS, Obstacle};
use crate::scenario::{CrowdConfig, Scenario};

/// Discrete simulation clock (steps completed since construction).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestep(pub u64);

impl Timestep {
    /// Returns the next sequential timestep.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the clock to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// How contested cells are resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConflictResolver {
    /// Yielder game only; no recruitment, no obstacle relocation.
    YielderOnly,
    /// Yielder game plus volunteer recruitment, volunteer conflicts, and
    /// obstacle relocation.
    WithVolunteers,
}

/// Counters emitted by one step.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepSummary {
    pub timestep: Timestep,
    pub remaining: usize,
    /// Agents absorbed by an exit this step.
    pub exited: usize,
    pub panicked: usize,
    pub conflicts: usize,
    pub recruits: usize,
    pub relocations: usize,
    pub scene_changed: bool,
}

/// The complete evacuation world.
pub struct Simulation {
    grid: Grid,
    exits: Vec<Exit>,
    obstacles: Vec<Obstacle>,
    field: FloorField,
    agents: Vec<Agent>,
    crowd: CrowdConfig,
    params: GameParams,
    resolver: ConflictResolver,
    seed: u64,
    rng: SmallRng,
    timestep: Timestep,
    density: Vec<f64>,
    scene_dirty: bool,
    clamp_events: u64,
    clamp_warned: bool,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("timestep", &self.timestep)
            .field("resolver", &self.resolver)
            .field("agents", &self.agents.len())
            .field("exits", &self.exits.len())
            .field("obstacles", &self.obstacles.len())
            .finish()
    }
}

impl Simulation {
    /// Build a world from a validated scenario and crowd configuration.
    ///
    /// Movable obstacles enable the `WithVolunteers` resolver; a scene
    /// without them runs `YielderOnly`. Override with [`Self::with_resolver`].
    pub fn new(scenario: Scenario, crowd: CrowdConfig, seed: u64) -> Result<Self, SimError> {
        scenario.validate()?;
        crowd.validate()?;

        let mut grid = Grid::new(scenario.width, scenario.height, scenario.cell_size)?;
        let mut obstacles: Vec<Obstacle> = scenario
            .movable
            .iter()
            .map(|&position| Obstacle {
                position,
                movable: true,
            })
            .collect();
        obstacles.extend(scenario.immovable.iter().map(|&position| Obstacle {
            position,
            movable: false,
        }));
        grid.rebuild_states(&scenario.exits, &obstacles);

        let strategy = Strategy::new(crowd.init_strategy.0, crowd.init_strategy.1);
        let mut agents = Vec::with_capacity(crowd.agents.len());
        let mut placed = HashSet::new();
        for &position in &crowd.agents {
            if !grid.in_bounds(position) {
                return Err(SimError::Bounds {
                    x: position.x,
                    y: position.y,
                    width: grid.width(),
                    height: grid.height(),
                });
            }
            if grid.state_at(position) != CellState::Empty {
                return Err(SimError::Topology(format!(
                    "agent start ({}, {}) overlaps an exit or obstacle",
                    position.x, position.y
                )));
            }
            if !placed.insert(position) {
                return Err(SimError::Topology(format!(
                    "two agents start at ({}, {})",
                    position.x, position.y
                )));
            }
            agents.push(Agent::new(position, strategy));
        }
        grid.rebuild_occupancy(&agents);

        let resolver = if obstacles.iter().any(|o| o.movable) {
            ConflictResolver::WithVolunteers
        } else {
            ConflictResolver::YielderOnly
        };
        let params = GameParams {
            rationality: crowd.rationality,
            herding: crowd.herding,
            reward_cooperate: crowd.reward_cooperate,
            cost_conflict: crowd.cost_conflict,
        };

        let mut field = FloorField::new(
            scenario.width,
            scenario.height,
            scenario.lambda,
            scenario.crowd_avoidance,
            scenario.exits.len(),
        );
        field.recompute_static(&scenario.exits, &obstacles);

        let density_len = grid.len();
        let mut simulation = Self {
            grid,
            exits: scenario.exits,
            obstacles,
            field,
            agents,
            crowd,
            params,
            resolver,
            seed,
            rng: SmallRng::seed_from_u64(seed),
            timestep: Timestep::zero(),
            density: vec![0.0; density_len],
            scene_dirty: false,
            clamp_events: 0,
            clamp_warned: false,
        };
        simulation.refresh_dynamic();
        Ok(simulation)
    }

    /// Replace the conflict resolver (before stepping).
    #[must_use]
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Advance the world by one synchronous step.
    ///
    /// Master-RNG draws issue in a fixed order: recruitment coins in
    /// agent-id order, then panic flags in agent-id order, then intention
    /// tie breaks in agent-id order. Each conflict draws from its own
    /// stream seeded by `(seed, timestep, conflict_index)` with conflicts
    /// visited in ascending target-cell order.
    pub fn step(&mut self) -> StepSummary {
        let timestep = self.timestep.next();
        let mut summary = StepSummary {
            timestep,
            ..StepSummary::default()
        };

        self.stage_exit_absorption(&mut summary);
        summary.remaining = self.remaining();
        if summary.remaining == 0 {
            if summary.exited == 0 {
                // Everyone left earlier; the step is a no-op.
                summary.timestep = self.timestep;
                return summary;
            }
            self.timestep = timestep;
            return summary;
        }

        self.stage_density();
        if self.resolver == ConflictResolver::WithVolunteers {
            self.stage_companions();
            self.stage_recruitment(&mut summary);
        }

        let (intentions, pending_relocations) = self.stage_intentions(&mut summary);
        let winners = self.stage_conflicts(&intentions, timestep, &mut summary);
        self.stage_commit(&winners, &intentions);
        self.stage_relocations(&pending_relocations, &mut summary);
        self.stage_scene_sync(&mut summary);
        self.refresh_dynamic();

        for agent in &mut self.agents {
            if agent.visible {
                agent.travel_timesteps += 1;
            }
        }
        summary.remaining = self.remaining();
        self.timestep = timestep;
        summary
    }

    /// Agents that have not reached an exit yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.agents.iter().filter(|a| a.visible).count()
    }

    /// Agents absorbed so far.
    #[must_use]
    pub fn exited_count(&self) -> usize {
        self.agents.iter().filter(|a| !a.visible).count()
    }

    #[must_use]
    pub const fn timestep(&self) -> Timestep {
        self.timestep
    }

    #[must_use]
    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    #[must_use]
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    #[must_use]
    pub fn exits(&self) -> &[Exit] {
        &self.exits
    }

    #[must_use]
    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    #[must_use]
    pub fn field(&self) -> &FloorField {
        &self.field
    }

    #[must_use]
    pub fn crowd(&self) -> &CrowdConfig {
        &self.crowd
    }

    #[must_use]
    pub const fn resolver(&self) -> ConflictResolver {
        self.resolver
    }

    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Logit exponents clamped so far.
    #[must_use]
    pub const fn clamp_events(&self) -> u64 {
        self.clamp_events
    }

    /// The scene in input format, with obstacles at their current positions.
    #[must_use]
    pub fn scenario_snapshot(&self) -> Scenario {
        Scenario {
            width: self.grid.width(),
            height: self.grid.height(),
            cell_size: self.grid.cell_size(),
            exits: self.exits.clone(),
            movable: self
                .obstacles
                .iter()
                .filter(|o| o.movable)
                .map(|o| o.position)
                .collect(),
            immovable: self
                .obstacles
                .iter()
                .filter(|o| !o.movable)
                .map(|o| o.position)
                .collect(),
            lambda: self.field.lambda(),
            crowd_avoidance: self.field.kappa(),
        }
    }

    /// Verify the structural invariants of the world.
    pub fn check_invariants(&self) -> Result<(), SimError> {
        let mut cells = HashSet::new();
        for (id, agent) in self.agents.iter().enumerate() {
            if !agent.visible {
                continue;
            }
            if !cells.insert(agent.position) {
                return Err(SimError::Topology(format!(
                    "two agents share cell ({}, {})",
                    agent.position.x, agent.position.y
                )));
            }
            if matches!(
                self.grid.state_at(agent.position),
                CellState::MovableObstacle | CellState::ImmovableObstacle
            ) {
                return Err(SimError::Topology(format!(
                    "agent {id} stands inside an obstacle"
                )));
            }
            if !self.grid.is_occupied(agent.position) {
                return Err(SimError::Topology(format!(
                    "occupancy mask lost agent {id}"
                )));
            }
        }
        let mut obstacle_cells = HashSet::new();
        for obstacle in &self.obstacles {
            if !obstacle_cells.insert(obstacle.position) || cells.contains(&obstacle.position) {
                return Err(SimError::Topology(format!(
                    "obstacle cell ({}, {}) is not exclusive",
                    obstacle.position.x, obstacle.position.y
                )));
            }
            if matches!(self.grid.state_at(obstacle.position), CellState::Exit(_)) {
                return Err(SimError::Topology(format!(
                    "obstacle sits on an exit cell ({}, {})",
                    obstacle.position.x, obstacle.position.y
                )));
            }
        }
        let absorbed = self.agents.iter().filter(|a| !a.visible).count();
        if absorbed + self.remaining() != self.agents.len() {
            return Err(SimError::Topology("agent conservation violated".into()));
        }
        Ok(())
    }

    // ----- step stages -------------------------------------------------

    /// Remove agents standing on an exit cell.
    fn stage_exit_absorption(&mut self, summary: &mut StepSummary) {
        for (id, agent) in self.agents.iter_mut().enumerate() {
            if !agent.visible {
                continue;
            }
            if let CellState::Exit(exit) = self.grid.state_at(agent.position) {
                agent.visible = false;
                agent.exited_via = Some(exit);
                self.grid.set_occupied(agent.position, false);
                summary.exited += 1;
                debug!(agent = id, exit, "agent reached an exit");
            }
        }
    }

    /// Local agent density per cell, as a fraction of the in-bounds
    /// neighborhood within `interaction_radius_o`. Rayon per-cell map; the
    /// inputs are read-only snapshots.
    fn stage_density(&mut self) {
        let radius = self.crowd.interaction_radius_o;
        if radius <= 0.0 {
            self.density.fill(0.0);
            return;
        }
        let reach = radius.floor() as i32;
        let radius_sq = radius * radius;
        let width = self.grid.width();
        let height = self.grid.height();
        let mut agent_mask = vec![false; self.grid.len()];
        for agent in &self.agents {
            if agent.visible {
                agent_mask[self.grid.index(agent.position)] = true;
            }
        }
        self.density = (0..self.grid.len())
            .into_par_iter()
            .map(|idx| {
                let cx = (idx % width as usize) as i32;
                let cy = (idx / width as usize) as i32;
                let mut cells = 0u32;
                let mut agents = 0u32;
                for dy in -reach..=reach {
                    for dx in -reach..=reach {
                        if f64::from(dx * dx + dy * dy) > radius_sq {
                            continue;
                        }
                        let (nx, ny) = (cx + dx, cy + dy);
                        if nx < 0 || nx >= width || ny < 0 || ny >= height {
                            continue;
                        }
                        cells += 1;
                        if agent_mask[(ny as usize) * (width as usize) + nx as usize] {
                            agents += 1;
                        }
                    }
                }
                if cells == 0 {
                    0.0
                } else {
                    f64::from(agents) / f64::from(cells)
                }
            })
            .collect();
    }

    /// Point each evacuee at the nearest better-scoring agent in range.
    fn stage_companions(&mut self) {
        let radius_sq = self.crowd.interaction_radius_o * self.crowd.interaction_radius_o;
        let snapshot: Vec<(Coord, f64, bool)> = self
            .agents
            .iter()
            .map(|a| (a.position, a.payoffs.total, a.visible))
            .collect();
        for (id, agent) in self.agents.iter_mut().enumerate() {
            if !agent.visible || agent.is_volunteer() {
                agent.companion = None;
                continue;
            }
            let own_total = agent.payoffs.total;
            let mut best: Option<(OrderedFloat<f64>, AgentId)> = None;
            for (other, &(position, total, visible)) in snapshot.iter().enumerate() {
                if other == id || !visible || total <= own_total {
                    continue;
                }
                let dist_sq = agent.position.dist_sq(position);
                if dist_sq > radius_sq {
                    continue;
                }
                let key = (OrderedFloat(dist_sq), other);
                if best.is_none_or(|b| key < b) {
                    best = Some(key);
                }
            }
            agent.companion = best.map(|(_, other)| other);
        }
    }

    /// Recruit evacuees whose line to the nearest exit crosses a movable
    /// obstacle within `interaction_radius_v`.
    fn stage_recruitment(&mut self, summary: &mut StepSummary) {
        let mut targeted: HashSet<usize> = self
            .agents
            .iter()
            .filter_map(|a| match &a.role {
                Role::Volunteer { target, .. } => Some(*target),
                Role::Evacuee => None,
            })
            .collect();
        let obstacle_at: HashMap<Coord, usize> = self
            .obstacles
            .iter()
            .enumerate()
            .map(|(i, o)| (o.position, i))
            .collect();

        for id in 0..self.agents.len() {
            let agent = &self.agents[id];
            if !agent.visible || agent.is_volunteer() {
                continue;
            }
            let Some(exit_cell) = self.nearest_exit_cell(agent.position) else {
                continue;
            };
            let Some(target) = blocking_obstacle(
                agent.position,
                exit_cell,
                self.crowd.interaction_radius_v,
                &self.obstacles,
                &obstacle_at,
                &targeted,
            ) else {
                continue;
            };
            let p = (self.crowd.ka * agent.strategy.volunteer).min(1.0);
            if p > 0.0 && self.rng.random_bool(p) {
                let field = compute_attractor(
                    self.grid.width(),
                    self.grid.height(),
                    self.field.lambda(),
                    &self.exits,
                    &self.obstacles,
                    target,
                );
                self.agents[id].role = Role::Volunteer { target, field };
                targeted.insert(target);
                summary.recruits += 1;
                debug!(agent = id, obstacle = target, "volunteer recruited");
            }
        }
    }

    /// Closest exit cell by Euclidean distance, ties to the lowest cell.
    fn nearest_exit_cell(&self, from: Coord) -> Option<Coord> {
        self.exits
            .iter()
            .flat_map(|e| e.cells.iter().copied())
            .min_by_key(|&cell| (OrderedFloat(from.dist_sq(cell)), cell))
    }

    /// Form an intention per agent. Returns one target cell per agent
    /// (equal to the current cell when staying) and the volunteers that are
    /// adjacent to their obstacle and will relocate it at commit time.
    fn stage_intentions(&mut self, summary: &mut StepSummary) -> (Vec<Coord>, Vec<AgentId>) {
        // Panic flags first, in agent-id order.
        let panic_prob = self.crowd.panic_prob;
        for (id, agent) in self.agents.iter_mut().enumerate() {
            if !agent.visible {
                agent.in_panic = false;
                continue;
            }
            agent.in_panic = self.rng.random_bool(panic_prob);
            if agent.in_panic {
                summary.panicked += 1;
                trace!(agent = id, "agent in panic, staying put");
            }
        }

        let Simulation {
            agents,
            grid,
            field,
            obstacles,
            crowd,
            density,
            rng,
            ..
        } = self;
        let cells = field.cells();
        let lambda = field.lambda();
        let herding = crowd.herding;
        let critical_density = crowd.critical_density;

        let mut intentions: Vec<Coord> = agents.iter().map(|a| a.position).collect();
        let mut pending = Vec::new();
        for id in 0..agents.len() {
            let agent = &agents[id];
            if !agent.visible || agent.in_panic {
                continue;
            }
            let position = agent.position;

            let custom = match &agent.role {
                Role::Volunteer { target, field } => {
                    if position.chebyshev(obstacles[*target].position) == 1 {
                        // Adjacent: the move this step is the relocation.
                        pending.push(id);
                        continue;
                    }
                    Some(field)
                }
                Role::Evacuee => None,
            };
            let companion = agent
                .companion
                .filter(|&c| {
                    custom.is_none()
                        && herding > 0.0
                        && agents[c].visible
                        && density[grid.index(position)] >= critical_density
                })
                .map(|c| agents[c].position);

            // Raw field value: the volunteer's custom field or the global
            // aggregate. Sentinels are checked on this value; the herding
            // blend only reshapes admissible cells.
            let raw = |cell: Coord| -> f64 {
                let idx = grid.index(cell);
                match custom {
                    Some(field) => field[idx],
                    None => cells[idx],
                }
            };
            let value = |cell: Coord| -> f64 {
                match companion {
                    Some(leader) => {
                        (1.0 - herding) * raw(cell)
                            + herding * cell.diagonal_distance(leader, lambda)
                    }
                    None => raw(cell),
                }
            };

            let mut lowest = value(position);
            let mut candidates: SmallVec<[Coord; 8]> = SmallVec::new();
            for (dx, dy) in MOORE_OFFSETS {
                let neighbor = Coord::new(position.x + dx, position.y + dy);
                if !grid.in_bounds(neighbor) || grid.is_occupied(neighbor) {
                    continue;
                }
                let base = raw(neighbor);
                if base >= INIT_WEIGHT || base == OBSTACLE_WEIGHT {
                    // Unreachable or sentinel-blocked; never a destination.
                    continue;
                }
                let v = value(neighbor);
                if v < lowest {
                    lowest = v;
                    candidates.clear();
                    candidates.push(neighbor);
                } else if v == lowest {
                    candidates.push(neighbor);
                }
            }
            if !candidates.is_empty() {
                let pick = rng.random_range(0..candidates.len());
                intentions[id] = candidates[pick];
            }
        }
        (intentions, pending)
    }

    /// Group intentions by target cell and resolve the contested ones, in
    /// ascending cell order. Returns the agents allowed to move.
    fn stage_conflicts(
        &mut self,
        intentions: &[Coord],
        timestep: Timestep,
        summary: &mut StepSummary,
    ) -> Vec<AgentId> {
        let mut groups: BTreeMap<usize, SmallVec<[AgentId; 8]>> = BTreeMap::new();
        for (id, agent) in self.agents.iter().enumerate() {
            if agent.visible {
                groups
                    .entry(self.grid.index(intentions[id]))
                    .or_default()
                    .push(id);
            }
        }

        let mut winners = Vec::new();
        let mut conflict_index = 0u64;
        for group in groups.into_values() {
            if group.len() == 1 {
                winners.push(group[0]);
                continue;
            }
            summary.conflicts += 1;
            let mut rng = self.conflict_rng(timestep, conflict_index);
            conflict_index += 1;

            let contestants: SmallVec<[(AgentId, f64); 8]> = group
                .iter()
                .map(|&id| (id, self.agents[id].strategy.volunteer))
                .collect();
            let involves_volunteer = group.iter().any(|&id| self.agents[id].is_volunteer());
            let outcome = if involves_volunteer {
                resolve_volunteer(&contestants, &self.params, &mut rng)
            } else {
                resolve_yielder(&contestants, &self.params, &mut rng)
            };
            if outcome.clamp_events > 0 {
                self.note_clamp(u64::from(outcome.clamp_events));
            }
            if let Some(winner) = outcome.winner {
                winners.push(winner);
            }
            self.apply_strategy_updates(&outcome, &mut rng);
        }
        winners
    }

    /// Payoff bookkeeping and strategy adaptation for one resolved conflict.
    fn apply_strategy_updates(&mut self, outcome: &ConflictOutcome, rng: &mut SmallRng) {
        for contestant in &outcome.contestants {
            self.agents[contestant.id].payoffs.record(
                contestant.defected,
                contestant.realized,
                contestant.counterfactual,
            );
        }
        for contestant in &outcome.contestants {
            let id = contestant.id;
            let herd = self.params.herding > 0.0
                && rng.random_bool(self.params.herding)
                && self.density[self.grid.index(self.agents[id].position)]
                    >= self.crowd.critical_density;
            let copied = if herd { self.best_neighbor_strategy(id) } else { None };
            match copied {
                Some(strategy) => self.agents[id].strategy = strategy,
                None => {
                    let payoffs = self.agents[id].payoffs;
                    let (p_defect, clamped) = defect_probability(
                        self.params.rationality,
                        payoffs.average_yield(),
                        payoffs.average_defect(),
                    );
                    if clamped {
                        self.note_clamp(1);
                    }
                    self.agents[id].strategy.set_volunteer(p_defect);
                }
            }
        }
    }

    /// Strategy of the highest-scoring visible agent within
    /// `interaction_radius_o`, ties to the lowest id.
    fn best_neighbor_strategy(&self, id: AgentId) -> Option<Strategy> {
        let position = self.agents[id].position;
        let radius_sq = self.crowd.interaction_radius_o * self.crowd.interaction_radius_o;
        let mut best: Option<(OrderedFloat<f64>, std::cmp::Reverse<AgentId>, Strategy)> = None;
        for (other, agent) in self.agents.iter().enumerate() {
            if other == id || !agent.visible {
                continue;
            }
            if position.dist_sq(agent.position) > radius_sq {
                continue;
            }
            let key = (
                OrderedFloat(agent.payoffs.total),
                std::cmp::Reverse(other),
                agent.strategy,
            );
            if best.as_ref().is_none_or(|b| (key.0, key.1) > (b.0, b.1)) {
                best = Some(key);
            }
        }
        best.map(|(_, _, strategy)| strategy)
    }

    /// Move the winners; losers keep their cell for this step.
    fn stage_commit(&mut self, winners: &[AgentId], intentions: &[Coord]) {
        let (grid, agents) = (&mut self.grid, &mut self.agents);
        for &id in winners {
            let target = intentions[id];
            let agent = &mut agents[id];
            if target == agent.position {
                continue;
            }
            grid.set_occupied(agent.position, false);
            agent.position = target;
            grid.set_occupied(target, true);
        }
    }

    /// Volunteers adjacent to their obstacle relocate it now, using the
    /// anticipation field to score drop-off cells.
    fn stage_relocations(&mut self, pending: &[AgentId], summary: &mut StepSummary) {
        for &id in pending {
            let target = match &self.agents[id].role {
                Role::Volunteer { target, .. } => *target,
                Role::Evacuee => continue,
            };
            let aff = compute_anticipation(
                self.grid.width(),
                self.grid.height(),
                self.field.lambda(),
                &self.exits,
                &self.obstacles,
                target,
            );
            let Some(drop) = self.choose_drop_cell(&aff, target) else {
                trace!(agent = id, obstacle = target, "no admissible drop-off cell yet");
                continue;
            };
            let old = self.obstacles[target].position;
            self.grid.set_state(old, CellState::Empty);
            self.grid.set_occupied(old, false);
            self.obstacles[target].position = drop;
            self.grid.set_state(drop, CellState::MovableObstacle);
            self.grid.set_occupied(drop, true);
            self.agents[id].role = Role::Evacuee;
            self.scene_dirty = true;
            summary.relocations += 1;
            debug!(
                agent = id,
                obstacle = target,
                from_x = old.x,
                from_y = old.y,
                to_x = drop.x,
                to_y = drop.y,
                "obstacle relocated"
            );
        }
    }

    /// Best drop-off cell for obstacle `target`: free, at least
    /// `min_dist_from_exits` away per the anticipation field, maximizing
    /// `cc * distance - rc * cluster`. Ties break to the lowest cell index.
    fn choose_drop_cell(&self, aff: &[f64], target: usize) -> Option<Coord> {
        let lifted = self.obstacles[target].position;
        let mut best: Option<(f64, usize)> = None;
        for idx in 0..self.grid.len() {
            let cell = self.grid.coord(idx);
            if self.grid.state_at(cell) != CellState::Empty || self.grid.is_occupied(cell) {
                continue;
            }
            let distance = aff[idx];
            if distance == OBSTACLE_WEIGHT
                || distance >= INIT_WEIGHT
                || distance < self.crowd.min_dist_from_exits
            {
                continue;
            }
            let mut cluster = 0;
            for (dx, dy) in MOORE_OFFSETS {
                let n = Coord::new(cell.x + dx, cell.y + dy);
                if n != lifted
                    && self.grid.in_bounds(n)
                    && self.grid.state_at(n) == CellState::MovableObstacle
                {
                    cluster += 1;
                }
            }
            let score = self.crowd.cc * distance - self.crowd.rc * f64::from(cluster);
            if best.is_none_or(|(s, _)| score > s) {
                best = Some((score, idx));
            }
        }
        best.map(|(_, idx)| self.grid.coord(idx))
    }

    /// Deferred scene-change sync: rebuild cell states and occupancy,
    /// recompute the static field, refresh volunteer fields.
    fn stage_scene_sync(&mut self, summary: &mut StepSummary) {
        if !self.scene_dirty {
            return;
        }
        self.grid.rebuild_states(&self.exits, &self.obstacles);
        self.grid.rebuild_occupancy(&self.agents);
        self.field.recompute_static(&self.exits, &self.obstacles);
        self.refresh_volunteer_fields();
        self.scene_dirty = false;
        summary.scene_changed = true;
    }

    fn refresh_volunteer_fields(&mut self) {
        let volunteers: Vec<(AgentId, usize)> = self
            .agents
            .iter()
            .enumerate()
            .filter_map(|(id, a)| match &a.role {
                Role::Volunteer { target, .. } => Some((id, *target)),
                Role::Evacuee => None,
            })
            .collect();
        for (id, target) in volunteers {
            let field = compute_attractor(
                self.grid.width(),
                self.grid.height(),
                self.field.lambda(),
                &self.exits,
                &self.obstacles,
                target,
            );
            self.agents[id].role = Role::Volunteer { target, field };
        }
    }

    fn refresh_dynamic(&mut self) {
        if self.field.kappa() <= 0.0 {
            return;
        }
        let agent_cells: Vec<usize> = self
            .agents
            .iter()
            .filter(|a| a.visible)
            .map(|a| self.grid.index(a.position))
            .collect();
        self.field.recompute_dynamic(&self.exits, &agent_cells);
    }

    fn note_clamp(&mut self, events: u64) {
        if !self.clamp_warned {
            warn!("logit exponent clamped; further clamp events are only counted");
            self.clamp_warned = true;
        }
        self.clamp_events += events;
    }

    /// Per-conflict RNG stream, independent of the master stream.
    fn conflict_rng(&self, timestep: Timestep, conflict_index: u64) -> SmallRng {
        let mut state = splitmix64(self.seed ^ timestep.0.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        state = splitmix64(state ^ conflict_index);
        SmallRng::seed_from_u64(state)
    }

    // ----- live editing ------------------------------------------------

    /// Toggle an agent at `coord` (editor facility; not used mid-run).
    pub fn edit_agent(&mut self, coord: Coord) -> Result<(), SimError> {
        self.check_editable(coord)?;
        match self.grid.state_at(coord) {
            CellState::Empty => {}
            _ => {
                return Err(SimError::Topology(format!(
                    "cell ({}, {}) is not free for an agent",
                    coord.x, coord.y
                )));
            }
        }
        if let Some(id) = self
            .agents
            .iter()
            .position(|a| a.visible && a.position == coord)
        {
            self.agents.remove(id);
        } else {
            let strategy = Strategy::new(self.crowd.init_strategy.0, self.crowd.init_strategy.1);
            self.agents.push(Agent::new(coord, strategy));
        }
        self.grid.rebuild_occupancy(&self.agents);
        Ok(())
    }

    /// Toggle an obstacle at `coord`. Any active volunteers are demoted
    /// because obstacle indices shift.
    pub fn edit_obstacle(&mut self, coord: Coord, movable: bool) -> Result<(), SimError> {
        self.check_editable(coord)?;
        if self.agents.iter().any(|a| a.visible && a.position == coord) {
            return Err(SimError::Topology(format!(
                "cell ({}, {}) holds an agent",
                coord.x, coord.y
            )));
        }
        if matches!(self.grid.state_at(coord), CellState::Exit(_)) {
            return Err(SimError::Topology(format!(
                "cell ({}, {}) belongs to an exit",
                coord.x, coord.y
            )));
        }
        if let Some(i) = self.obstacles.iter().position(|o| o.position == coord) {
            self.obstacles.remove(i);
        } else {
            self.obstacles.push(Obstacle {
                position: coord,
                movable,
            });
        }
        for agent in &mut self.agents {
            if agent.is_volunteer() {
                agent.role = Role::Evacuee;
            }
        }
        self.sync_after_edit(false);
        Ok(())
    }

    /// Toggle an exit cell at `coord`, handling add / extend / shrink /
    /// merge / split of 4-connected exit components.
    pub fn edit_exit(&mut self, coord: Coord) -> Result<(), SimError> {
        self.check_editable(coord)?;
        if self.agents.iter().any(|a| a.visible && a.position == coord) {
            return Err(SimError::Topology(format!(
                "cell ({}, {}) holds an agent",
                coord.x, coord.y
            )));
        }
        match self.grid.state_at(coord) {
            CellState::MovableObstacle | CellState::ImmovableObstacle => {
                return Err(SimError::Topology(format!(
                    "cell ({}, {}) holds an obstacle",
                    coord.x, coord.y
                )));
            }
            CellState::Exit(exit) => {
                let mut cells = std::mem::take(&mut self.exits[exit].cells);
                cells.retain(|&c| c != coord);
                if cells.is_empty() {
                    self.exits.remove(exit);
                } else {
                    let mut components = components_4(&cells);
                    self.exits[exit] = Exit::new(components.remove(0));
                    for component in components {
                        self.exits.push(Exit::new(component));
                    }
                }
            }
            CellState::Empty => {
                self.reject_diagonal_contact(coord)?;
                let mut adjacent: Vec<usize> = [(1, 0), (-1, 0), (0, 1), (0, -1)]
                    .into_iter()
                    .filter_map(|(dx, dy)| {
                        let n = Coord::new(coord.x + dx, coord.y + dy);
                        if self.grid.in_bounds(n) {
                            match self.grid.state_at(n) {
                                CellState::Exit(e) => Some(e),
                                _ => None,
                            }
                        } else {
                            None
                        }
                    })
                    .collect();
                adjacent.sort_unstable();
                adjacent.dedup();
                match adjacent.as_slice() {
                    [] => self.exits.push(Exit::new(vec![coord])),
                    [only] => self.exits[*only].cells.push(coord),
                    [first, rest @ ..] => {
                        // Merge everything into the lowest-numbered exit.
                        let mut merged = std::mem::take(&mut self.exits[*first].cells);
                        merged.push(coord);
                        for &other in rest.iter().rev() {
                            merged.extend(self.exits.remove(other).cells);
                        }
                        self.exits[*first] = Exit::new(merged);
                    }
                }
            }
        }
        if self.exits.is_empty() {
            warn!("last exit removed; the scene has no way out");
        }
        for agent in &mut self.agents {
            if agent.is_volunteer() {
                agent.role = Role::Evacuee;
            }
        }
        self.sync_after_edit(true);
        Ok(())
    }

    fn check_editable(&self, coord: Coord) -> Result<(), SimError> {
        if self.grid.in_bounds(coord) {
            Ok(())
        } else {
            Err(SimError::Bounds {
                x: coord.x,
                y: coord.y,
                width: self.grid.width(),
                height: self.grid.height(),
            })
        }
    }

    /// Reject an exit cell whose only contact with a non-empty neighbor
    /// would be diagonal.
    fn reject_diagonal_contact(&self, coord: Coord) -> Result<(), SimError> {
        for (dx, dy) in [(1, 1), (1, -1), (-1, 1), (-1, -1)] {
            let diagonal = Coord::new(coord.x + dx, coord.y + dy);
            if !self.grid.in_bounds(diagonal)
                || self.grid.state_at(diagonal) == CellState::Empty
            {
                continue;
            }
            let bridges = [
                Coord::new(coord.x + dx, coord.y),
                Coord::new(coord.x, coord.y + dy),
            ];
            let bridged = bridges.iter().any(|&b| {
                self.grid.in_bounds(b) && self.grid.state_at(b) != CellState::Empty
            });
            if !bridged {
                return Err(SimError::Topology(format!(
                    "exit cell ({}, {}) would touch ({}, {}) only diagonally",
                    coord.x, coord.y, diagonal.x, diagonal.y
                )));
            }
        }
        Ok(())
    }

    fn sync_after_edit(&mut self, exits_changed: bool) {
        self.grid.rebuild_states(&self.exits, &self.obstacles);
        self.grid.rebuild_occupancy(&self.agents);
        if exits_changed {
            self.field.reset_exits(self.exits.len());
        }
        self.field.recompute_static(&self.exits, &self.obstacles);
        self.refresh_dynamic();
        self.scene_dirty = false;
    }
}

/// First obstacle on the straight line from `from` to `to` within `radius`:
/// `Some` if it is movable and untargeted, `None` otherwise (an immovable or
/// already-claimed blocker ends the search).
fn blocking_obstacle(
    from: Coord,
    to: Coord,
    radius: f64,
    obstacles: &[Obstacle],
    obstacle_at: &HashMap<Coord, usize>,
    targeted: &HashSet<usize>,
) -> Option<usize> {
    for cell in line_cells(from, to) {
        if cell == from {
            continue;
        }
        if f64::from(from.chebyshev(cell)) > radius {
            return None;
        }
        if let Some(&index) = obstacle_at.get(&cell) {
            if obstacles[index].movable && !targeted.contains(&index) {
                return Some(index);
            }
            return None;
        }
    }
    None
}

/// Cells traversed by the straight segment between two cell centers,
/// endpoints included.
fn line_cells(from: Coord, to: Coord) -> Vec<Coord> {
    let steps = (to.x - from.x).abs().max((to.y - from.y).abs());
    if steps == 0 {
        return vec![from];
    }
    let mut cells = Vec::with_capacity(steps as usize + 1);
    for i in 0..=steps {
        let t = f64::from(i) / f64::from(steps);
        let x = (f64::from(from.x) + t * f64::from(to.x - from.x)).round() as i32;
        let y = (f64::from(from.y) + t * f64::from(to.y - from.y)).round() as i32;
        let cell = Coord::new(x, y);
        if cells.last() != Some(&cell) {
            cells.push(cell);
        }
    }
    cells
}

/// Split cells into 4-connected components, preserving first-seen order.
fn components_4(cells: &[Coord]) -> Vec<Vec<Coord>> {
    let set: HashSet<Coord> = cells.iter().copied().collect();
    let mut assigned = HashSet::new();
    let mut components = Vec::new();
    for &start in cells {
        if assigned.contains(&start) {
            continue;
        }
        let mut component = Vec::new();
        let mut queue = VecDeque::from([start]);
        assigned.insert(start);
        while let Some(c) = queue.pop_front() {
            component.push(c);
            for (dx, dy) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
                let n = Coord::new(c.x + dx, c.y + dy);
                if set.contains(&n) && assigned.insert(n) {
                    queue.push_back(n);
                }
            }
        }
        components.push(component);
    }
    components
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
