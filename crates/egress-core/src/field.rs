//! Floor-field potentials guiding agents toward exits.
//!
//! Each exit owns a static field (weighted breadth-first relaxation over the
//! 8-connected grid), a dynamic crowd-avoidance term recomputed every step,
//! and their sum. The aggregate `cells` buffer an agent actually reads is the
//! per-cell minimum over exits, with sentinel entries skipped.

use std::collections::VecDeque;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::grid::{Coord, Exit, MOORE_OFFSETS, Obstacle};

/// Value of untouched cells; anything at or above this is unreachable.
pub const INIT_WEIGHT: f64 = 1.0e7;
/// Seed value at exit cells.
pub const EXIT_WEIGHT: f64 = 1.0;
/// Sentinel for blocked cells; distinct from `INIT_WEIGHT` and never the
/// minimum an agent selects because blocked cells are occupied.
pub const OBSTACLE_WEIGHT: f64 = -1.0e7;

/// The three parallel buffers owned by one exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitField {
    pub static_field: Vec<f64>,
    pub dynamic: Vec<f64>,
    pub combined: Vec<f64>,
}

impl ExitField {
    fn empty(len: usize) -> Self {
        Self {
            static_field: vec![INIT_WEIGHT; len],
            dynamic: vec![0.0; len],
            combined: vec![INIT_WEIGHT; len],
        }
    }
}

/// Aggregated floor field over all exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloorField {
    width: i32,
    height: i32,
    lambda: f64,
    kappa: f64,
    per_exit: Vec<ExitField>,
    cells: Vec<f64>,
}

impl FloorField {
    /// Construct an unsolved field for `n_exits` exits.
    #[must_use]
    pub fn new(width: i32, height: i32, lambda: f64, kappa: f64, n_exits: usize) -> Self {
        let len = (width as usize) * (height as usize);
        Self {
            width,
            height,
            lambda,
            kappa,
            per_exit: (0..n_exits).map(|_| ExitField::empty(len)).collect(),
            cells: vec![INIT_WEIGHT; len],
        }
    }

    #[must_use]
    pub const fn lambda(&self) -> f64 {
        self.lambda
    }

    #[must_use]
    pub const fn kappa(&self) -> f64 {
        self.kappa
    }

    /// The aggregate field agents navigate by.
    #[must_use]
    pub fn cells(&self) -> &[f64] {
        &self.cells
    }

    #[must_use]
    pub fn exit_count(&self) -> usize {
        self.per_exit.len()
    }

    /// Per-exit buffers, indexed by exit number.
    #[must_use]
    pub fn exit_field(&self, exit: usize) -> &ExitField {
        &self.per_exit[exit]
    }

    /// Drop all solved state and track a new exit count (topology edits).
    pub fn reset_exits(&mut self, n_exits: usize) {
        let len = (self.width as usize) * (self.height as usize);
        self.per_exit = (0..n_exits).map(|_| ExitField::empty(len)).collect();
        self.cells = vec![INIT_WEIGHT; len];
    }

    /// Recompute every per-exit static field. The exits are independent, so
    /// they fan out one rayon task each; no task touches an RNG.
    pub fn recompute_static(&mut self, exits: &[Exit], obstacles: &[Obstacle]) {
        debug_assert_eq!(exits.len(), self.per_exit.len());
        let (width, height, lambda) = (self.width, self.height, self.lambda);
        let fields: Vec<Vec<f64>> = (0..exits.len())
            .into_par_iter()
            .map(|i| compute_static(width, height, lambda, exits, obstacles, i))
            .collect();
        for (exit_field, static_field) in self.per_exit.iter_mut().zip(fields) {
            for (c, value) in static_field.iter().enumerate() {
                exit_field.combined[c] = value + exit_field.dynamic[c];
            }
            exit_field.static_field = static_field;
        }
        self.warn_on_saturation();
        self.aggregate();
    }

    /// Recompute the crowd-avoidance term for every exit and refresh the
    /// aggregate. `agent_cells` holds the linear cell index of each visible
    /// agent. A no-op when the coefficient is zero.
    pub fn recompute_dynamic(&mut self, exits: &[Exit], agent_cells: &[usize]) {
        if self.kappa <= 0.0 {
            return;
        }
        let kappa = self.kappa;
        let exit_sizes: Vec<usize> = exits.iter().map(|e| e.cells.len()).collect();
        self.per_exit
            .par_iter_mut()
            .zip(exit_sizes)
            .for_each(|(exit_field, exit_size)| {
                exit_field.dynamic =
                    compute_dynamic(&exit_field.static_field, agent_cells, kappa, exit_size);
                for c in 0..exit_field.combined.len() {
                    exit_field.combined[c] = exit_field.static_field[c] + exit_field.dynamic[c];
                }
            });
        self.aggregate();
    }

    /// `cells[c] = min_i combined_i[c]`, skipping exits blocked at `c`.
    /// Cells blocked in every field aggregate to the obstacle sentinel.
    fn aggregate(&mut self) {
        for c in 0..self.cells.len() {
            let mut best = f64::INFINITY;
            for exit_field in &self.per_exit {
                if exit_field.static_field[c] == OBSTACLE_WEIGHT {
                    continue;
                }
                if exit_field.combined[c] < best {
                    best = exit_field.combined[c];
                }
            }
            self.cells[c] = if best.is_finite() {
                best
            } else {
                OBSTACLE_WEIGHT
            };
        }
    }

    /// A region the relaxation never reached stays at `INIT_WEIGHT`; agents
    /// caught there simply never move. Non-fatal, but worth a line.
    fn warn_on_saturation(&self) {
        let saturated = (0..self.cells.len())
            .filter(|&c| {
                let mut unreached = false;
                for exit_field in &self.per_exit {
                    let s = exit_field.static_field[c];
                    if s == OBSTACLE_WEIGHT {
                        continue;
                    }
                    if s >= INIT_WEIGHT {
                        unreached = true;
                    } else {
                        return false;
                    }
                }
                unreached
            })
            .count();
        if saturated > 0 {
            warn!(
                cells = saturated,
                "static floor field saturated: some cells are unreachable from every exit"
            );
        }
    }
}

/// Static field for exit `exit_index`: obstacle cells and the cells of every
/// other exit are blockers, the exit's own cells seed at `EXIT_WEIGHT`, and
/// values relax outward with axial weight 1 and diagonal weight lambda.
pub(crate) fn compute_static(
    width: i32,
    height: i32,
    lambda: f64,
    exits: &[Exit],
    obstacles: &[Obstacle],
    exit_index: usize,
) -> Vec<f64> {
    let len = (width as usize) * (height as usize);
    let mut field = vec![INIT_WEIGHT; len];
    let index = |c: Coord| (c.y as usize) * (width as usize) + (c.x as usize);
    for obstacle in obstacles {
        field[index(obstacle.position)] = OBSTACLE_WEIGHT;
    }
    for (j, exit) in exits.iter().enumerate() {
        let value = if j == exit_index {
            EXIT_WEIGHT
        } else {
            OBSTACLE_WEIGHT
        };
        for &cell in &exit.cells {
            field[index(cell)] = value;
        }
    }
    relax(width, height, lambda, &mut field, &exits[exit_index].cells);
    field
}

/// Customized field for a volunteer: the target obstacle is the attractor
/// and every exit is a blocker, so the volunteer routes to the obstacle
/// first.
pub(crate) fn compute_attractor(
    width: i32,
    height: i32,
    lambda: f64,
    exits: &[Exit],
    obstacles: &[Obstacle],
    target: usize,
) -> Vec<f64> {
    let len = (width as usize) * (height as usize);
    let mut field = vec![INIT_WEIGHT; len];
    let index = |c: Coord| (c.y as usize) * (width as usize) + (c.x as usize);
    for exit in exits {
        for &cell in &exit.cells {
            field[index(cell)] = OBSTACLE_WEIGHT;
        }
    }
    for (i, obstacle) in obstacles.iter().enumerate() {
        if i != target {
            field[index(obstacle.position)] = OBSTACLE_WEIGHT;
        }
    }
    let seed = obstacles[target].position;
    field[index(seed)] = EXIT_WEIGHT;
    relax(width, height, lambda, &mut field, &[seed]);
    field
}

/// Anticipation field: the exit-aggregated static potential computed as if
/// obstacle `skip` were already gone. Used to score drop-off cells.
pub(crate) fn compute_anticipation(
    width: i32,
    height: i32,
    lambda: f64,
    exits: &[Exit],
    obstacles: &[Obstacle],
    skip: usize,
) -> Vec<f64> {
    let remaining: Vec<Obstacle> = obstacles
        .iter()
        .enumerate()
        .filter_map(|(i, &o)| (i != skip).then_some(o))
        .collect();
    let fields: Vec<Vec<f64>> = (0..exits.len())
        .into_par_iter()
        .map(|i| compute_static(width, height, lambda, exits, &remaining, i))
        .collect();

    let len = (width as usize) * (height as usize);
    let mut cells = vec![OBSTACLE_WEIGHT; len];
    for (c, aggregate) in cells.iter_mut().enumerate() {
        let mut best = f64::INFINITY;
        for field in &fields {
            if field[c] == OBSTACLE_WEIGHT {
                continue;
            }
            if field[c] < best {
                best = field[c];
            }
        }
        if best.is_finite() {
            *aggregate = best;
        }
    }
    cells
}

/// FIFO relaxation over the 8-connected grid. Not Dijkstra: a cell may be
/// enqueued several times, but with positive weights the fixpoint equals the
/// shortest-path distance from the seed set.
fn relax(width: i32, height: i32, lambda: f64, field: &mut [f64], seeds: &[Coord]) {
    let index = |x: i32, y: i32| (y as usize) * (width as usize) + (x as usize);
    let mut queue: VecDeque<Coord> = seeds.iter().copied().collect();
    while let Some(u) = queue.pop_front() {
        let base = field[index(u.x, u.y)];
        for (dx, dy) in MOORE_OFFSETS {
            let (nx, ny) = (u.x + dx, u.y + dy);
            if nx < 0 || nx >= width || ny < 0 || ny >= height {
                continue;
            }
            let v = index(nx, ny);
            if field[v] == OBSTACLE_WEIGHT {
                continue;
            }
            let weight = if dx != 0 && dy != 0 { lambda } else { 1.0 };
            let candidate = base + weight;
            if candidate < field[v] {
                field[v] = candidate;
                queue.push_back(Coord::new(nx, ny));
            }
        }
    }
}

/// Crowd-avoidance term for one exit: cells lying "behind" many agents (a
/// larger static value than theirs) are penalized, scaled by the exit width.
fn compute_dynamic(
    static_field: &[f64],
    agent_cells: &[usize],
    kappa: f64,
    exit_size: usize,
) -> Vec<f64> {
    let mut dynamic = vec![0.0; static_field.len()];
    if agent_cells.is_empty() {
        return dynamic;
    }
    let agent_values: Vec<f64> = agent_cells.iter().map(|&c| static_field[c]).collect();
    let max_agent = agent_values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let total = agent_values.len() as f64;
    let denom = exit_size.max(1) as f64;
    for (c, out) in dynamic.iter_mut().enumerate() {
        let s = static_field[c];
        if s == OBSTACLE_WEIGHT {
            continue;
        }
        let (passed, equal) = if s > max_agent {
            (total, 0.0)
        } else {
            let mut passed = 0.0;
            let mut equal = 0.0;
            for &value in &agent_values {
                if s > value {
                    passed += 1.0;
                } else if s == value {
                    equal += 1.0;
                }
            }
            (passed, equal)
        };
        *out = kappa * (passed + 0.5 * equal) / denom;
    }
    dynamic
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit_at(cells: &[(i32, i32)]) -> Exit {
        Exit::new(cells.iter().map(|&(x, y)| Coord::new(x, y)).collect())
    }

    #[test]
    fn static_field_equals_weighted_shortest_path_on_open_grid() {
        let exits = vec![exit_at(&[(0, 0)])];
        let field = compute_static(5, 5, 1.5, &exits, &[], 0);
        let origin = Coord::new(0, 0);
        for y in 0..5 {
            for x in 0..5 {
                let expected = EXIT_WEIGHT + Coord::new(x, y).diagonal_distance(origin, 1.5);
                let got = field[(y as usize) * 5 + x as usize];
                assert!(
                    (got - expected).abs() < 1e-9,
                    "cell ({x},{y}): got {got}, expected {expected}"
                );
            }
        }
    }

    #[test]
    fn static_field_routes_around_obstacles() {
        // 5x3, exit right-center, full wall column at x=2 except y=0.
        let exits = vec![exit_at(&[(4, 1)])];
        let obstacles = vec![
            Obstacle {
                position: Coord::new(2, 1),
                movable: false,
            },
            Obstacle {
                position: Coord::new(2, 2),
                movable: false,
            },
        ];
        let field = compute_static(5, 3, 1.5, &exits, &obstacles, 0);
        let at = |x: i32, y: i32| field[(y as usize) * 5 + x as usize];
        assert_eq!(at(2, 1), OBSTACLE_WEIGHT);
        assert_eq!(at(2, 2), OBSTACLE_WEIGHT);
        // Detour through (2,0): exit=1, (3,1)=2.5, (2,0)=3.5, (1,1)=5.0.
        assert!((at(3, 1) - 2.5).abs() < 1e-9);
        assert!((at(2, 0) - 3.5).abs() < 1e-9);
        assert!((at(1, 1) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn unreachable_cells_stay_saturated() {
        // Wall splits the corridor; the left half never relaxes.
        let exits = vec![exit_at(&[(4, 0)])];
        let obstacles = vec![Obstacle {
            position: Coord::new(2, 0),
            movable: false,
        }];
        let field = compute_static(5, 1, 1.5, &exits, &obstacles, 0);
        assert_eq!(field[0], INIT_WEIGHT);
        assert_eq!(field[1], INIT_WEIGHT);
        assert_eq!(field[2], OBSTACLE_WEIGHT);
        assert!(field[3] < INIT_WEIGHT);
    }

    #[test]
    fn aggregate_skips_foreign_exit_sentinels() {
        let exits = vec![exit_at(&[(0, 0)]), exit_at(&[(4, 0)])];
        let mut field = FloorField::new(5, 1, 1.5, 0.0, 2);
        field.recompute_static(&exits, &[]);
        // Exit cells keep their own exit's seed value instead of the foreign
        // sentinel, and the midpoint sees the nearer of the two exits.
        assert!((field.cells()[0] - EXIT_WEIGHT).abs() < 1e-9);
        assert!((field.cells()[4] - EXIT_WEIGHT).abs() < 1e-9);
        assert!((field.cells()[2] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn dynamic_term_penalizes_cells_behind_the_crowd() {
        let exits = vec![exit_at(&[(4, 0)])];
        let mut field = FloorField::new(5, 1, 1.5, 2.0, 1);
        field.recompute_static(&exits, &[]);
        // One agent at x=2 (static value 3).
        field.recompute_dynamic(&exits, &[2]);
        let dynamic = &field.exit_field(0).dynamic;
        assert_eq!(dynamic[3], 0.0, "cells ahead of the crowd are free");
        assert!((dynamic[2] - 1.0).abs() < 1e-9, "own cell counts as equal");
        assert!((dynamic[0] - 2.0).abs() < 1e-9, "cells behind pay full price");
        assert!((field.cells()[0] - 7.0).abs() < 1e-9);
    }

    #[test]
    fn attractor_field_treats_exits_as_walls() {
        let exits = vec![exit_at(&[(4, 0)])];
        let obstacles = vec![Obstacle {
            position: Coord::new(2, 0),
            movable: true,
        }];
        let field = compute_attractor(5, 1, 1.5, &exits, &obstacles, 0);
        assert_eq!(field[4], OBSTACLE_WEIGHT);
        assert!((field[2] - EXIT_WEIGHT).abs() < 1e-9);
        assert!((field[0] - 3.0).abs() < 1e-9);
        // The cell between obstacle and exit is reachable but a dead end.
        assert!((field[3] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn anticipation_field_ignores_the_lifted_obstacle() {
        let exits = vec![exit_at(&[(4, 0)])];
        let obstacles = vec![Obstacle {
            position: Coord::new(2, 0),
            movable: true,
        }];
        let aff = compute_anticipation(5, 1, 1.5, &exits, &obstacles, 0);
        // With the obstacle lifted the corridor is fully walkable.
        for (c, expected) in [(0usize, 5.0), (1, 4.0), (2, 3.0), (3, 2.0), (4, 1.0)] {
            assert!((aff[c] - expected).abs() < 1e-9, "cell {c}");
        }
    }
}
