//! Discrete grid storage: cell states, occupancy mask, neighborhoods.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::SimError;
use crate::agent::Agent;

/// All 8 Moore offsets: E, W, N, S, NE, SW, SE, NW.
///
/// The scan order matches the candidate-collection order of the movement
/// rule, so intention tie sets are always assembled identically.
pub const MOORE_OFFSETS: [(i32, i32); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (-1, -1),
    (1, -1),
    (-1, 1),
];

/// Integer cell coordinate with `x` horizontal.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl Coord {
    /// Construct a new coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chebyshev (L-inf) distance; 1 means Moore-adjacent.
    #[must_use]
    pub fn chebyshev(self, other: Self) -> i32 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }

    /// Squared Euclidean distance between cell centers.
    #[must_use]
    pub fn dist_sq(self, other: Self) -> f64 {
        let dx = f64::from(self.x - other.x);
        let dy = f64::from(self.y - other.y);
        dx * dx + dy * dy
    }

    /// Length of the shortest 8-connected path to `other` with axial cost
    /// 1 and diagonal cost `lambda`.
    #[must_use]
    pub fn diagonal_distance(self, other: Self, lambda: f64) -> f64 {
        let dx = (self.x - other.x).abs();
        let dy = (self.y - other.y).abs();
        let diag = dx.min(dy);
        let axial = (dx - dy).abs();
        lambda * f64::from(diag) + f64::from(axial)
    }
}

/// What a grid cell structurally contains.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum CellState {
    #[default]
    Empty,
    /// Cell belongs to exit `i`.
    Exit(usize),
    MovableObstacle,
    ImmovableObstacle,
}

/// A non-empty 4-connected set of exit cells.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Exit {
    pub cells: Vec<Coord>,
}

impl Exit {
    #[must_use]
    pub fn new(cells: Vec<Coord>) -> Self {
        Self { cells }
    }
}

/// An obstacle occupying a single cell.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Obstacle {
    pub position: Coord,
    pub movable: bool,
}

/// Rectangular grid with linear `y * width + x` storage.
///
/// The cell-state buffer and the occupancy mask are parallel arrays; both
/// are only mutated between CA steps, never during intention formation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grid {
    width: i32,
    height: i32,
    cell_size: (f64, f64),
    states: Vec<CellState>,
    occupied: Vec<bool>,
}

impl Grid {
    /// Construct an empty grid.
    pub fn new(width: i32, height: i32, cell_size: (f64, f64)) -> Result<Self, SimError> {
        if width <= 0 || height <= 0 {
            return Err(SimError::InvalidConfig("grid dimensions must be positive"));
        }
        let len = (width as usize) * (height as usize);
        Ok(Self {
            width,
            height,
            cell_size,
            states: vec![CellState::Empty; len],
            occupied: vec![false; len],
        })
    }

    #[must_use]
    pub const fn width(&self) -> i32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> i32 {
        self.height
    }

    #[must_use]
    pub const fn cell_size(&self) -> (f64, f64) {
        self.cell_size
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    #[must_use]
    pub const fn in_bounds(&self, coord: Coord) -> bool {
        coord.x >= 0 && coord.x < self.width && coord.y >= 0 && coord.y < self.height
    }

    /// Linear index for an in-bounds coordinate.
    #[inline]
    #[must_use]
    pub const fn index(&self, coord: Coord) -> usize {
        (coord.y as usize) * (self.width as usize) + (coord.x as usize)
    }

    /// Coordinate for a linear index.
    #[inline]
    #[must_use]
    pub const fn coord(&self, index: usize) -> Coord {
        Coord::new(
            (index % (self.width as usize)) as i32,
            (index / (self.width as usize)) as i32,
        )
    }

    #[must_use]
    pub fn state_at(&self, coord: Coord) -> CellState {
        self.states[self.index(coord)]
    }

    pub fn set_state(&mut self, coord: Coord, state: CellState) {
        let idx = self.index(coord);
        self.states[idx] = state;
    }

    #[must_use]
    pub fn is_occupied(&self, coord: Coord) -> bool {
        self.occupied[self.index(coord)]
    }

    pub fn set_occupied(&mut self, coord: Coord, occupied: bool) {
        let idx = self.index(coord);
        self.occupied[idx] = occupied;
    }

    #[must_use]
    pub fn states(&self) -> &[CellState] {
        &self.states
    }

    /// In-bounds Moore neighbors of `coord`, in scan order.
    #[must_use]
    pub fn moore_neighbors(&self, coord: Coord) -> SmallVec<[Coord; 8]> {
        let mut out = SmallVec::new();
        for (dx, dy) in MOORE_OFFSETS {
            let n = Coord::new(coord.x + dx, coord.y + dy);
            if self.in_bounds(n) {
                out.push(n);
            }
        }
        out
    }

    /// Rewrite the cell-state buffer from the exit and obstacle lists.
    pub fn rebuild_states(&mut self, exits: &[Exit], obstacles: &[Obstacle]) {
        self.states.fill(CellState::Empty);
        for (i, exit) in exits.iter().enumerate() {
            for &cell in &exit.cells {
                let idx = self.index(cell);
                self.states[idx] = CellState::Exit(i);
            }
        }
        for obstacle in obstacles {
            let idx = self.index(obstacle.position);
            self.states[idx] = if obstacle.movable {
                CellState::MovableObstacle
            } else {
                CellState::ImmovableObstacle
            };
        }
    }

    /// Rebuild the occupancy mask from scratch: obstacle cells plus the
    /// cells of visible agents. Exit cells stay walkable.
    pub fn rebuild_occupancy(&mut self, agents: &[Agent]) {
        for (idx, state) in self.states.iter().enumerate() {
            self.occupied[idx] = matches!(
                state,
                CellState::MovableObstacle | CellState::ImmovableObstacle
            );
        }
        for agent in agents {
            if agent.visible {
                let idx = self.index(agent.position);
                self.occupied[idx] = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, Strategy};

    #[test]
    fn linear_indexing_round_trips() {
        let grid = Grid::new(7, 3, (1.0, 1.0)).expect("grid");
        assert_eq!(grid.len(), 21);
        let c = Coord::new(4, 2);
        assert_eq!(grid.index(c), 2 * 7 + 4);
        assert_eq!(grid.coord(grid.index(c)), c);
    }

    #[test]
    fn rejects_degenerate_dimensions() {
        assert!(Grid::new(0, 5, (1.0, 1.0)).is_err());
        assert!(Grid::new(5, -1, (1.0, 1.0)).is_err());
    }

    #[test]
    fn moore_neighbors_clip_at_borders() {
        let grid = Grid::new(3, 3, (1.0, 1.0)).expect("grid");
        assert_eq!(grid.moore_neighbors(Coord::new(1, 1)).len(), 8);
        assert_eq!(grid.moore_neighbors(Coord::new(0, 0)).len(), 3);
        assert_eq!(grid.moore_neighbors(Coord::new(2, 1)).len(), 5);
    }

    #[test]
    fn occupancy_covers_obstacles_and_visible_agents() {
        let mut grid = Grid::new(4, 1, (1.0, 1.0)).expect("grid");
        let exits = vec![Exit::new(vec![Coord::new(3, 0)])];
        let obstacles = vec![Obstacle {
            position: Coord::new(1, 0),
            movable: true,
        }];
        grid.rebuild_states(&exits, &obstacles);

        let mut walker = Agent::new(Coord::new(0, 0), Strategy::new(0.5, 0.5));
        let mut gone = Agent::new(Coord::new(2, 0), Strategy::new(0.5, 0.5));
        gone.visible = false;
        grid.rebuild_occupancy(&[walker.clone(), gone]);

        assert!(grid.is_occupied(Coord::new(0, 0)));
        assert!(grid.is_occupied(Coord::new(1, 0)));
        assert!(!grid.is_occupied(Coord::new(2, 0)));
        // Exit cells never block movement.
        assert!(!grid.is_occupied(Coord::new(3, 0)));

        walker.visible = false;
        grid.rebuild_occupancy(&[walker]);
        assert!(!grid.is_occupied(Coord::new(0, 0)));
    }

    #[test]
    fn diagonal_distance_mixes_axial_and_diagonal_steps() {
        let a = Coord::new(0, 0);
        assert_eq!(a.diagonal_distance(Coord::new(3, 0), 1.5), 3.0);
        assert_eq!(a.diagonal_distance(Coord::new(2, 2), 1.5), 3.0);
        assert_eq!(a.diagonal_distance(Coord::new(3, 1), 1.5), 3.5);
    }
}
