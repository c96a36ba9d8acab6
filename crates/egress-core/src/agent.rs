//! Per-agent state: role, strategy distribution, payoff history.

use serde::{Deserialize, Serialize};

use crate::grid::Coord;

/// Dense index into the simulation's agent vector.
///
/// The population is fixed at startup and agents are only ever made
/// invisible, so plain indices double as the stable draw order required
/// for reproducible runs.
pub type AgentId = usize;

/// What an agent is currently doing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Role {
    Evacuee,
    /// Temporarily tasked with relocating obstacle `target`; `field` is the
    /// customized floor field seeded at the obstacle.
    Volunteer { target: usize, field: Vec<f64> },
}

/// Mixed strategy over {yield, insist}; the two weights always sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Strategy {
    pub yielder: f64,
    pub volunteer: f64,
}

impl Strategy {
    /// Build a strategy from raw weights, normalizing their sum to 1.
    #[must_use]
    pub fn new(yielder: f64, volunteer: f64) -> Self {
        let sum = yielder + volunteer;
        if sum > 0.0 {
            Self {
                yielder: yielder / sum,
                volunteer: volunteer / sum,
            }
        } else {
            Self {
                yielder: 0.5,
                volunteer: 0.5,
            }
        }
    }

    /// Set the insist probability, keeping the distribution normalized.
    pub fn set_volunteer(&mut self, p: f64) {
        let p = p.clamp(0.0, 1.0);
        self.volunteer = p;
        self.yielder = 1.0 - p;
    }
}

/// Running sums of realized and counterfactual payoffs, split by action.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PayoffHistory {
    pub total: f64,
    pub yield_sum: f64,
    pub yield_count: u32,
    pub defect_sum: f64,
    pub defect_count: u32,
}

impl PayoffHistory {
    /// Record one resolved conflict: the realized payoff feeds the taken
    /// action, the counterfactual feeds the other.
    pub fn record(&mut self, defected: bool, realized: f64, counterfactual: f64) {
        self.total += realized;
        if defected {
            self.defect_sum += realized;
            self.defect_count += 1;
            self.yield_sum += counterfactual;
            self.yield_count += 1;
        } else {
            self.yield_sum += realized;
            self.yield_count += 1;
            self.defect_sum += counterfactual;
            self.defect_count += 1;
        }
    }

    #[must_use]
    pub fn average_yield(&self) -> f64 {
        if self.yield_count == 0 {
            0.0
        } else {
            self.yield_sum / f64::from(self.yield_count)
        }
    }

    #[must_use]
    pub fn average_defect(&self) -> f64 {
        if self.defect_count == 0 {
            0.0
        } else {
            self.defect_sum / f64::from(self.defect_count)
        }
    }
}

/// One pedestrian.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub position: Coord,
    pub role: Role,
    pub strategy: Strategy,
    pub payoffs: PayoffHistory,
    /// False once the agent has reached an exit.
    pub visible: bool,
    /// Redrawn every step; a panicked agent skips its move.
    pub in_panic: bool,
    /// Nearby leader imitated under herding, if any.
    pub companion: Option<AgentId>,
    pub travel_timesteps: u32,
    /// Index of the exit that absorbed the agent.
    pub exited_via: Option<usize>,
}

impl Agent {
    /// Create a fresh evacuee at `position`.
    #[must_use]
    pub fn new(position: Coord, strategy: Strategy) -> Self {
        Self {
            position,
            role: Role::Evacuee,
            strategy,
            payoffs: PayoffHistory::default(),
            visible: true,
            in_panic: false,
            companion: None,
            travel_timesteps: 0,
            exited_via: None,
        }
    }

    #[must_use]
    pub fn is_volunteer(&self) -> bool {
        matches!(self.role, Role::Volunteer { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_stays_normalized() {
        let s = Strategy::new(3.0, 1.0);
        assert!((s.yielder - 0.75).abs() < 1e-12);
        assert!((s.volunteer - 0.25).abs() < 1e-12);

        let mut s = Strategy::new(0.0, 0.0);
        assert_eq!(s.yielder, 0.5);
        s.set_volunteer(1.3);
        assert_eq!(s.volunteer, 1.0);
        assert_eq!(s.yielder, 0.0);
    }

    #[test]
    fn payoff_history_splits_by_action() {
        let mut history = PayoffHistory::default();
        history.record(true, 1.0, 0.2);
        history.record(false, 0.0, -0.5);
        assert!((history.total - 1.0).abs() < 1e-12);
        assert_eq!(history.defect_count, 2);
        assert_eq!(history.yield_count, 2);
        assert!((history.average_defect() - 0.25).abs() < 1e-12);
        assert!((history.average_yield() - 0.1).abs() < 1e-12);
    }
}
