//! Game-theoretic conflict resolution for contested cells.
//!
//! Two games exist: the yielder game among evacuees (raw strategy draws) and
//! the volunteer game (logit best-response on expected utilities). Both
//! report per-contestant realized and counterfactual payoffs so the caller
//! can drive strategy updates.

use rand::Rng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::agent::AgentId;

/// Bound on the logit exponent `beta * (U_coop - U_defect)`.
pub const LOGIT_CLAMP: f64 = 50.0;

/// Parameters of the conflict game.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GameParams {
    /// Rationality `beta` of the logit best-response rule.
    pub rationality: f64,
    /// Probability of copying a better-scoring neighbor instead of updating
    /// by best-response.
    pub herding: f64,
    /// Payoff for cooperating while exactly one contestant insists.
    pub reward_cooperate: f64,
    /// Cost borne by every insisting contestant when two or more collide.
    pub cost_conflict: f64,
}

/// Per-contestant result of one resolved conflict.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ContestantOutcome {
    pub id: AgentId,
    pub defected: bool,
    pub realized: f64,
    pub counterfactual: f64,
}

/// Result of one conflict: the winner (if any motion happens), the payoff
/// bookkeeping, and how many logit exponents had to be clamped.
#[derive(Debug, Clone)]
pub(crate) struct ConflictOutcome {
    pub winner: Option<AgentId>,
    pub contestants: SmallVec<[ContestantOutcome; 8]>,
    pub clamp_events: u32,
}

/// `P(defect) = 1 / (1 + exp(beta * (u_coop - u_defect)))`, with the
/// exponent clamped to `[-LOGIT_CLAMP, LOGIT_CLAMP]`. The second value
/// reports whether clamping occurred.
#[must_use]
pub fn defect_probability(rationality: f64, u_coop: f64, u_defect: f64) -> (f64, bool) {
    let z = rationality * (u_coop - u_defect);
    let clamped = z.abs() > LOGIT_CLAMP;
    let z = z.clamp(-LOGIT_CLAMP, LOGIT_CLAMP);
    (1.0 / (1.0 + z.exp()), clamped)
}

/// Payoff actually received, given how many contestants insisted in total.
fn realized_payoff(defected: bool, defectors: usize, params: &GameParams) -> f64 {
    if defected {
        if defectors == 1 {
            1.0
        } else {
            -params.cost_conflict
        }
    } else if defectors == 1 {
        params.reward_cooperate
    } else {
        0.0
    }
}

/// Payoff the contestant would have received flipping only its own action.
fn counterfactual_payoff(defected: bool, defectors: usize, params: &GameParams) -> f64 {
    if defected {
        if defectors == 2 {
            // The remaining defector would have won cleanly.
            params.reward_cooperate
        } else {
            0.0
        }
    } else if defectors == 0 {
        1.0
    } else {
        -params.cost_conflict
    }
}

fn build_outcome(
    contestants: &[(AgentId, f64)],
    defect_flags: &[bool],
    winner: Option<AgentId>,
    params: &GameParams,
    clamp_events: u32,
) -> ConflictOutcome {
    let defectors = defect_flags.iter().filter(|&&d| d).count();
    let contestants = contestants
        .iter()
        .zip(defect_flags)
        .map(|(&(id, _), &defected)| ContestantOutcome {
            id,
            defected,
            realized: realized_payoff(defected, defectors, params),
            counterfactual: counterfactual_payoff(defected, defectors, params),
        })
        .collect();
    ConflictOutcome {
        winner,
        contestants,
        clamp_events,
    }
}

/// Yielder game: every contestant draws "insist" straight from its strategy.
/// Exactly one insister wins; zero or several means nobody moves.
pub(crate) fn resolve_yielder(
    contestants: &[(AgentId, f64)],
    params: &GameParams,
    rng: &mut SmallRng,
) -> ConflictOutcome {
    let defect_flags: Vec<bool> = contestants
        .iter()
        .map(|&(_, p_volunteer)| rng.random_bool(p_volunteer.clamp(0.0, 1.0)))
        .collect();
    let winner = single_defector(contestants, &defect_flags);
    build_outcome(contestants, &defect_flags, winner, params, 0)
}

/// Volunteer game: expected utilities feed the logit rule, the defectors
/// are drawn per-agent, and the winner is sampled among them weighted by
/// their defect probabilities.
pub(crate) fn resolve_volunteer(
    contestants: &[(AgentId, f64)],
    params: &GameParams,
    rng: &mut SmallRng,
) -> ConflictOutcome {
    let k = contestants.len();
    let mut clamp_events = 0;
    let mut probabilities: SmallVec<[f64; 8]> = SmallVec::with_capacity(k);
    for i in 0..k {
        // q: nobody else insists; win_alone: exactly one other insists.
        let mut q = 1.0;
        for (j, &(_, p)) in contestants.iter().enumerate() {
            if j != i {
                q *= 1.0 - p;
            }
        }
        let mut win_alone = 0.0;
        for (j, &(_, p_j)) in contestants.iter().enumerate() {
            if j == i {
                continue;
            }
            let mut rest = p_j;
            for (l, &(_, p_l)) in contestants.iter().enumerate() {
                if l != i && l != j {
                    rest *= 1.0 - p_l;
                }
            }
            win_alone += rest;
        }
        let u_defect = q - (1.0 - q) * params.cost_conflict;
        let u_coop = params.reward_cooperate * win_alone;
        let (p_defect, clamped) = defect_probability(params.rationality, u_coop, u_defect);
        if clamped {
            clamp_events += 1;
        }
        probabilities.push(p_defect);
    }

    let defect_flags: Vec<bool> = probabilities
        .iter()
        .map(|&p| rng.random_bool(p.clamp(0.0, 1.0)))
        .collect();

    let total_weight: f64 = probabilities
        .iter()
        .zip(&defect_flags)
        .filter(|&(_, &d)| d)
        .map(|(&p, _)| p)
        .sum();
    let winner = if total_weight > 0.0 {
        let mut draw = rng.random::<f64>() * total_weight;
        let mut winner = None;
        for ((&(id, _), &p), &defected) in contestants
            .iter()
            .zip(&probabilities)
            .zip(&defect_flags)
        {
            if !defected {
                continue;
            }
            draw -= p;
            winner = Some(id);
            if draw <= 0.0 {
                break;
            }
        }
        winner
    } else {
        None
    };

    build_outcome(contestants, &defect_flags, winner, params, clamp_events)
}

fn single_defector(contestants: &[(AgentId, f64)], defect_flags: &[bool]) -> Option<AgentId> {
    let mut winner = None;
    for (&(id, _), &defected) in contestants.iter().zip(defect_flags) {
        if defected {
            if winner.is_some() {
                return None;
            }
            winner = Some(id);
        }
    }
    winner
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn params() -> GameParams {
        GameParams {
            rationality: 1.0,
            herding: 0.0,
            reward_cooperate: 0.5,
            cost_conflict: 1.0,
        }
    }

    #[test]
    fn lone_insister_wins_the_yielder_game() {
        let mut rng = SmallRng::seed_from_u64(1);
        let outcome = resolve_yielder(&[(0, 1.0), (1, 0.0)], &params(), &mut rng);
        assert_eq!(outcome.winner, Some(0));
        let by_id = |id: AgentId| outcome.contestants.iter().find(|c| c.id == id).unwrap();
        assert!((by_id(0).realized - 1.0).abs() < 1e-12);
        assert!((by_id(0).counterfactual - 0.0).abs() < 1e-12);
        assert!((by_id(1).realized - 0.5).abs() < 1e-12);
        assert!((by_id(1).counterfactual + 1.0).abs() < 1e-12);
    }

    #[test]
    fn mutual_insistence_blocks_everyone() {
        let mut rng = SmallRng::seed_from_u64(1);
        let outcome = resolve_yielder(&[(0, 1.0), (1, 1.0), (2, 1.0)], &params(), &mut rng);
        assert_eq!(outcome.winner, None);
        for contestant in &outcome.contestants {
            assert!(contestant.defected);
            assert!((contestant.realized + 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn all_yielders_means_no_motion() {
        let mut rng = SmallRng::seed_from_u64(1);
        let outcome = resolve_yielder(&[(0, 0.0), (1, 0.0)], &params(), &mut rng);
        assert_eq!(outcome.winner, None);
        for contestant in &outcome.contestants {
            assert!(!contestant.defected);
            assert_eq!(contestant.realized, 0.0);
            // Flipping alone would have won the cell.
            assert_eq!(contestant.counterfactual, 1.0);
        }
    }

    #[test]
    fn zero_rationality_is_a_coin_flip() {
        let (p, clamped) = defect_probability(0.0, 5.0, -5.0);
        assert!((p - 0.5).abs() < 1e-12);
        assert!(!clamped);
    }

    #[test]
    fn extreme_exponents_are_clamped() {
        let (p, clamped) = defect_probability(100.0, 10.0, -10.0);
        assert!(clamped);
        assert!(p > 0.0, "clamped logit stays finite and positive");
        let (p, clamped) = defect_probability(100.0, -10.0, 10.0);
        assert!(clamped);
        assert!(p < 1.0 + 1e-12 && p > 1.0 - 1e-6);
    }

    #[test]
    fn volunteer_game_is_deterministic_under_a_fixed_seed() {
        let contestants = [(0, 0.6), (1, 0.4), (2, 0.8)];
        let a = resolve_volunteer(&contestants, &params(), &mut SmallRng::seed_from_u64(7));
        let b = resolve_volunteer(&contestants, &params(), &mut SmallRng::seed_from_u64(7));
        assert_eq!(a.winner, b.winner);
        let flags_a: Vec<bool> = a.contestants.iter().map(|c| c.defected).collect();
        let flags_b: Vec<bool> = b.contestants.iter().map(|c| c.defected).collect();
        assert_eq!(flags_a, flags_b);
    }

    #[test]
    fn volunteer_winner_is_always_a_defector() {
        for seed in 0..32 {
            let mut rng = SmallRng::seed_from_u64(seed);
            let outcome = resolve_volunteer(&[(0, 0.5), (1, 0.5)], &params(), &mut rng);
            if let Some(winner) = outcome.winner {
                assert!(
                    outcome
                        .contestants
                        .iter()
                        .any(|c| c.id == winner && c.defected)
                );
            } else {
                let defectors = outcome.contestants.iter().filter(|c| c.defected).count();
                assert_eq!(defectors, 0);
            }
        }
    }
}
