//! Upper Confidence bound for Trees, with a failure penalty and tool-priority
//! scaling for the root's children.

use crate::tree::NodeStats;

/// Tunables for [`uct_value`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UctParams {
    pub exploration_constant: f64,
    /// Failures up to this count are free.
    pub failure_offset: f64,
    pub failure_penalty_weight: f64,
}

/// Global score range observed so far in the run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreRange {
    pub best: Option<f64>,
    pub worst: Option<f64>,
}

/// UCT of a non-root node given its own and its parent's statistics.
///
/// Unvisited nodes score `+inf`.
pub fn uct_value(
    stats: &NodeStats,
    parent_visits: u32,
    range: ScoreRange,
    params: &UctParams,
    exploration_constant: f64,
) -> f64 {
    if stats.visits == 0 {
        return f64::INFINITY;
    }
    let visits = f64::from(stats.visits);
    let parent_visits = f64::from(parent_visits.max(1));

    let excess_failures = (f64::from(stats.failure_visits) - params.failure_offset).max(0.0);
    let failure = -params.failure_penalty_weight * excess_failures / visits;

    let validated = if stats.validated_visits > 0 {
        let share = f64::from(stats.validated_visits) / visits;
        match (range.best, range.worst) {
            (Some(best), Some(worst)) if best > worst => {
                let avg = stats.validated_reward / f64::from(stats.validated_visits);
                share * (avg - worst) / (best - worst)
            }
            _ => 1.0,
        }
    } else {
        0.0
    };

    let exploitation = failure + validated;
    let exploration = exploration_constant * (parent_visits.ln() / visits).sqrt();
    exploitation + exploration
}

/// Exploration constant for a root child whose tool sits at `priority` in the
/// available-tools list. Unknown tools get the base constant.
pub fn root_exploration_constant(base: f64, priority: Option<usize>) -> f64 {
    match priority {
        Some(index) => base * (1.0 - 0.25 * index as f64).max(0.25),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> UctParams {
        UctParams {
            exploration_constant: 1.414,
            failure_offset: 0.0,
            failure_penalty_weight: 1.0,
        }
    }

    fn stats(visits: u32, validated: u32, failures: u32, reward: f64) -> NodeStats {
        NodeStats {
            visits,
            validated_visits: validated,
            unvalidated_visits: visits - validated - failures,
            failure_visits: failures,
            validated_reward: reward,
        }
    }

    #[test]
    fn unvisited_node_is_infinite() {
        let value = uct_value(&NodeStats::default(), 3, ScoreRange::default(), &params(), 1.0);
        assert!(value.is_infinite() && value > 0.0);
    }

    #[test]
    fn equal_best_and_worst_gives_full_credit() {
        let range = ScoreRange {
            best: Some(0.5),
            worst: Some(0.5),
        };
        let value = uct_value(&stats(1, 1, 0, 0.5), 1, range, &params(), 0.0);
        assert!((value - 1.0).abs() < 1e-12);
        assert!(!value.is_nan());
    }

    #[test]
    fn validated_reward_is_normalised_by_range() {
        let range = ScoreRange {
            best: Some(1.0),
            worst: Some(0.0),
        };
        // Two visits, one validated at 0.5: share 0.5 * normalised 0.5.
        let value = uct_value(&stats(2, 1, 0, 0.5), 1, range, &params(), 0.0);
        assert!((value - 0.25).abs() < 1e-12);
    }

    #[test]
    fn failures_beyond_offset_are_penalised() {
        let mut p = params();
        p.failure_offset = 1.0;
        p.failure_penalty_weight = 2.0;
        let value = uct_value(&stats(4, 0, 3, 0.0), 1, ScoreRange::default(), &p, 0.0);
        assert!((value - (-2.0 * 2.0 / 4.0)).abs() < 1e-12);
    }

    #[test]
    fn exploration_uses_parent_visits_at_least_one() {
        let value = uct_value(&stats(1, 0, 0, 0.0), 0, ScoreRange::default(), &params(), 2.0);
        assert_eq!(value, 0.0);
        let value = uct_value(&stats(4, 0, 0, 0.0), 16, ScoreRange::default(), &params(), 2.0);
        assert!((value - 2.0 * (16f64.ln() / 4.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn root_priority_scaling_matches_ladder() {
        let c = 1.414;
        let scaled: Vec<f64> = (0..5).map(|i| root_exploration_constant(c, Some(i))).collect();
        let expected = [1.414, 1.0605, 0.707, 0.3535, 0.3535];
        for (got, want) in scaled.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{got} vs {want}");
        }
    }
}
