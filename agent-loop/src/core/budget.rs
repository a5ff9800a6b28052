//! Shared time budget helpers for the iteration loop.

use std::time::Duration;

/// Timeout for one delegated subagent run.
///
/// Splits the remaining run budget evenly across the iterations still
/// allowed. `remaining_iterations` is clamped to at least one, so the final
/// iteration receives the whole remaining budget. The result never drops
/// below `floor`, even when that overshoots the run budget.
pub fn proportional_timeout(
    remaining_runtime: Duration,
    remaining_iterations: u32,
    floor: Duration,
) -> Duration {
    let share = remaining_runtime / remaining_iterations.max(1);
    share.max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportional_timeout_splits_evenly() {
        let timeout = proportional_timeout(
            Duration::from_secs(600),
            4,
            Duration::from_secs(30),
        );
        assert_eq!(timeout, Duration::from_secs(150));
    }

    #[test]
    fn proportional_timeout_respects_floor() {
        let timeout = proportional_timeout(
            Duration::from_secs(60),
            10,
            Duration::from_secs(30),
        );
        assert_eq!(timeout, Duration::from_secs(30));
    }

    #[test]
    fn final_iteration_gets_whole_remaining_budget() {
        let timeout = proportional_timeout(Duration::from_secs(90), 1, Duration::from_secs(30));
        assert_eq!(timeout, Duration::from_secs(90));

        let timeout = proportional_timeout(Duration::from_secs(90), 0, Duration::from_secs(30));
        assert_eq!(timeout, Duration::from_secs(90));
    }

    #[test]
    fn exhausted_budget_falls_back_to_floor() {
        let timeout = proportional_timeout(Duration::ZERO, 1, Duration::from_secs(30));
        assert_eq!(timeout, Duration::from_secs(30));
    }
}
