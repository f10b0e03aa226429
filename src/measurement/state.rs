//! Error state machine of a monitored process.

use crate::db::Process;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Healthy,
    /// Consecutive failures observed, still below the threshold.
    Erroring(u32),
    /// Threshold reached. Only an operator resume leaves this state.
    Paused,
}

impl ProcessState {
    pub fn of(process: &Process) -> Self {
        if process.in_error {
            ProcessState::Paused
        } else if process.error_count > 0 {
            ProcessState::Erroring(process.error_count)
        } else {
            ProcessState::Healthy
        }
    }
}

/// Persisted state after one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub error_count: u32,
    pub in_error: bool,
    /// The firing crossed the threshold; the job must be paused.
    pub entered_pause: bool,
}

/// Advance the counters of a process by the outcome of one firing.
pub fn advance(error_count: u32, in_error: bool, success: bool, threshold: u32) -> Transition {
    if success {
        return Transition {
            error_count: 0,
            in_error,
            entered_pause: false,
        };
    }

    let error_count = error_count.saturating_add(1);
    let entered_pause = !in_error && error_count >= threshold.max(1);
    Transition {
        error_count,
        in_error: in_error || entered_pause,
        entered_pause,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_accumulate_until_threshold() {
        let first = advance(0, false, false, 3);
        assert_eq!(first.error_count, 1);
        assert!(!first.entered_pause);

        let second = advance(first.error_count, first.in_error, false, 3);
        assert_eq!(second.error_count, 2);
        assert!(!second.in_error);

        let third = advance(second.error_count, second.in_error, false, 3);
        assert_eq!(
            third,
            Transition {
                error_count: 3,
                in_error: true,
                entered_pause: true
            }
        );

        // Already paused: no second pause
        let fourth = advance(third.error_count, third.in_error, false, 3);
        assert!(fourth.in_error);
        assert!(!fourth.entered_pause);
    }

    #[test]
    fn test_success_resets_counter() {
        let t = advance(2, false, true, 3);
        assert_eq!(t.error_count, 0);
        assert!(!t.in_error);
        assert!(!t.entered_pause);
    }

    #[test]
    fn test_threshold_of_one_pauses_immediately() {
        assert!(advance(0, false, false, 1).entered_pause);
    }

    #[test]
    fn test_state_of_process() {
        let mut process = Process::new(1, "P1", None);
        assert_eq!(ProcessState::of(&process), ProcessState::Healthy);

        process.error_count = 2;
        assert_eq!(ProcessState::of(&process), ProcessState::Erroring(2));

        process.in_error = true;
        assert_eq!(ProcessState::of(&process), ProcessState::Paused);
    }
}
