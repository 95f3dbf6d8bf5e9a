//! Wait-time estimation for the merge queue.

use std::time::Duration;

/// Number of recent merge durations kept for the average.
pub const HISTORY_LEN: usize = 10;

/// Average of recent merge durations, or `fallback` when there is no history.
pub fn average_merge_duration(history: &[Duration], fallback: Duration) -> Duration {
    let recent = &history[history.len().saturating_sub(HISTORY_LEN)..];
    if recent.is_empty() {
        return fallback;
    }
    let total: Duration = recent.iter().sum();
    total / recent.len() as u32
}

/// Estimated wait for the waiter at 1-indexed queue `position`.
///
/// The holder is assumed to need `average - holder_elapsed` more time (at
/// least one second); every waiter ahead of `position` costs one average.
pub fn estimate_wait(position: usize, average: Duration, holder_elapsed: Option<Duration>) -> Duration {
    let holder_remaining = match holder_elapsed {
        Some(elapsed) => average.saturating_sub(elapsed).max(Duration::from_secs(1)),
        None => Duration::ZERO,
    };
    let ahead = position.saturating_sub(1) as u32;
    holder_remaining + average * ahead
}

/// Push a duration and keep only the most recent entries.
pub fn record_duration(history: &mut Vec<Duration>, duration: Duration) {
    history.push(duration);
    if history.len() > HISTORY_LEN {
        let excess = history.len() - HISTORY_LEN;
        history.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_falls_back_without_history() {
        assert_eq!(
            average_merge_duration(&[], Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn average_uses_recent_window() {
        let mut history = vec![Duration::from_secs(1000)];
        for _ in 0..HISTORY_LEN {
            history.push(Duration::from_secs(10));
        }
        assert_eq!(
            average_merge_duration(&history, Duration::ZERO),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn first_waiter_waits_for_holder_remainder() {
        let eta = estimate_wait(1, Duration::from_secs(60), Some(Duration::from_secs(20)));
        assert_eq!(eta, Duration::from_secs(40));
    }

    #[test]
    fn overdue_holder_still_yields_nonzero_wait() {
        let eta = estimate_wait(1, Duration::from_secs(60), Some(Duration::from_secs(600)));
        assert_eq!(eta, Duration::from_secs(1));
    }

    #[test]
    fn later_positions_add_one_average_each() {
        let eta = estimate_wait(3, Duration::from_secs(30), Some(Duration::ZERO));
        assert_eq!(eta, Duration::from_secs(90));
    }

    #[test]
    fn record_duration_trims_history() {
        let mut history = Vec::new();
        for secs in 0..(HISTORY_LEN as u64 + 3) {
            record_duration(&mut history, Duration::from_secs(secs));
        }
        assert_eq!(history.len(), HISTORY_LEN);
        assert_eq!(history[0], Duration::from_secs(3));
    }
}
