//! Bounded exponential-backoff retry around one agent invocation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::{info, warn};

use crate::core::backoff::{MAX_JITTER, RetryPolicy};
use crate::core::types::is_interrupt_code;
use crate::io::agent::append_line;
use crate::io::signals::Sleeper;

/// Result of [`run_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOutcome {
    /// Exit code of the last attempt.
    pub exit_code: i32,
    /// Attempts after the first one.
    pub retry_count: u32,
    pub total_wait: Duration,
    /// Log length before the last attempt started; its output begins here.
    pub last_attempt_offset: u64,
}

/// Sleep and jitter sources for retries.
pub struct Backoff<'a> {
    pub sleeper: &'a dyn Sleeper,
    pub jitter: fn() -> Duration,
}

/// Uniform jitter in `[0, 1s)`.
pub fn random_jitter() -> Duration {
    rand::thread_rng().gen_range(Duration::ZERO..MAX_JITTER)
}

/// Run `invoke` until it exits 0, is interrupted, or `policy.max_attempts` is used up.
///
/// Every attempt appends to `log_path`; attempts after the first are preceded
/// by a `=== <label> n/max ===` marker. An interrupted sleep ends the retry
/// loop with the SIGINT exit code.
pub fn run_with_retry<F>(
    policy: &RetryPolicy,
    backoff: &Backoff<'_>,
    log_path: &Path,
    label: &str,
    mut invoke: F,
) -> Result<RetryOutcome>
where
    F: FnMut(u32) -> Result<i32>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut total_wait = Duration::ZERO;
    let mut attempt = 1u32;
    loop {
        if attempt > 1 {
            append_line(log_path, &format!("\n=== {label} {attempt}/{max_attempts} ==="))?;
        }
        let offset = log_len(log_path);
        let exit_code = invoke(attempt)?;
        let outcome = RetryOutcome {
            exit_code,
            retry_count: attempt - 1,
            total_wait,
            last_attempt_offset: offset,
        };
        if exit_code == 0 {
            return Ok(outcome);
        }
        if is_interrupt_code(exit_code) {
            warn!(exit_code, attempt, "agent interrupted, not retrying");
            return Ok(outcome);
        }
        if attempt >= max_attempts {
            warn!(exit_code, attempts = attempt, "attempts exhausted");
            return Ok(outcome);
        }
        let delay = policy.delay_after(attempt, (backoff.jitter)());
        info!(
            exit_code,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "agent failed, retrying after backoff"
        );
        if !backoff.sleeper.sleep(delay) {
            warn!("interrupted during retry backoff");
            return Ok(RetryOutcome {
                exit_code: backoff.sleeper.interrupt_code(),
                ..outcome
            });
        }
        total_wait += delay;
        attempt += 1;
    }
}

fn log_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Output of the attempt starting at `offset` (lossy UTF-8).
pub fn read_log_from(path: &Path, offset: u64) -> String {
    match fs::read(path) {
        Ok(bytes) => {
            let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
            String::from_utf8_lossy(&bytes[start..]).into_owned()
        }
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{EXIT_SIGINT, EXIT_SIGTERM};
    use crate::io::signals::{CancelToken, CancellableSleeper};
    use std::cell::RefCell;

    struct RecordingSleeper {
        slept: RefCell<Vec<Duration>>,
        allow: bool,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> bool {
            self.slept.borrow_mut().push(duration);
            self.allow
        }
    }

    fn no_jitter() -> Duration {
        Duration::ZERO
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }

    fn run(codes: &[i32], max_attempts: u32, allow_sleep: bool) -> (RetryOutcome, Vec<Duration>, u32, String) {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("iter.log");
        let sleeper = RecordingSleeper {
            slept: RefCell::new(Vec::new()),
            allow: allow_sleep,
        };
        let backoff = Backoff {
            sleeper: &sleeper,
            jitter: no_jitter,
        };
        let mut calls = 0u32;
        let outcome = run_with_retry(&policy(max_attempts), &backoff, &log, "RETRY ATTEMPT", |attempt| {
            calls += 1;
            append_line(&log, &format!("output of attempt {attempt}"))?;
            Ok(codes[(attempt - 1) as usize])
        })
        .expect("retry");
        let text = fs::read_to_string(&log).unwrap_or_default();
        let slept = sleeper.slept.borrow().clone();
        (outcome, slept, calls, text)
    }

    #[test]
    fn success_on_first_attempt_does_not_wait() {
        let (outcome, slept, calls, _) = run(&[0], 3, true);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.retry_count, 0);
        assert_eq!(calls, 1);
        assert!(slept.is_empty());
    }

    #[test]
    fn retries_with_doubling_delay_and_markers() {
        let (outcome, slept, calls, text) = run(&[1, 1, 0], 3, true);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.retry_count, 2);
        assert_eq!(calls, 3);
        assert_eq!(slept, vec![Duration::from_secs(2), Duration::from_secs(4)]);
        assert_eq!(outcome.total_wait, Duration::from_secs(6));
        assert!(text.contains("=== RETRY ATTEMPT 2/3 ==="));
        assert!(text.contains("=== RETRY ATTEMPT 3/3 ==="));
        assert!(text.contains("output of attempt 1"));
    }

    #[test]
    fn returns_last_code_when_exhausted() {
        let (outcome, slept, calls, _) = run(&[1, 2, 3], 3, true);
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.retry_count, 2);
        assert_eq!(calls, 3);
        assert_eq!(slept.len(), 2);
    }

    #[test]
    fn interrupt_codes_short_circuit() {
        for code in [130, 143] {
            let (outcome, slept, calls, _) = run(&[code, 0, 0], 3, true);
            assert_eq!(outcome.exit_code, code);
            assert_eq!(calls, 1);
            assert!(slept.is_empty());
        }
    }

    #[test]
    fn interrupted_sleep_reports_sigint() {
        let (outcome, _, calls, _) = run(&[1, 0], 3, false);
        assert_eq!(outcome.exit_code, EXIT_SIGINT);
        assert_eq!(calls, 1);
    }

    #[test]
    fn sigterm_during_backoff_reports_143() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("iter.log");
        let token = CancelToken::new();
        let sleeper = CancellableSleeper::new(token.clone());
        let backoff = Backoff {
            sleeper: &sleeper,
            jitter: no_jitter,
        };
        let outcome = run_with_retry(&policy(3), &backoff, &log, "RETRY ATTEMPT", |_| {
            token.cancel_with(EXIT_SIGTERM);
            Ok(1)
        })
        .expect("retry");
        assert_eq!(outcome.exit_code, EXIT_SIGTERM);
        assert_eq!(outcome.retry_count, 0);
    }

    #[test]
    fn last_attempt_offset_points_at_final_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("iter.log");
        let sleeper = RecordingSleeper {
            slept: RefCell::new(Vec::new()),
            allow: true,
        };
        let backoff = Backoff {
            sleeper: &sleeper,
            jitter: no_jitter,
        };
        let outcome = run_with_retry(&policy(2), &backoff, &log, "RETRY ATTEMPT", |attempt| {
            let text = if attempt == 1 { "3 failed" } else { "all good" };
            append_line(&log, text)?;
            Ok(if attempt == 1 { 1 } else { 0 })
        })
        .expect("retry");
        assert_eq!(read_log_from(&log, outcome.last_attempt_offset), "all good\n");
    }

    #[test]
    fn jitter_stays_below_one_second() {
        for _ in 0..100 {
            assert!(random_jitter() < MAX_JITTER);
        }
    }
}
