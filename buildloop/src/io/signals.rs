//! Interrupt handling and interruptible sleeps.
//!
//! SIGINT/SIGTERM flip a shared [`CancelToken`] that remembers which signal
//! arrived first. Long waits (retry backoff, merge-lock polling, agent
//! invocations) poll the token instead of blocking uninterruptibly.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::warn;

use crate::core::types::{EXIT_SIGINT, EXIT_SIGTERM};

const POLL_SLICE: Duration = Duration::from_millis(100);

/// Shared cancellation flag carrying the exit code of the first signal.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    code: Arc<AtomicI32>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel as if SIGINT arrived.
    pub fn cancel(&self) {
        self.cancel_with(EXIT_SIGINT);
    }

    /// Cancel with `code`; a token that is already cancelled keeps its code.
    pub fn cancel_with(&self, code: i32) {
        let _ = self
            .code
            .compare_exchange(0, code, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.code.load(Ordering::SeqCst) != 0
    }

    /// Exit code to report for this cancellation (130 when never signalled).
    pub fn exit_code(&self) -> i32 {
        match self.code.load(Ordering::SeqCst) {
            0 => EXIT_SIGINT,
            code => code,
        }
    }

    /// Route SIGINT and SIGTERM to this token. Call once per process, before
    /// any other thread is spawned.
    pub fn install_signal_handler(&self) -> Result<()> {
        #[cfg(unix)]
        self.install_sigterm_waiter()?;
        let token = self.clone();
        ctrlc::set_handler(move || {
            warn!("interrupt received, stopping after the current step");
            token.cancel_with(EXIT_SIGINT);
        })
        .context("install interrupt handler")
    }

    /// Block SIGTERM in this thread (and so in every thread spawned after it)
    /// and take it with `sigwait` on a dedicated thread. Children start with an
    /// empty signal mask.
    #[cfg(unix)]
    fn install_sigterm_waiter(&self) -> Result<()> {
        use nix::sys::signal::{SigSet, Signal};

        let mut set = SigSet::empty();
        set.add(Signal::SIGTERM);
        set.thread_block().context("block SIGTERM")?;
        let token = self.clone();
        thread::Builder::new()
            .name("sigterm".into())
            .spawn(move || {
                loop {
                    match set.wait() {
                        Ok(_) => {
                            warn!("termination requested, stopping after the current step");
                            token.cancel_with(EXIT_SIGTERM);
                        }
                        Err(err) => {
                            warn!(err = %err, "waiting for SIGTERM failed");
                            return;
                        }
                    }
                }
            })
            .context("spawn SIGTERM waiter")?;
        Ok(())
    }
}

/// Blocking wait abstraction so loops can be tested without real sleeps.
pub trait Sleeper {
    /// Wait for `duration`. Returns false if the wait was cut short by a cancellation.
    fn sleep(&self, duration: Duration) -> bool;

    /// Exit code to report after [`Sleeper::sleep`] returned false.
    fn interrupt_code(&self) -> i32 {
        EXIT_SIGINT
    }
}

/// Real sleeper that wakes up early when the token is cancelled.
#[derive(Debug, Clone)]
pub struct CancellableSleeper {
    token: CancelToken,
}

impl CancellableSleeper {
    pub fn new(token: CancelToken) -> Self {
        Self { token }
    }
}

impl Sleeper for CancellableSleeper {
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.token.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(POLL_SLICE));
        }
    }

    fn interrupt_code(&self) -> i32 {
        self.token.exit_code()
    }
}
