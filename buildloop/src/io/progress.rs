//! Background heartbeat logged while a blocking agent invocation runs.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::info;

/// Logs elapsed time every `interval` until dropped.
pub struct Heartbeat {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn start(label: impl Into<String>, interval: Duration) -> Self {
        let label = label.into();
        let (stop, stopped) = mpsc::channel::<()>();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        info!(
                            agent = %label,
                            elapsed_secs = started.elapsed().as_secs(),
                            "agent still running"
                        );
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
