//! Persistence of the agent fallback state (`switch-state.json`).

use std::path::PathBuf;

use anyhow::Result;
use tracing::warn;

use crate::core::fallback::{FallbackChain, SwitchState};
use crate::io::json_file::{read_json, write_json};

#[derive(Debug, Clone)]
pub struct SwitchStateStore {
    path: PathBuf,
}

impl SwitchStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Persisted state re-anchored on `chain`, or the chain's initial state.
    ///
    /// An unreadable file is replaced rather than halting the stream.
    pub fn load_or_init<F: Fn(&str) -> bool>(
        &self,
        chain: &FallbackChain,
        available: F,
    ) -> Result<SwitchState> {
        match read_json::<SwitchState>(&self.path) {
            Ok(Some(state)) => Ok(chain.reconcile(state, available)),
            Ok(None) => Ok(chain.initial_state(available)),
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "resetting unreadable switch state");
                Ok(chain.initial_state(available))
            }
        }
    }

    pub fn save(&self, state: &SwitchState) -> Result<()> {
        write_json(&self.path, state)
    }
}
