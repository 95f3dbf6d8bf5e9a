//! Fatal fault taxonomy.
//!
//! Iteration-level failures (timeouts, quality failures, generic agent errors)
//! are values handled by retry, rollback and the fallback chain. The faults
//! here halt the current command and are mapped to exit codes by the CLI.

use thiserror::Error;

use crate::exit_codes;

#[derive(Debug, Error)]
pub enum Fault {
    /// Missing required file, unparsable work-item document, unusable config.
    #[error("configuration fault: {0}")]
    Configuration(String),

    /// Checkpoint/HEAD divergence, failed reset, failed or conflicting merge.
    #[error("git state fault: {0}")]
    GitState(String),

    /// A live process holds the lock.
    #[error("{lock} is held by {holder} (pid {pid}, since {since})")]
    LockContention {
        lock: String,
        holder: String,
        pid: u32,
        since: String,
    },

    #[error("interrupted (exit code {code})")]
    Interrupted { code: i32 },
}

impl Fault {
    pub fn exit_code(&self) -> i32 {
        match self {
            Fault::Interrupted { code } => *code,
            Fault::Configuration(_) | Fault::GitState(_) | Fault::LockContention { .. } => {
                exit_codes::FATAL
            }
        }
    }
}

/// Exit code for an error returned from a command.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Fault>())
        .map(Fault::exit_code)
        .unwrap_or(exit_codes::FAILED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn faults_map_to_fatal_exit_code() {
        let err = anyhow::Error::new(Fault::GitState("diverged".into()));
        assert_eq!(exit_code_for(&err), exit_codes::FATAL);
    }

    #[test]
    fn interrupted_keeps_signal_code() {
        let err = anyhow::Error::new(Fault::Interrupted {
            code: exit_codes::TERMINATED,
        });
        assert_eq!(exit_code_for(&err), exit_codes::TERMINATED);
    }

    #[test]
    fn fault_is_found_through_context_layers() {
        let err = Err::<(), _>(Fault::Configuration("missing prd".into()))
            .context("load work items")
            .unwrap_err();
        assert_eq!(exit_code_for(&err), exit_codes::FATAL);
    }

    #[test]
    fn plain_errors_are_failures() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&err), exit_codes::FAILED);
    }
}
