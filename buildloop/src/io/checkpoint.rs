//! Durable resume point of a workstream (`checkpoint.json`).
//!
//! The checkpoint is written immediately before the agent runs for a work
//! item, so it always names a commit the rollback path can return to. It is
//! cleared only once the work-item queue is empty.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Fault;
use crate::io::confirm::Confirm;
use crate::io::git::same_commit;
use crate::io::json_file::{read_json, remove_if_exists, write_json};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub iteration: u32,
    pub story_id: String,
    /// Pre-story commit.
    pub git_sha: String,
    pub agent: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!(
            iteration = checkpoint.iteration,
            story = %checkpoint.story_id,
            sha = %checkpoint.git_sha,
            "saving checkpoint"
        );
        write_json(&self.path, checkpoint)
    }

    pub fn load(&self) -> Result<Option<Checkpoint>> {
        read_json(&self.path)
    }

    pub fn clear(&self) -> Result<()> {
        if remove_if_exists(&self.path)? {
            debug!(path = %self.path.display(), "checkpoint cleared");
        }
        Ok(())
    }
}

/// How a resume against a checkpoint may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// HEAD matches the checkpoint commit.
    Matched,
    /// HEAD differs and the operator accepted it.
    Diverged { head: String },
}

/// Compare the checkpoint commit against HEAD before any work proceeds.
///
/// A mismatch needs explicit confirmation; without a terminal it is a git-state fault.
pub fn validate_resume(
    checkpoint: &Checkpoint,
    head: &str,
    confirm: &dyn Confirm,
) -> Result<ResumeDecision> {
    if same_commit(&checkpoint.git_sha, head) {
        info!(
            iteration = checkpoint.iteration,
            story = %checkpoint.story_id,
            "resuming from checkpoint"
        );
        return Ok(ResumeDecision::Matched);
    }
    let message = format!(
        "checkpoint for {} (iteration {}) was taken at {} but HEAD is {}",
        checkpoint.story_id, checkpoint.iteration, checkpoint.git_sha, head
    );
    if !confirm.is_interactive() {
        return Err(Fault::GitState(format!(
            "{message}; refusing to resume non-interactively (reset to the checkpoint commit or delete checkpoint.json)"
        ))
        .into());
    }
    warn!(checkpoint_sha = %checkpoint.git_sha, head, "HEAD diverged from checkpoint");
    if confirm.confirm(&format!("{message}. Resume anyway?"))? {
        return Ok(ResumeDecision::Diverged {
            head: head.to_string(),
        });
    }
    Err(Fault::GitState(format!("{message}; resume declined")).into())
}
