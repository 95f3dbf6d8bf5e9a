//! Canonical locations of buildloop state under `.buildloop/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const STATE_DIR_NAME: &str = ".buildloop";

/// Buildloop state is never committed: rollbacks must not stash or reset it and
/// merges bring it back by syncing files, not through git history.
const GITIGNORE_LINES: [&str; 1] = ["*"];

/// Project-wide paths (shared by every workstream).
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_root: PathBuf,
    pub config_path: PathBuf,
    pub streams_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub merge_lock_path: PathBuf,
    pub merge_queue_dir: PathBuf,
    pub merge_stats_path: PathBuf,
    pub active_stream_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_root = root.join(STATE_DIR_NAME);
        Self {
            root: root.clone(),
            config_path: state_root.join("config.toml"),
            streams_dir: state_root.join("streams"),
            worktrees_dir: state_root.join("worktrees"),
            merge_lock_path: state_root.join("merge.lock"),
            merge_queue_dir: state_root.join("merge-queue"),
            merge_stats_path: state_root.join("merge-stats.json"),
            active_stream_path: state_root.join("active-stream"),
            state_root,
        }
    }

    /// State of the default (non-stream) build.
    pub fn default_state(&self) -> StatePaths {
        StatePaths::new(&self.state_root)
    }

    pub fn stream_dir_name(id: u32) -> String {
        format!("stream-{id}")
    }

    pub fn stream_branch(id: u32) -> String {
        format!("stream/{id}")
    }

    /// Canonical state directory of a stream in the trunk working copy.
    pub fn stream_state(&self, id: u32) -> StatePaths {
        StatePaths::new(self.streams_dir.join(Self::stream_dir_name(id)))
    }

    pub fn worktree_dir(&self, id: u32) -> PathBuf {
        self.worktrees_dir.join(Self::stream_dir_name(id))
    }

    /// Path of the stream state directory relative to a project root.
    pub fn stream_state_relative(id: u32) -> PathBuf {
        Path::new(STATE_DIR_NAME)
            .join("streams")
            .join(Self::stream_dir_name(id))
    }
}

/// Write `.buildloop/.gitignore` if it is missing or lacks a required line.
pub fn ensure_state_gitignore(paths: &ProjectPaths) -> Result<()> {
    let path = paths.state_root.join(".gitignore");
    let existing = if path.exists() {
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?
    } else {
        String::new()
    };
    let mut lines: Vec<String> = existing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    let mut changed = false;
    for required in GITIGNORE_LINES {
        if !lines.iter().any(|l| l == required) {
            lines.push(required.to_string());
            changed = true;
        }
    }
    if !changed && path.exists() {
        return Ok(());
    }
    fs::create_dir_all(&paths.state_root)
        .with_context(|| format!("create {}", paths.state_root.display()))?;
    let mut out = lines.join("\n");
    out.push('\n');
    fs::write(&path, out).with_context(|| format!("write {}", path.display()))
}

/// Files belonging to one workstream's state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub dir: PathBuf,
    pub prd_path: PathBuf,
    pub progress_path: PathBuf,
    pub errors_log_path: PathBuf,
    pub runs_dir: PathBuf,
    pub checkpoint_path: PathBuf,
    pub switch_state_path: PathBuf,
    pub run_lock_path: PathBuf,
    pub rollback_retries_dir: PathBuf,
    pub failure_context_dir: PathBuf,
    pub merged_marker_path: PathBuf,
}

impl StatePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            prd_path: dir.join("prd.md"),
            progress_path: dir.join("progress.md"),
            errors_log_path: dir.join("errors.log"),
            runs_dir: dir.join("runs"),
            checkpoint_path: dir.join("checkpoint.json"),
            switch_state_path: dir.join("switch-state.json"),
            run_lock_path: dir.join("run.lock"),
            rollback_retries_dir: dir.join("rollback-retries"),
            failure_context_dir: dir.join("failure-context"),
            merged_marker_path: dir.join("merged"),
            dir,
        }
    }

    /// Files copied between the canonical location and a worktree.
    ///
    /// Locks and merge markers are process- and location-bound and never synced.
    pub fn syncable_entries(&self) -> [&Path; 6] {
        [
            &self.prd_path,
            &self.progress_path,
            &self.errors_log_path,
            &self.runs_dir,
            &self.checkpoint_path,
            &self.switch_state_path,
        ]
    }
}
