//! Rollback of a failed work item to its pre-story commit.
//!
//! Uncommitted work is stashed under a label naming the story and iteration,
//! then the tree is hard-reset. A failed reset is a git-state fault: the stash
//! is restored when possible and the build halts instead of continuing on a
//! half-reset tree.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::core::classifier::{FailureClassifier, QualityCategory};
use crate::core::rollback_policy::{RollbackSkip, RollbackTrigger, rollback_skip_reason};
use crate::core::types::WorkItem;
use crate::core::work_items::has_no_rollback_directive;
use crate::error::Fault;
use crate::io::config::RollbackConfig;
use crate::io::git::{Git, same_commit};
use crate::io::json_file::remove_if_exists;
use crate::io::paths::StatePaths;

const LOG_TAIL_LINES: usize = 60;

/// Outcome of [`maybe_rollback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    Skipped(RollbackSkip),
    RolledBack {
        head_before: String,
        head_after: String,
        /// Uncommitted changes were stashed.
        stashed: bool,
        failure_context: PathBuf,
    },
}

impl RollbackOutcome {
    pub fn handled(&self) -> bool {
        matches!(self, RollbackOutcome::RolledBack { .. })
    }
}

/// Everything a rollback needs besides the failed invocation itself.
pub struct Rollback<'a> {
    pub git: &'a Git,
    pub classifier: &'a FailureClassifier,
    pub config: &'a RollbackConfig,
    pub state: &'a StatePaths,
}

impl Rollback<'_> {
    /// Roll the tree back to `pre_story` if the failure matches the trigger policy.
    pub fn maybe_rollback(
        &self,
        exit_code: i32,
        log: &str,
        pre_story: &str,
        item: &WorkItem,
        stash_label: &str,
    ) -> Result<RollbackOutcome> {
        if let Some(skip) = rollback_skip_reason(
            self.config.enabled,
            self.config.trigger,
            self.classifier,
            exit_code,
            log,
            has_no_rollback_directive(item),
        ) {
            if skip == RollbackSkip::Directive {
                info!(story = %item.id, "rollback skipped by no-rollback directive");
            }
            return Ok(RollbackOutcome::Skipped(skip));
        }

        let failure_context = self.write_failure_context(item, exit_code, log)?;
        let head_before = self.git.head_sha()?;
        let stashed = self
            .git
            .stash_push(stash_label)
            .map_err(|err| Fault::GitState(format!("stash before rollback failed: {err:#}")))?;

        if !same_commit(&head_before, pre_story) {
            if let Err(err) = self.git.reset_hard(pre_story) {
                error!(story = %item.id, target = pre_story, err = %err, "rollback reset failed");
                if stashed {
                    match self.git.stash_pop_labeled(stash_label) {
                        Ok(_) => info!(label = stash_label, "restored stashed changes"),
                        Err(pop_err) => warn!(
                            label = stash_label,
                            err = %pop_err,
                            "could not restore stash; recover it with `git stash list`"
                        ),
                    }
                }
                return Err(Fault::GitState(format!(
                    "rollback of {} to {pre_story} failed: {err:#}",
                    item.id
                ))
                .into());
            }
        }

        let head_after = self.git.head_sha()?;
        info!(
            story = %item.id,
            trigger = %self.config.trigger,
            head_before = %head_before,
            head_after = %head_after,
            stashed,
            "rolled back to pre-story commit"
        );
        Ok(RollbackOutcome::RolledBack {
            head_before,
            head_after,
            stashed,
            failure_context,
        })
    }

    fn write_failure_context(&self, item: &WorkItem, exit_code: i32, log: &str) -> Result<PathBuf> {
        let path = failure_context_path(self.state, &item.id);
        let contents = render_failure_context(self.classifier, self.config.trigger, item, exit_code, log);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}

pub fn failure_context_path(state: &StatePaths, story_id: &str) -> PathBuf {
    state.failure_context_dir.join(format!("{story_id}.txt"))
}

/// Matching log excerpts followed by the tail of the log.
fn render_failure_context(
    classifier: &FailureClassifier,
    trigger: RollbackTrigger,
    item: &WorkItem,
    exit_code: i32,
    log: &str,
) -> String {
    let categories: Vec<QualityCategory> = match trigger.category() {
        Some(category) => vec![category],
        None => QualityCategory::ALL.to_vec(),
    };
    let mut out = format!(
        "Failure context for {}: {} (exit code {exit_code})\n",
        item.id, item.title
    );
    for category in categories {
        let lines = classifier.matching_lines(category, log);
        if lines.is_empty() {
            continue;
        }
        out.push_str(&format!("\n## {category} failures\n"));
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
    }
    let all: Vec<&str> = log.lines().collect();
    let tail = &all[all.len().saturating_sub(LOG_TAIL_LINES)..];
    out.push_str(&format!("\n## Log tail (last {} lines)\n", tail.len()));
    for line in tail {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Rollback retries already used for a work item, across runs.
pub fn read_retry_count(state: &StatePaths, story_id: &str) -> Result<u32> {
    let path = retry_count_path(state, story_id);
    match fs::read_to_string(&path) {
        Ok(text) => Ok(text.trim().parse().unwrap_or_else(|_| {
            warn!(path = %path.display(), "unreadable retry counter, treating as 0");
            0
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

pub fn write_retry_count(state: &StatePaths, story_id: &str, count: u32) -> Result<()> {
    let path = retry_count_path(state, story_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, format!("{count}\n")).with_context(|| format!("write {}", path.display()))
}

pub fn clear_retry_count(state: &StatePaths, story_id: &str) -> Result<()> {
    remove_if_exists(&retry_count_path(state, story_id)).map(|_| ())
}

fn retry_count_path(state: &StatePaths, story_id: &str) -> PathBuf {
    state.rollback_retries_dir.join(format!("{story_id}.count"))
}

/// Read a failure context artifact, empty if missing.
pub fn read_failure_context(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}
