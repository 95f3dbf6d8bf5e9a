//! Git adapter for buildloop commands.
//!
//! Git state is the source of truth for rollback, resume and merge, so we keep
//! a small, explicit wrapper around `git` subprocess calls. Every mutating
//! helper is safe to call when there is nothing to do.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Result of integrating a branch into the current branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    FastForward,
    MergeCommit,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if the working directory is inside a git work tree.
    pub fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        self.rev_parse("HEAD")
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True if there are no tracked changes and no untracked (non-ignored) files.
    pub fn is_clean(&self) -> Result<bool> {
        Ok(self.status_porcelain()?.is_empty())
    }

    /// Ensure the worktree is fully clean (including untracked files).
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(dirty_count = entries.len(), "worktree not clean");
        let mut msg = String::from("working tree not clean:\n");
        for entry in entries {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Stash tracked and untracked changes under `label`.
    ///
    /// Returns `Ok(false)` without touching the stash when the tree is clean.
    #[instrument(skip_all, fields(label))]
    pub fn stash_push(&self, label: &str) -> Result<bool> {
        if self.is_clean()? {
            debug!("clean tree, nothing to stash");
            return Ok(false);
        }
        self.run_checked(&["stash", "push", "--include-untracked", "-m", label])?;
        debug!(label, "stashed changes");
        Ok(true)
    }

    /// Pop the most recent stash entry whose message contains `label`.
    ///
    /// Returns `Ok(false)` if no such entry exists.
    #[instrument(skip_all, fields(label))]
    pub fn stash_pop_labeled(&self, label: &str) -> Result<bool> {
        let list = self.run_capture(&["stash", "list", "--format=%gd %s"])?;
        let Some(reference) = list
            .lines()
            .find(|line| line.contains(label))
            .and_then(|line| line.split_whitespace().next())
        else {
            return Ok(false);
        };
        self.run_checked(&["stash", "pop", reference])?;
        Ok(true)
    }

    /// `git reset --hard <rev>`.
    #[instrument(skip_all, fields(rev))]
    pub fn reset_hard(&self, rev: &str) -> Result<()> {
        self.run_checked(&["reset", "--hard", rev])?;
        Ok(())
    }

    /// One-line log entries in `from..to` (newest first).
    pub fn log_oneline(&self, from: &str, to: &str) -> Result<Vec<String>> {
        if from == to {
            return Ok(Vec::new());
        }
        let range = format!("{from}..{to}");
        let out = self.run_capture(&["log", "--oneline", &range])?;
        Ok(non_empty_lines(&out))
    }

    /// Paths changed between two commits.
    pub fn diff_names(&self, from: &str, to: &str) -> Result<Vec<String>> {
        if from == to {
            return Ok(Vec::new());
        }
        let out = self.run_capture(&["diff", "--name-only", from, to])?;
        Ok(non_empty_lines(&out))
    }

    /// True if `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let out = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git merge-base --is-ancestor {ancestor} {descendant} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }

    /// Add a worktree at `path` checked out on `branch`, creating the branch from
    /// `base` when it does not exist yet.
    #[instrument(skip_all, fields(branch, base))]
    pub fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path_arg = path.to_string_lossy().to_string();
        if self.branch_exists(branch)? {
            self.run_checked(&["worktree", "add", &path_arg, branch])?;
        } else {
            self.run_checked(&["worktree", "add", "-b", branch, &path_arg, base])?;
        }
        Ok(())
    }

    /// Remove a worktree; a missing worktree is not an error.
    #[instrument(skip_all)]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        if path.exists() {
            let path_arg = path.to_string_lossy().to_string();
            self.run_checked(&["worktree", "remove", "--force", &path_arg])?;
        }
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Delete a local branch if it exists.
    pub fn delete_branch(&self, branch: &str, force: bool) -> Result<bool> {
        if !self.branch_exists(branch)? {
            return Ok(false);
        }
        let flag = if force { "-D" } else { "-d" };
        self.run_checked(&["branch", flag, branch])?;
        Ok(true)
    }

    /// Try merging `branch` without committing and report conflicting paths.
    ///
    /// The trial merge is always aborted, whatever its outcome.
    #[instrument(skip_all, fields(branch))]
    pub fn merge_conflicts(&self, branch: &str) -> Result<Vec<String>> {
        let trial = self.run(&["merge", "--no-commit", "--no-ff", branch])?;
        let conflicts = self
            .run_capture(&["diff", "--name-only", "--diff-filter=U"])
            .map(|out| non_empty_lines(&out));
        self.abort_merge_if_in_progress()?;
        let conflicts = conflicts?;
        if !trial.status.success() && conflicts.is_empty() {
            return Err(anyhow!(
                "trial merge of {branch} failed: {}",
                String::from_utf8_lossy(&trial.stderr).trim()
            ));
        }
        debug!(conflict_count = conflicts.len(), "trial merge finished");
        Ok(conflicts)
    }

    /// Fast-forward to `branch` if possible, otherwise create a merge commit.
    #[instrument(skip_all, fields(branch))]
    pub fn merge_branch(&self, branch: &str, message: &str) -> Result<MergeKind> {
        if self.run(&["merge", "--ff-only", branch])?.status.success() {
            return Ok(MergeKind::FastForward);
        }
        debug!("fast-forward not possible, creating merge commit");
        if let Err(err) = self.run_checked(&["merge", "--no-ff", "-m", message, branch]) {
            self.abort_merge_if_in_progress()?;
            return Err(err);
        }
        Ok(MergeKind::MergeCommit)
    }

    /// Rebase the current branch onto `onto`, aborting on failure.
    #[instrument(skip_all, fields(onto))]
    pub fn rebase(&self, onto: &str) -> Result<()> {
        let out = self.run(&["rebase", onto])?;
        if out.status.success() {
            return Ok(());
        }
        let _ = self.run(&["rebase", "--abort"]);
        Err(anyhow!(
            "git rebase {onto} failed (aborted): {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ))
    }

    fn abort_merge_if_in_progress(&self) -> Result<()> {
        let in_progress = self
            .run(&["rev-parse", "-q", "--verify", "MERGE_HEAD"])?
            .status
            .success();
        if in_progress {
            self.run_checked(&["merge", "--abort"])?;
        }
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// True if `a` and `b` name the same commit, allowing abbreviated hashes.
pub fn same_commit(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.starts_with(b) || b.starts_with(a)
}

fn non_empty_lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
