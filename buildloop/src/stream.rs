//! Workstreams: independent build state bound to a `stream/<id>` branch.
//!
//! A stream's canonical state lives in `.buildloop/streams/stream-<id>/` of the
//! trunk working copy. `init` adds an isolated worktree under
//! `.buildloop/worktrees/stream-<id>/` and copies the state into it; builds
//! then run there, and `merge` copies the state back once the branch lands on
//! trunk. Merges are serialized by the global merge lock.

use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::summary::format_duration;
use crate::core::types::{ItemCounts, StreamStatus};
use crate::error::Fault;
use crate::io::agent::AgentRunner;
use crate::io::checkpoint::{Checkpoint, CheckpointStore};
use crate::io::config::{BuildConfig, write_atomic};
use crate::io::confirm::Confirm;
use crate::io::git::{Git, MergeKind};
use crate::io::json_file::{read_json, remove_if_exists, write_json};
use crate::io::lock::{Acquire, Lock, LockRecord, MERGE_OWNER};
use crate::io::merge_queue::{MergeQueue, QueueEntry, WaitOutcome, wait_with_backoff};
use crate::io::paths::{ProjectPaths, StatePaths, ensure_state_gitignore};
use crate::io::signals::{CancelToken, Sleeper};
use crate::io::work_source::PrdSource;
use crate::looping::{BuildEnv, BuildOptions, BuildOutcome, acquire_run_lock, run_build};

/// Written to `merged` in the canonical state once the branch is on trunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedMarker {
    pub merged_at: DateTime<Utc>,
    pub trunk_sha: String,
}

/// Derived view of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub id: u32,
    pub status: StreamStatus,
    pub branch: String,
    pub has_worktree: bool,
    pub counts: ItemCounts,
    pub run_holder: Option<LockRecord>,
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    pub rebase: bool,
    /// Merge even if not every work item is done.
    pub force: bool,
    pub wait: bool,
    pub force_unlock: bool,
    /// Skip the force-unlock confirmation.
    pub yes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeReport {
    AlreadyMerged,
    /// The stream never got a branch; it is marked merged as is.
    NothingToMerge,
    Merged { kind: MergeKind, duration: Duration },
}

/// Agent-side collaborators of a stream build.
pub struct BuildDeps<'a> {
    pub agents: &'a dyn AgentRunner,
    pub sleeper: &'a dyn Sleeper,
    pub jitter: fn() -> Duration,
    pub confirm: &'a dyn Confirm,
    pub cancel: &'a CancelToken,
}

/// A waiter as shown by `merge-status`.
#[derive(Debug, Clone, PartialEq)]
pub struct Waiter {
    pub entry: QueueEntry,
    pub position: usize,
    pub waiting: Duration,
    pub eta: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeStatus {
    pub holder: Option<LockRecord>,
    pub holder_alive: bool,
    pub waiters: Vec<Waiter>,
    pub average_merge: Duration,
}

pub struct Streams<'a> {
    paths: ProjectPaths,
    config: &'a BuildConfig,
    git: Git,
}

impl<'a> Streams<'a> {
    pub fn new(root: &Path, config: &'a BuildConfig) -> Self {
        Self {
            paths: ProjectPaths::new(root),
            config,
            git: Git::new(root),
        }
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    /// Ids of all streams, ascending.
    pub fn ids(&self) -> Result<Vec<u32>> {
        let read_dir = match fs::read_dir(&self.paths.streams_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.paths.streams_dir.display()));
            }
        };
        let mut ids = Vec::new();
        for dirent in read_dir {
            let dirent = dirent.with_context(|| format!("read {}", self.paths.streams_dir.display()))?;
            let name = dirent.file_name();
            if let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("stream-"))
                .and_then(|n| n.parse::<u32>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Allocate the next id and scaffold its state.
    pub fn create(&self, seed_prd: Option<&Path>) -> Result<u32> {
        ensure_state_gitignore(&self.paths)?;
        let id = self.ids()?.last().map_or(1, |last| last + 1);
        let state = self.paths.stream_state(id);
        fs::create_dir_all(&state.runs_dir)
            .with_context(|| format!("create {}", state.runs_dir.display()))?;
        match seed_prd {
            Some(seed) => {
                fs::copy(seed, &state.prd_path).with_context(|| {
                    format!("copy {} to {}", seed.display(), state.prd_path.display())
                })?;
            }
            None => write_atomic(&state.prd_path, &placeholder_prd(id))?,
        }
        write_atomic(&state.progress_path, &format!("# Progress of stream {id}\n"))?;
        info!(stream = id, dir = %state.dir.display(), "created stream");
        Ok(id)
    }

    /// Canonical state, or the worktree copy when a worktree exists.
    fn working_state(&self, id: u32) -> (PathBuf, StatePaths) {
        let worktree = self.paths.worktree_dir(id);
        if worktree.exists() {
            let state = StatePaths::new(worktree.join(ProjectPaths::stream_state_relative(id)));
            (worktree, state)
        } else {
            (self.paths.root.clone(), self.paths.stream_state(id))
        }
    }

    pub fn status(&self, id: u32) -> Result<StreamInfo> {
        let canonical = self.paths.stream_state(id);
        let branch = ProjectPaths::stream_branch(id);
        let has_worktree = self.paths.worktree_dir(id).exists();
        let mut info = StreamInfo {
            id,
            status: StreamStatus::NotFound,
            branch: branch.clone(),
            has_worktree,
            counts: ItemCounts::default(),
            run_holder: None,
            checkpoint: None,
        };
        if !canonical.dir.exists() {
            return Ok(info);
        }
        let (_, state) = self.working_state(id);
        info.counts = PrdSource::new(&state.prd_path).counts_lenient()?;
        info.checkpoint = CheckpointStore::new(&state.checkpoint_path)
            .load()
            .unwrap_or_else(|err| {
                warn!(stream = id, err = %err, "unreadable checkpoint");
                None
            });

        if self.is_merged(id, &canonical, &branch)? {
            info.status = StreamStatus::Merged;
            return Ok(info);
        }
        let run_lock = Lock::file(&canonical.run_lock_path);
        if let Some(holder) = run_lock.holder()? {
            if run_lock.holder_alive(&holder) {
                info.status = StreamStatus::Running;
                info.run_holder = Some(holder);
                return Ok(info);
            }
        }
        info.status = match (info.counts.total, info.counts.remaining) {
            (0, _) => StreamStatus::Ready,
            (_, 0) => StreamStatus::Completed,
            (total, remaining) if remaining == total => StreamStatus::Ready,
            _ => StreamStatus::InProgress,
        };
        Ok(info)
    }

    /// Merged marker present and still true; a stale marker is removed.
    fn is_merged(&self, id: u32, canonical: &StatePaths, branch: &str) -> Result<bool> {
        if read_json::<MergedMarker>(&canonical.merged_marker_path)?.is_none() {
            return Ok(false);
        }
        if !self.git.branch_exists(branch)?
            || self.git.is_ancestor(branch, &self.config.trunk_branch)?
        {
            return Ok(true);
        }
        warn!(stream = id, "branch has moved past its merge, clearing merged marker");
        remove_if_exists(&canonical.merged_marker_path)?;
        Ok(false)
    }

    pub fn list(&self) -> Result<Vec<StreamInfo>> {
        self.ids()?.into_iter().map(|id| self.status(id)).collect()
    }

    /// Create the stream's branch and worktree and copy its state in. Idempotent.
    pub fn init_worktree(&self, id: u32) -> Result<PathBuf> {
        let canonical = self.require_stream(id)?;
        let worktree = self.paths.worktree_dir(id);
        if worktree.exists() {
            info!(stream = id, path = %worktree.display(), "worktree already initialized");
            return Ok(worktree);
        }
        let branch = ProjectPaths::stream_branch(id);
        fs::create_dir_all(&self.paths.worktrees_dir)
            .with_context(|| format!("create {}", self.paths.worktrees_dir.display()))?;
        self.git
            .worktree_add(&worktree, &branch, &self.config.trunk_branch)
            .map_err(|err| Fault::GitState(format!("cannot add worktree for {branch}: {err:#}")))?;

        let worktree_paths = ProjectPaths::new(&worktree);
        ensure_state_gitignore(&worktree_paths)?;
        copy_project_files(&self.paths.state_root, &worktree_paths.state_root)?;
        let target = StatePaths::new(worktree.join(ProjectPaths::stream_state_relative(id)));
        sync_state(&canonical, &target)?;
        info!(stream = id, branch = %branch, path = %worktree.display(), "initialized worktree");
        Ok(worktree)
    }

    /// Run the build loop for stream `id` under its run lock.
    pub fn build(
        &self,
        id: u32,
        options: &BuildOptions,
        allow_trunk: bool,
        deps: &BuildDeps<'_>,
    ) -> Result<BuildOutcome> {
        let canonical = self.require_stream(id)?;
        if self.status(id)?.status == StreamStatus::Merged {
            return Err(Fault::Configuration(format!("stream {id} is already merged")).into());
        }
        let _run_lock = acquire_run_lock(&canonical, &format!("stream-{id}"))?;
        let (workdir, state) = self.working_state(id);
        let sequential = workdir == self.paths.root;
        if sequential {
            self.guard_sequential_build(id, allow_trunk)?;
        }

        let env = BuildEnv {
            workdir: &workdir,
            state: &state,
            prompt_dir: &self.paths.state_root,
            config: self.config,
            agents: deps.agents,
            sleeper: deps.sleeper,
            jitter: deps.jitter,
            confirm: deps.confirm,
            cancel: deps.cancel,
        };
        let outcome = run_build(&env, options)?;
        if sequential && PrdSource::new(&state.prd_path).counts_lenient()?.remaining == 0 {
            self.clear_active(id)?;
        }
        Ok(outcome)
    }

    /// Without a worktree the trunk working copy is shared: refuse trunk unless
    /// allowed, and allow only one active stream at a time.
    fn guard_sequential_build(&self, id: u32, allow_trunk: bool) -> Result<()> {
        let branch = self
            .git
            .current_branch()
            .map_err(|err| Fault::GitState(format!("{err:#}")))?;
        if branch == self.config.trunk_branch && !allow_trunk {
            return Err(Fault::Configuration(format!(
                "stream {id} has no worktree and the working copy is on trunk '{branch}'; \
                 run `buildloop stream init {id}` or pass --allow-trunk"
            ))
            .into());
        }
        if let Some(active) = self.active_stream()? {
            if active != id {
                let other = self.status(active)?.status;
                if !matches!(
                    other,
                    StreamStatus::Completed | StreamStatus::Merged | StreamStatus::NotFound
                ) {
                    return Err(Fault::Configuration(format!(
                        "stream {active} is active in this working copy ({other}); finish or merge it \
                         first, or give each stream a worktree with `buildloop stream init`"
                    ))
                    .into());
                }
                info!(previous = active, "replacing finished active stream");
            }
        }
        write_atomic(&self.paths.active_stream_path, &format!("{id}\n"))
    }

    pub fn active_stream(&self) -> Result<Option<u32>> {
        match fs::read_to_string(&self.paths.active_stream_path) {
            Ok(text) => Ok(text.trim().parse().ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("read {}", self.paths.active_stream_path.display())),
        }
    }

    fn clear_active(&self, id: u32) -> Result<()> {
        if self.active_stream()? == Some(id) {
            remove_if_exists(&self.paths.active_stream_path)?;
            info!(stream = id, "cleared active stream marker");
        }
        Ok(())
    }

    /// Merge `stream/<id>` into trunk while holding the merge lock.
    pub fn merge(
        &self,
        id: u32,
        options: &MergeOptions,
        sleeper: &dyn Sleeper,
        confirm: &dyn Confirm,
    ) -> Result<MergeReport> {
        let canonical = self.require_stream(id)?;
        let info = self.status(id)?;
        match info.status {
            StreamStatus::Merged => {
                info!(stream = id, "already merged");
                return Ok(MergeReport::AlreadyMerged);
            }
            StreamStatus::Running => {
                let holder = info.run_holder.map(|h| h.pid).unwrap_or_default();
                return Err(Fault::Configuration(format!(
                    "stream {id} is being built (pid {holder}); wait for the build to finish"
                ))
                .into());
            }
            StreamStatus::Completed => {}
            other if options.force => {
                warn!(stream = id, status = %other, "merging incomplete stream (--force)");
            }
            other => {
                return Err(Fault::Configuration(format!(
                    "stream {id} is {other} ({}/{} items done); pass --force to merge anyway",
                    info.counts.done(),
                    info.counts.total
                ))
                .into());
            }
        }

        let lock = Lock::file(&self.paths.merge_lock_path);
        if options.force_unlock {
            self.force_unlock(&lock, options.yes, confirm)?;
        }
        let queue = MergeQueue::new(&self.paths.merge_queue_dir, &self.paths.merge_stats_path);
        let guard = if options.wait {
            match wait_with_backoff(
                &lock,
                &queue,
                id,
                Duration::from_secs(self.config.merge.wait_timeout_secs),
                Duration::from_secs(self.config.merge.estimated_merge_secs),
                sleeper,
            )? {
                WaitOutcome::Acquired(guard) => guard,
                WaitOutcome::TimedOut { holder } => {
                    let holder = holder
                        .map(|h| format!("{} (pid {}) since {}", h.owner, h.pid, h.acquired_at.to_rfc3339()))
                        .unwrap_or_else(|| "nobody".to_string());
                    bail!(
                        "timed out after {} waiting for the merge lock; held by {holder}",
                        format_duration(self.config.merge.wait_timeout_secs)
                    );
                }
                WaitOutcome::Interrupted => {
                    return Err(Fault::Interrupted {
                        code: sleeper.interrupt_code(),
                    }
                    .into());
                }
            }
        } else {
            match lock.acquire(MERGE_OWNER)? {
                Acquire::Acquired(guard) => guard,
                Acquire::HeldBy(holder) => {
                    return Err(Fault::LockContention {
                        lock: lock.name(),
                        holder: holder.owner,
                        pid: holder.pid,
                        since: holder.acquired_at.to_rfc3339(),
                    })
                    .context("retry with --wait to queue for the merge lock");
                }
            }
        };

        let started = Instant::now();
        let report = self.merge_locked(id, &canonical, options)?;
        if matches!(report, MergeReport::Merged { .. }) {
            queue.record_merge(started.elapsed())?;
        }
        guard.release()?;
        Ok(report)
    }

    fn force_unlock(&self, lock: &Lock, yes: bool, confirm: &dyn Confirm) -> Result<()> {
        let Some(holder) = lock.holder()? else {
            info!("merge lock is free, nothing to force-unlock");
            return Ok(());
        };
        if !yes {
            if !confirm.is_interactive() {
                return Err(Fault::Configuration(
                    "--force-unlock needs --yes when not running in a terminal".to_string(),
                )
                .into());
            }
            let question = format!(
                "Remove the merge lock held by {} (pid {}, alive: {}) since {}?",
                holder.owner,
                holder.pid,
                lock.holder_alive(&holder),
                holder.acquired_at.to_rfc3339()
            );
            if !confirm.confirm(&question)? {
                bail!("force-unlock declined");
            }
        }
        lock.force_unlock()?;
        Ok(())
    }

    fn merge_locked(&self, id: u32, canonical: &StatePaths, options: &MergeOptions) -> Result<MergeReport> {
        let trunk = &self.config.trunk_branch;
        let current = self
            .git
            .current_branch()
            .map_err(|err| Fault::GitState(format!("{err:#}")))?;
        if &current != trunk {
            return Err(Fault::GitState(format!(
                "merges run from trunk; the working copy is on '{current}', check out '{trunk}' first"
            ))
            .into());
        }
        self.git
            .ensure_clean()
            .map_err(|err| Fault::GitState(format!("{err:#}")))?;

        let branch = ProjectPaths::stream_branch(id);
        let worktree = self.paths.worktree_dir(id);
        if !self.git.branch_exists(&branch)? {
            if worktree.exists() {
                return Err(Fault::GitState(format!(
                    "worktree {} exists but branch {branch} is missing",
                    worktree.display()
                ))
                .into());
            }
            self.mark_merged(id, canonical)?;
            info!(stream = id, "no branch to merge, marked merged");
            return Ok(MergeReport::NothingToMerge);
        }

        if options.rebase && worktree.exists() {
            info!(stream = id, onto = %trunk, "rebasing stream before merge");
            Git::new(&worktree)
                .rebase(trunk)
                .map_err(|err| Fault::GitState(format!("{err:#}")))?;
        }

        let started = Instant::now();
        let conflicts = self
            .git
            .merge_conflicts(&branch)
            .map_err(|err| Fault::GitState(format!("{err:#}")))?;
        if !conflicts.is_empty() {
            return Err(Fault::GitState(format!(
                "merging {branch} into {trunk} would conflict in:\n  {}\nresolve on the stream branch or retry with --rebase",
                conflicts.join("\n  ")
            ))
            .into());
        }
        let kind = self
            .git
            .merge_branch(&branch, &format!("Merge stream {id} ({branch})"))
            .map_err(|err| Fault::GitState(format!("{err:#}")))?;

        if worktree.exists() {
            let source = StatePaths::new(worktree.join(ProjectPaths::stream_state_relative(id)));
            sync_state(&source, canonical)?;
        }
        self.mark_merged(id, canonical)?;
        let duration = started.elapsed();
        info!(stream = id, kind = ?kind, duration_ms = duration.as_millis() as u64, "merged stream");
        Ok(MergeReport::Merged { kind, duration })
    }

    fn mark_merged(&self, id: u32, canonical: &StatePaths) -> Result<()> {
        write_json(
            &canonical.merged_marker_path,
            &MergedMarker {
                merged_at: Utc::now(),
                trunk_sha: self.git.head_sha()?,
            },
        )?;
        self.clear_active(id)
    }

    /// Remove the worktree and branch of a merged stream.
    pub fn cleanup(&self, id: u32, force: bool) -> Result<()> {
        self.require_stream(id)?;
        let status = self.status(id)?.status;
        if status == StreamStatus::Running {
            return Err(Fault::Configuration(format!("stream {id} is being built")).into());
        }
        if status != StreamStatus::Merged && !force {
            return Err(Fault::Configuration(format!(
                "stream {id} is {status}, not merged; pass --force to discard its worktree and branch"
            ))
            .into());
        }
        let worktree = self.paths.worktree_dir(id);
        self.git
            .worktree_remove(&worktree)
            .map_err(|err| Fault::GitState(format!("{err:#}")))?;
        let branch = ProjectPaths::stream_branch(id);
        if self
            .git
            .delete_branch(&branch, force)
            .map_err(|err| Fault::GitState(format!("{err:#}")))?
        {
            info!(stream = id, branch = %branch, "deleted branch");
        }
        self.clear_active(id)?;
        info!(stream = id, "cleaned up stream");
        Ok(())
    }

    /// Holder and waiters of the merge lock.
    pub fn merge_status(&self) -> Result<MergeStatus> {
        let lock = Lock::file(&self.paths.merge_lock_path);
        let queue = MergeQueue::new(&self.paths.merge_queue_dir, &self.paths.merge_stats_path);
        let fallback = Duration::from_secs(self.config.merge.estimated_merge_secs);
        let holder = lock.holder()?;
        let holder_alive = holder.as_ref().is_some_and(|h| lock.holder_alive(h));
        let now = Utc::now();
        let mut waiters = Vec::new();
        for (idx, entry) in queue.entries()?.into_iter().enumerate() {
            let position = idx + 1;
            let eta = queue.estimate(position, holder.as_ref(), fallback)?;
            waiters.push(Waiter {
                waiting: (now - entry.registered_at).to_std().unwrap_or(Duration::ZERO),
                entry,
                position,
                eta,
            });
        }
        Ok(MergeStatus {
            holder,
            holder_alive,
            waiters,
            average_merge: queue.average_merge_duration(fallback)?,
        })
    }

    fn require_stream(&self, id: u32) -> Result<StatePaths> {
        let canonical = self.paths.stream_state(id);
        if !canonical.dir.exists() {
            return Err(Fault::Configuration(format!(
                "stream {id} does not exist (create one with `buildloop stream new`)"
            ))
            .into());
        }
        Ok(canonical)
    }
}

fn placeholder_prd(id: u32) -> String {
    format!(
        "# Stream {id} requirements\n\n\
         Add one heading per work item, for example `### [ ] US-001: Title`,\n\
         followed by its acceptance criteria.\n"
    )
}

/// Copy config and prompt overrides into a worktree's state root.
fn copy_project_files(from: &Path, to: &Path) -> Result<()> {
    let read_dir = match fs::read_dir(from) {
        Ok(rd) => rd,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("read {}", from.display())),
    };
    for dirent in read_dir {
        let path = dirent.with_context(|| format!("read {}", from.display()))?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let wanted = name == "config.toml" || (name.starts_with("PROMPT_") && name.ends_with(".md"));
        if wanted && path.is_file() {
            fs::copy(&path, to.join(name))
                .with_context(|| format!("copy {} into {}", path.display(), to.display()))?;
        }
    }
    Ok(())
}

/// Copy the syncable state files of `from` over those of `to`.
pub fn sync_state(from: &StatePaths, to: &StatePaths) -> Result<()> {
    fs::create_dir_all(&to.dir).with_context(|| format!("create {}", to.dir.display()))?;
    for (src, dst) in from.syncable_entries().into_iter().zip(to.syncable_entries()) {
        if src.is_dir() {
            copy_dir(src, dst)?;
        } else if src.is_file() {
            fs::copy(src, dst)
                .with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
        }
    }
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).with_context(|| format!("create {}", to.display()))?;
    for dirent in fs::read_dir(from).with_context(|| format!("read {}", from.display()))? {
        let path = dirent.with_context(|| format!("read {}", from.display()))?.path();
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = to.join(name);
        if path.is_dir() {
            copy_dir(&path, &target)?;
        } else {
            fs::copy(&path, &target)
                .with_context(|| format!("copy {} to {}", path.display(), target.display()))?;
        }
    }
    Ok(())
}

/// Table for `stream list`.
pub fn render_stream_list(streams: &[StreamInfo]) -> String {
    if streams.is_empty() {
        return "No streams. Create one with `buildloop stream new`.\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(out, "{:>4}  {:<12}  {:<8}  Items", "ID", "Status", "Worktree");
    for s in streams {
        let _ = writeln!(
            out,
            "{:>4}  {:<12}  {:<8}  {}/{} done",
            s.id,
            s.status.as_str(),
            if s.has_worktree { "yes" } else { "no" },
            s.counts.done(),
            s.counts.total
        );
    }
    out
}

/// Details for `stream status <id>`.
pub fn render_stream_info(info: &StreamInfo) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Stream {}", info.id);
    let _ = writeln!(out, "  status:    {}", info.status);
    let _ = writeln!(out, "  branch:    {}", info.branch);
    let _ = writeln!(out, "  worktree:  {}", if info.has_worktree { "yes" } else { "no" });
    let _ = writeln!(
        out,
        "  items:     {}/{} done, {} remaining",
        info.counts.done(),
        info.counts.total,
        info.counts.remaining
    );
    if let Some(holder) = &info.run_holder {
        let _ = writeln!(
            out,
            "  running:   pid {} since {}",
            holder.pid,
            holder.acquired_at.to_rfc3339()
        );
    }
    if let Some(cp) = &info.checkpoint {
        let _ = writeln!(
            out,
            "  checkpoint: iteration {} on {} at {} ({})",
            cp.iteration,
            cp.story_id,
            cp.git_sha.chars().take(12).collect::<String>(),
            cp.agent
        );
    }
    out
}

/// Report for `stream merge-status`.
pub fn render_merge_status(status: &MergeStatus) -> String {
    let mut out = String::new();
    match &status.holder {
        Some(holder) => {
            let held = (Utc::now() - holder.acquired_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let _ = writeln!(
                out,
                "Merge lock: held by {} (pid {}, {}) for {}",
                holder.owner,
                holder.pid,
                if status.holder_alive { "alive" } else { "stale" },
                format_duration(held.as_secs())
            );
        }
        None => out.push_str("Merge lock: free\n"),
    }
    if status.waiters.is_empty() {
        out.push_str("Queue: empty\n");
    } else {
        let _ = writeln!(out, "Queue ({} waiting):", status.waiters.len());
        for w in &status.waiters {
            let _ = writeln!(
                out,
                "  {}. stream {} (pid {}) waiting {}, eta {}",
                w.position,
                w.entry.stream_id,
                w.entry.pid,
                format_duration(w.waiting.as_secs()),
                format_duration(w.eta.as_secs())
            );
        }
    }
    let _ = writeln!(
        out,
        "Average merge: {}",
        format_duration(status.average_merge.as_secs())
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::confirm::{FixedAnswer, NonInteractive};
    use crate::test_support::{
        AgentStep, NoopSleeper, RecordingSleeper, ScriptedAgent, TestRepo, no_jitter, prd_document,
    };

    fn config() -> BuildConfig {
        let mut config = BuildConfig::default();
        config.agents.chain = vec!["claude".into()];
        config.merge.wait_timeout_secs = 5;
        config
    }

    fn seed(repo: &TestRepo, name: &str, items: &[(&str, &str, bool)]) -> PathBuf {
        let path = repo.root().join("..").join(name);
        fs::write(&path, prd_document(items)).expect("write seed");
        path
    }

    fn build(streams: &Streams<'_>, id: u32, agent: &ScriptedAgent, allow_trunk: bool) -> Result<BuildOutcome> {
        let cancel = CancelToken::new();
        let deps = BuildDeps {
            agents: agent,
            sleeper: &NoopSleeper,
            jitter: no_jitter,
            confirm: &NonInteractive,
            cancel: &cancel,
        };
        let options = BuildOptions {
            iterations: 5,
            no_commit: false,
            resume: false,
        };
        streams.build(id, &options, allow_trunk, &deps)
    }

    #[test]
    fn create_allocates_increasing_ids() {
        let repo = TestRepo::new().expect("repo");
        let config = config();
        let streams = Streams::new(repo.root(), &config);
        assert_eq!(streams.create(None).expect("create"), 1);
        assert_eq!(streams.create(None).expect("create"), 2);
        assert_eq!(streams.ids().expect("ids"), vec![1, 2]);
        let info = streams.status(1).expect("status");
        assert_eq!(info.status, StreamStatus::Ready);
        assert_eq!(info.counts.total, 0);
        assert_eq!(streams.status(9).expect("status").status, StreamStatus::NotFound);
        assert!(repo.git().is_clean().expect("clean"));
    }

    #[test]
    fn status_follows_item_counts() {
        let repo = TestRepo::new().expect("repo");
        let config = config();
        let streams = Streams::new(repo.root(), &config);
        let prd = seed(&repo, "seed.md", &[("US-001", "A", true), ("US-002", "B", false)]);
        let id = streams.create(Some(&prd)).expect("create");
        assert_eq!(streams.status(id).expect("status").status, StreamStatus::InProgress);

        let state = streams.paths().stream_state(id);
        fs::write(&state.prd_path, prd_document(&[("US-001", "A", true)])).expect("write");
        assert_eq!(streams.status(id).expect("status").status, StreamStatus::Completed);
    }

    #[test]
    fn build_on_trunk_without_worktree_is_refused() {
        let repo = TestRepo::new().expect("repo");
        let config = config();
        let streams = Streams::new(repo.root(), &config);
        let prd = seed(&repo, "seed.md", &[("US-001", "A", false)]);
        let id = streams.create(Some(&prd)).expect("create");
        let agent = ScriptedAgent::new(&["claude"], Vec::new());
        let err = build(&streams, id, &agent, false).expect_err("refused");
        assert!(err.to_string().contains("--allow-trunk"));
        assert!(agent.calls().is_empty());
    }

    #[test]
    fn second_active_stream_is_refused_in_sequential_mode() {
        let repo = TestRepo::new().expect("repo");
        let config = config();
        let streams = Streams::new(repo.root(), &config);
        let prd = seed(&repo, "seed.md", &[("US-001", "A", false), ("US-002", "B", false)]);
        let first = streams.create(Some(&prd)).expect("create");
        let second = streams.create(Some(&prd)).expect("create");
        let first_prd = streams.paths().stream_state(first).prd_path;

        let agent = ScriptedAgent::new(
            &["claude"],
            vec![AgentStep::success("one").marking_done(&first_prd, "US-001")],
        );
        let cancel = CancelToken::new();
        let deps = BuildDeps {
            agents: &agent,
            sleeper: &NoopSleeper,
            jitter: no_jitter,
            confirm: &NonInteractive,
            cancel: &cancel,
        };
        let one = BuildOptions {
            iterations: 1,
            no_commit: false,
            resume: false,
        };
        streams.build(first, &one, true, &deps).expect("first build");
        assert_eq!(streams.active_stream().expect("active"), Some(first));

        let err = streams.build(second, &one, true, &deps).expect_err("refused");
        assert!(err.to_string().contains(&format!("stream {first} is active")));
    }

    #[test]
    fn worktree_build_merge_and_cleanup() {
        let repo = TestRepo::new().expect("repo");
        let config = config();
        let streams = Streams::new(repo.root(), &config);
        let prd = seed(&repo, "seed.md", &[("US-001", "Add feature", false)]);
        let id = streams.create(Some(&prd)).expect("create");
        let worktree = streams.init_worktree(id).expect("init");
        assert_eq!(streams.init_worktree(id).expect("init again"), worktree);
        let worktree_prd = worktree
            .join(ProjectPaths::stream_state_relative(id))
            .join("prd.md");
        assert!(worktree_prd.exists());

        let agent = ScriptedAgent::new(
            &["claude"],
            vec![AgentStep::success("done")
                .with_file("feature.txt", "feature\n")
                .marking_done(&worktree_prd, "US-001")
                .with_commit("US-001: add feature")],
        );
        let outcome = build(&streams, id, &agent, false).expect("build");
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(agent.calls()[0].workdir, worktree);
        assert_eq!(streams.status(id).expect("status").status, StreamStatus::Completed);

        let report = streams
            .merge(id, &MergeOptions::default(), &NoopSleeper, &NonInteractive)
            .expect("merge");
        assert!(matches!(report, MergeReport::Merged { kind: MergeKind::FastForward, .. }));
        assert_eq!(repo.read("feature.txt").expect("merged file"), "feature\n");
        assert_eq!(streams.status(id).expect("status").status, StreamStatus::Merged);
        let canonical = streams.paths().stream_state(id);
        assert!(fs::read_to_string(&canonical.prd_path).expect("prd").contains("[x] US-001"));
        assert_eq!(
            streams
                .merge(id, &MergeOptions::default(), &NoopSleeper, &NonInteractive)
                .expect("again"),
            MergeReport::AlreadyMerged
        );

        streams.cleanup(id, false).expect("cleanup");
        assert!(!worktree.exists());
        assert!(!repo.git().branch_exists("stream/1").expect("branch"));
        assert_eq!(streams.status(id).expect("status").status, StreamStatus::Merged);
    }

    #[test]
    fn merge_requires_completed_stream() {
        let repo = TestRepo::new().expect("repo");
        let config = config();
        let streams = Streams::new(repo.root(), &config);
        let prd = seed(&repo, "seed.md", &[("US-001", "A", false)]);
        let id = streams.create(Some(&prd)).expect("create");
        let err = streams
            .merge(id, &MergeOptions::default(), &NoopSleeper, &NonInteractive)
            .expect_err("not completed");
        assert!(err.to_string().contains("--force"));
        assert!(streams.cleanup(id, false).is_err());
    }

    #[test]
    fn conflicting_merge_reports_paths_and_leaves_trunk_untouched() {
        let repo = TestRepo::new().expect("repo");
        let config = config();
        let streams = Streams::new(repo.root(), &config);
        let prd = seed(&repo, "seed.md", &[("US-001", "A", true)]);
        let id = streams.create(Some(&prd)).expect("create");
        let worktree = streams.init_worktree(id).expect("init");
        fs::write(worktree.join("README.md"), "stream version\n").expect("write");
        let wt_git = Git::new(&worktree);
        wt_git.add_all().expect("add");
        wt_git.commit_staged("stream change").expect("commit");

        repo.write("README.md", "trunk version\n").expect("write");
        let trunk_head = repo.commit_all("trunk change").expect("commit");

        let err = streams
            .merge(id, &MergeOptions::default(), &NoopSleeper, &NonInteractive)
            .expect_err("conflict");
        let text = format!("{err:#}");
        assert!(text.contains("README.md"), "{text}");
        assert_eq!(repo.git().head_sha().expect("head"), trunk_head);
        assert!(repo.git().is_clean().expect("clean"));
        assert!(Lock::file(&streams.paths().merge_lock_path).holder().expect("holder").is_none());
    }

    #[test]
    fn held_merge_lock_fails_fast_or_times_out() {
        let repo = TestRepo::new().expect("repo");
        let config = config();
        let streams = Streams::new(repo.root(), &config);
        let prd = seed(&repo, "seed.md", &[("US-001", "A", true)]);
        let id = streams.create(Some(&prd)).expect("create");
        let lock = Lock::file(&streams.paths().merge_lock_path);
        let Acquire::Acquired(_guard) = lock.acquire(MERGE_OWNER).expect("acquire") else {
            panic!("lock should be free");
        };

        let err = streams
            .merge(id, &MergeOptions::default(), &NoopSleeper, &NonInteractive)
            .expect_err("held");
        assert_eq!(crate::error::exit_code_for(&err), crate::exit_codes::FATAL);

        let sleeper = RecordingSleeper::new();
        let wait = MergeOptions {
            wait: true,
            ..MergeOptions::default()
        };
        let err = streams
            .merge(id, &wait, &sleeper, &NonInteractive)
            .expect_err("timeout");
        assert_eq!(crate::error::exit_code_for(&err), crate::exit_codes::FAILED);
        assert!(err.to_string().contains("timed out"));
        let total: Duration = sleeper.slept().into_iter().sum();
        assert_eq!(total, Duration::from_secs(5));

        let interrupted = RecordingSleeper::interrupting();
        let err = streams
            .merge(id, &wait, &interrupted, &NonInteractive)
            .expect_err("interrupted");
        assert_eq!(crate::error::exit_code_for(&err), 130);
    }

    #[test]
    fn force_unlock_needs_confirmation() {
        let repo = TestRepo::new().expect("repo");
        let config = config();
        let streams = Streams::new(repo.root(), &config);
        let prd = seed(&repo, "seed.md", &[("US-001", "A", true)]);
        let id = streams.create(Some(&prd)).expect("create");
        let lock = Lock::file(&streams.paths().merge_lock_path);
        let Acquire::Acquired(guard) = lock.acquire("wedged").expect("acquire") else {
            panic!("lock should be free");
        };
        let options = MergeOptions {
            force_unlock: true,
            ..MergeOptions::default()
        };
        assert!(streams.merge(id, &options, &NoopSleeper, &NonInteractive).is_err());
        assert!(streams.merge(id, &options, &NoopSleeper, &FixedAnswer(false)).is_err());
        let report = streams
            .merge(id, &options, &NoopSleeper, &FixedAnswer(true))
            .expect("merge after unlock");
        assert_eq!(report, MergeReport::NothingToMerge);
        drop(guard);
    }

    #[test]
    fn stream_info_shortens_checkpoint_sha_by_chars() {
        let info = StreamInfo {
            id: 4,
            status: StreamStatus::InProgress,
            branch: "stream/4".into(),
            has_worktree: true,
            counts: ItemCounts {
                total: 2,
                remaining: 1,
            },
            run_holder: None,
            checkpoint: Some(Checkpoint {
                iteration: 3,
                story_id: "US-002".into(),
                git_sha: "0123456789éabcdef".into(),
                agent: "claude".into(),
                created_at: Utc::now(),
            }),
        };
        let text = render_stream_info(&info);
        assert!(text.contains("iteration 3 on US-002"), "{text}");
        assert!(text.contains("at 0123456789éa (claude)"), "{text}");
    }

    #[test]
    fn merge_status_lists_holder_and_waiters() {
        let repo = TestRepo::new().expect("repo");
        let config = config();
        let streams = Streams::new(repo.root(), &config);
        let lock = Lock::file(&streams.paths().merge_lock_path);
        let Acquire::Acquired(_guard) = lock.acquire(MERGE_OWNER).expect("acquire") else {
            panic!("lock should be free");
        };
        let queue = MergeQueue::new(&streams.paths().merge_queue_dir, &streams.paths().merge_stats_path);
        let _registration = queue.register(3).expect("register");

        let status = streams.merge_status().expect("status");
        assert!(status.holder_alive);
        assert_eq!(status.waiters.len(), 1);
        assert_eq!(status.waiters[0].entry.stream_id, 3);
        assert_eq!(status.average_merge, Duration::from_secs(60));
        let text = render_merge_status(&status);
        assert!(text.contains("held by merge"));
        assert!(text.contains("1. stream 3"));
    }
}
