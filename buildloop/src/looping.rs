//! Multi-iteration build loop for `buildloop build` and `stream build`.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use tracing::info;

use crate::core::summary::{SummaryRow, render_summary};
use crate::core::types::IterationStatus;
use crate::error::Fault;
use crate::exit_codes;
use crate::io::agent::AgentRunner;
use crate::io::checkpoint::{CheckpointStore, ResumeDecision, validate_resume};
use crate::io::config::BuildConfig;
use crate::io::confirm::Confirm;
use crate::io::git::Git;
use crate::io::lock::{Acquire, Lock, LockGuard};
use crate::io::paths::StatePaths;
use crate::io::prompt::PromptTemplates;
use crate::io::run_log::{IterationRecord, RunLog};
use crate::io::signals::{CancelToken, Sleeper};
use crate::io::switch_state::SwitchStateStore;
use crate::io::work_source::{PrdSource, WorkItemSource};
use crate::iteration::{IterationContext, IterationOutcome};
use crate::retry::Backoff;

/// Reason why [`run_build`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// No unresolved work items remain.
    AllDone,
    /// The agent printed the completion sentinel.
    Complete,
    /// The requested number of iterations ran.
    IterationLimit,
    Interrupted { code: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub iterations: u32,
    pub no_commit: bool,
    pub resume: bool,
}

/// Summary of a build invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub run_id: String,
    pub started_at_iter: u32,
    pub records: Vec<IterationRecord>,
    pub stop: LoopStop,
}

impl BuildOutcome {
    pub fn exit_code(&self) -> i32 {
        if let LoopStop::Interrupted { code } = self.stop {
            return code;
        }
        if self
            .records
            .iter()
            .any(|r| r.status == IterationStatus::Error)
        {
            exit_codes::FAILED
        } else {
            exit_codes::OK
        }
    }

    pub fn summary(&self) -> String {
        let rows: Vec<SummaryRow> = self.records.iter().map(IterationRecord::summary_row).collect();
        render_summary(&rows)
    }
}

/// Everything a build needs that is not derived from the working copy itself.
pub struct BuildEnv<'a> {
    /// Working copy the agent runs in.
    pub workdir: &'a Path,
    /// State of the build (default or per-stream).
    pub state: &'a StatePaths,
    /// Directory holding `PROMPT_<name>.md` overrides.
    pub prompt_dir: &'a Path,
    pub config: &'a BuildConfig,
    pub agents: &'a dyn AgentRunner,
    pub sleeper: &'a dyn Sleeper,
    pub jitter: fn() -> Duration,
    pub confirm: &'a dyn Confirm,
    pub cancel: &'a CancelToken,
}

/// Run up to `options.iterations` iterations against `env.state`.
///
/// Stops early when every work item is done, when the completion sentinel is
/// seen, or on interrupt. Fatal faults are returned as errors.
pub fn run_build(env: &BuildEnv<'_>, options: &BuildOptions) -> Result<BuildOutcome> {
    let git = Git::new(env.workdir);
    if !git.is_repository() {
        return Err(Fault::GitState(format!(
            "{} is not a git repository",
            env.workdir.display()
        ))
        .into());
    }
    env.config.validate()?;
    let classifier = env.config.classifier()?;
    let chain = env.config.fallback_chain()?;
    let source = PrdSource::new(&env.state.prd_path);
    let counts = source.counts()?;
    let templates = PromptTemplates::load(env.prompt_dir)?;

    if !chain.agents().iter().any(|a| env.agents.is_available(a)) {
        return Err(Fault::Configuration(format!(
            "no agent of the chain [{}] is available on PATH",
            chain.agents().join(", ")
        ))
        .into());
    }

    let checkpoints = CheckpointStore::new(&env.state.checkpoint_path);
    let mut started_at_iter = 1;
    if options.resume {
        match checkpoints.load()? {
            Some(checkpoint) => {
                let head = git.head_sha()?;
                if let ResumeDecision::Diverged { head } =
                    validate_resume(&checkpoint, &head, env.confirm)?
                {
                    info!(head = %head, "resuming on a diverged HEAD as confirmed");
                }
                started_at_iter = checkpoint.iteration.max(1);
            }
            None => info!("no checkpoint found, starting from iteration 1"),
        }
    }

    let switch_store = SwitchStateStore::new(&env.state.switch_state_path);
    let mut switch = switch_store.load_or_init(&chain, |a| env.agents.is_available(a))?;
    let run_log = RunLog::new(env.state.clone());
    let run_id = new_run_id();
    info!(
        run_id = %run_id,
        iterations = options.iterations,
        start = started_at_iter,
        remaining = counts.remaining,
        total = counts.total,
        agent = %switch.current_agent,
        "starting build"
    );

    let ctx = IterationContext {
        workdir: env.workdir,
        git: &git,
        config: env.config,
        classifier: &classifier,
        chain: &chain,
        state: env.state,
        source: &source,
        templates: &templates,
        agents: env.agents,
        backoff: Backoff {
            sleeper: env.sleeper,
            jitter: env.jitter,
        },
        run_log: &run_log,
        checkpoints: &checkpoints,
        switch_store: &switch_store,
        run_id: &run_id,
        no_commit: options.no_commit,
    };

    let mut records = Vec::new();
    let mut stop = LoopStop::IterationLimit;
    for offset in 0..options.iterations {
        if env.cancel.is_cancelled() {
            stop = LoopStop::Interrupted {
                code: env.cancel.exit_code(),
            };
            break;
        }
        let iteration = started_at_iter + offset;
        match ctx.run_iteration(iteration, &mut switch)? {
            IterationOutcome::NoWorkLeft => {
                stop = LoopStop::AllDone;
                break;
            }
            IterationOutcome::Finished { record, complete } => {
                records.push(record);
                if complete {
                    stop = LoopStop::Complete;
                    break;
                }
            }
            IterationOutcome::Interrupted { code } => {
                stop = LoopStop::Interrupted { code };
                break;
            }
        }
    }
    if stop == LoopStop::IterationLimit && source.counts()?.remaining == 0 {
        stop = LoopStop::AllDone;
    }
    if matches!(stop, LoopStop::AllDone | LoopStop::Complete) {
        checkpoints.clear()?;
    }
    info!(run_id = %run_id, iterations = records.len(), stop = ?stop, "build finished");
    Ok(BuildOutcome {
        run_id,
        started_at_iter,
        records,
        stop,
    })
}

/// Take the run lock of `state`, failing fast when a live process holds it.
pub fn acquire_run_lock(state: &StatePaths, owner: &str) -> Result<LockGuard> {
    let lock = Lock::file(&state.run_lock_path);
    match lock.acquire(owner)? {
        Acquire::Acquired(guard) => Ok(guard),
        Acquire::HeldBy(holder) => Err(Fault::LockContention {
            lock: lock.name(),
            holder: holder.owner,
            pid: holder.pid,
            since: holder.acquired_at.to_rfc3339(),
        }
        .into()),
    }
}

/// Run id: local start time plus pid, unique per process.
pub fn new_run_id() -> String {
    format!("{}-{}", Local::now().format("%Y%m%d-%H%M%S"), std::process::id())
}
