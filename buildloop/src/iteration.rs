//! One build-loop iteration.
//!
//! `selecting -> executing -> classifying -> {rolling back + retrying |
//! switching} -> checkpointing`. Rollback-retry is attempted first; the
//! fallback chain only sees the failure once rollback-retry is exhausted or
//! does not apply. Interrupts abort immediately, leaving the pre-story
//! checkpoint in place.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::core::classifier::FailureClassifier;
use crate::core::fallback::{FallbackChain, SwitchDecision, SwitchState};
use crate::core::types::{FailureKind, IterationStatus, WorkItem};
use crate::error::Fault;
use crate::io::agent::{AgentRequest, AgentRunner, append_line};
use crate::io::checkpoint::{Checkpoint, CheckpointStore};
use crate::io::config::{BuildConfig, write_atomic};
use crate::io::git::Git;
use crate::io::paths::StatePaths;
use crate::io::prompt::{PromptTemplates, PromptVars, RetryVars};
use crate::io::run_log::{GitActivity, IterationFiles, IterationRecord, RunLog, SwitchRecord};
use crate::io::switch_state::SwitchStateStore;
use crate::io::work_source::WorkItemSource;
use crate::retry::{Backoff, read_log_from, run_with_retry};
use crate::rollback::{
    Rollback, RollbackOutcome, clear_retry_count, read_failure_context, read_retry_count,
    write_retry_count,
};

/// Collaborators of one build run.
pub struct IterationContext<'a> {
    pub workdir: &'a Path,
    pub git: &'a Git,
    pub config: &'a BuildConfig,
    pub classifier: &'a FailureClassifier,
    pub chain: &'a FallbackChain,
    pub state: &'a StatePaths,
    pub source: &'a dyn WorkItemSource,
    pub templates: &'a PromptTemplates,
    pub agents: &'a dyn AgentRunner,
    pub backoff: Backoff<'a>,
    pub run_log: &'a RunLog,
    pub checkpoints: &'a CheckpointStore,
    pub switch_store: &'a SwitchStateStore,
    pub run_id: &'a str,
    pub no_commit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// Every work item is done.
    NoWorkLeft,
    Finished {
        record: IterationRecord,
        /// The agent printed the completion sentinel.
        complete: bool,
    },
    Interrupted { code: i32 },
}

/// Output of the agent after retries.
struct Attempt {
    exit_code: i32,
    retry_count: u32,
    wait: Duration,
    /// Output of the last attempt only.
    output: String,
}

impl IterationContext<'_> {
    pub fn run_iteration(&self, iteration: u32, switch: &mut SwitchState) -> Result<IterationOutcome> {
        let Some(item) = self.source.next_item()? else {
            return Ok(IterationOutcome::NoWorkLeft);
        };
        let started_at = Utc::now();
        let clock = Instant::now();
        let head_before = self
            .git
            .head_sha()
            .map_err(|err| Fault::GitState(format!("cannot read HEAD: {err:#}")))?;
        self.ensure_agent_available(switch)?;
        let agent = switch.current_agent.clone();

        self.checkpoints.save(&Checkpoint {
            iteration,
            story_id: item.id.clone(),
            git_sha: head_before.clone(),
            agent: agent.clone(),
            created_at: started_at,
        })?;
        let files = self.run_log.iteration_files(self.run_id, iteration);
        info!(iteration, story = %item.id, agent = %agent, "starting iteration");

        let vars = self.prompt_vars(iteration, &item, &agent);
        let prompt = match self.templates.render_build(&vars) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(err = %err, "prompt render failed, agent not invoked");
                append_line(&files.log_path, &format!("[buildloop] {err:#}"))?;
                let attempt = Attempt {
                    exit_code: 1,
                    retry_count: 0,
                    wait: Duration::ZERO,
                    output: String::new(),
                };
                let tally = Tally {
                    resolved: false,
                    kind: FailureKind::Error,
                    attempt,
                    rolled_back: false,
                    rollback_retries: 0,
                };
                let record = self.checkpoint_iteration(
                    iteration, &item, &agent, &head_before, &files, started_at, clock, tally, None,
                    switch,
                )?;
                return Ok(IterationOutcome::Finished {
                    record,
                    complete: false,
                });
            }
        };

        let attempt = self.execute(&agent, &prompt, &files, "RETRY ATTEMPT")?;
        let kind = self.classifier.classify(attempt.exit_code, &attempt.output);
        debug!(exit_code = attempt.exit_code, kind = %kind, "classified");
        if kind == FailureKind::Interrupted {
            warn!(iteration, story = %item.id, "iteration interrupted");
            return Ok(IterationOutcome::Interrupted {
                code: attempt.exit_code,
            });
        }

        let tally = if kind == FailureKind::Success {
            Tally {
                resolved: true,
                kind,
                attempt,
                rolled_back: false,
                rollback_retries: 0,
            }
        } else {
            self.rollback_and_retry(iteration, &item, &agent, &head_before, &files, &vars, attempt, kind)?
        };
        if let Some(code) = tally.interrupt_code() {
            return Ok(IterationOutcome::Interrupted { code });
        }

        let complete =
            tally.resolved && tally.attempt.output.contains(&self.config.completion_sentinel);
        let switch_record = self.update_chain(switch, &tally);
        let record = self.checkpoint_iteration(
            iteration,
            &item,
            &agent,
            &head_before,
            &files,
            started_at,
            clock,
            tally,
            switch_record,
            switch,
        )?;
        if complete {
            info!(iteration, "completion sentinel found");
        }
        Ok(IterationOutcome::Finished { record, complete })
    }

    /// Roll back and re-invoke with failure context until resolved or out of retries.
    #[allow(clippy::too_many_arguments)]
    fn rollback_and_retry(
        &self,
        iteration: u32,
        item: &WorkItem,
        agent: &str,
        head_before: &str,
        files: &IterationFiles,
        vars: &PromptVars,
        first: Attempt,
        first_kind: FailureKind,
    ) -> Result<Tally> {
        let rollback = Rollback {
            git: self.git,
            classifier: self.classifier,
            config: &self.config.rollback,
            state: self.state,
        };
        let max = self.config.rollback.max_retries;
        let mut tally = Tally {
            resolved: false,
            kind: first_kind,
            attempt: first,
            rolled_back: false,
            rollback_retries: 0,
        };
        loop {
            let label = format!(
                "buildloop-rollback {} run {} iter {} try {}",
                item.id, self.run_id, iteration, tally.rollback_retries
            );
            let outcome = rollback.maybe_rollback(
                tally.attempt.exit_code,
                &tally.attempt.output,
                head_before,
                item,
                &label,
            )?;
            let RollbackOutcome::RolledBack {
                failure_context, ..
            } = outcome
            else {
                return Ok(tally);
            };
            tally.rolled_back = true;
            if !self.config.rollback.retry {
                return Ok(tally);
            }
            let used = read_retry_count(self.state, &item.id)?;
            if used >= max {
                warn!(
                    story = %item.id,
                    retries = used,
                    "rollback retries exhausted; story needs manual intervention"
                );
                return Ok(tally);
            }
            write_retry_count(self.state, &item.id, used + 1)?;
            tally.rollback_retries += 1;

            let retry_vars = RetryVars {
                failure_context: read_failure_context(&failure_context),
                attempt: used + 1,
                max,
            };
            let prompt = match self.templates.render_retry(vars, &retry_vars) {
                Ok(prompt) => prompt,
                Err(err) => {
                    warn!(err = %err, "retry prompt render failed");
                    append_line(&files.log_path, &format!("[buildloop] {err:#}"))?;
                    return Ok(tally);
                }
            };
            info!(story = %item.id, attempt = used + 1, max, "rollback retry");
            append_line(
                &files.log_path,
                &format!("\n=== ROLLBACK RETRY {}/{} ===", used + 1, max),
            )?;
            let previous_retries = tally.attempt.retry_count;
            let previous_wait = tally.attempt.wait;
            let mut attempt = self.execute(agent, &prompt, files, "RETRY ATTEMPT")?;
            attempt.retry_count += previous_retries;
            attempt.wait += previous_wait;
            tally.kind = self.classifier.classify(attempt.exit_code, &attempt.output);
            tally.attempt = attempt;
            match tally.kind {
                FailureKind::Interrupted => {
                    warn!(story = %item.id, "rollback retry interrupted");
                    return Ok(tally);
                }
                FailureKind::Success => {
                    info!(story = %item.id, "rollback retry resolved the story");
                    tally.resolved = true;
                    return Ok(tally);
                }
                _ => {}
            }
        }
    }

    fn execute(&self, agent: &str, prompt: &str, files: &IterationFiles, label: &str) -> Result<Attempt> {
        write_atomic(&files.prompt_path, prompt)?;
        let request = AgentRequest {
            agent: agent.to_string(),
            workdir: self.workdir.to_path_buf(),
            prompt: prompt.to_string(),
            log_path: files.log_path.clone(),
            prompt_path: files.prompt_path.clone(),
            timeout: self.config.agent_timeout(),
            output_limit_bytes: self.config.agent_output_limit_bytes,
            progress_interval: self.config.progress_interval(),
        };
        let outcome = run_with_retry(
            &self.config.retry_policy(),
            &self.backoff,
            &files.log_path,
            label,
            |_| self.agents.invoke(&request),
        )?;
        Ok(Attempt {
            exit_code: outcome.exit_code,
            retry_count: outcome.retry_count,
            wait: outcome.total_wait,
            output: read_log_from(&files.log_path, outcome.last_attempt_offset),
        })
    }

    fn update_chain(&self, switch: &mut SwitchState, tally: &Tally) -> Option<SwitchRecord> {
        let available = |agent: &str| self.agents.is_available(agent);
        if tally.resolved {
            self.chain.record_success(switch, available);
            return None;
        }
        match self.chain.record_failure(switch, tally.kind, available) {
            SwitchDecision::Switched { from, to, reason } => {
                warn!(from = %from, to = %to, reason = %reason, "switching agent");
                Some(SwitchRecord { from, to, reason })
            }
            SwitchDecision::Exhausted { current } => {
                warn!(agent = %current, "no other agent available, keeping current agent");
                None
            }
            SwitchDecision::Counted { failures, threshold } => {
                info!(failures, threshold, kind = %tally.kind, "counted failure towards agent switch");
                None
            }
            SwitchDecision::NotQualifying => None,
        }
    }

    /// Persist switch state, run record, progress/error lines and the next checkpoint.
    #[allow(clippy::too_many_arguments)]
    fn checkpoint_iteration(
        &self,
        iteration: u32,
        item: &WorkItem,
        agent: &str,
        head_before: &str,
        files: &IterationFiles,
        started_at: chrono::DateTime<Utc>,
        clock: Instant,
        tally: Tally,
        switch_record: Option<SwitchRecord>,
        switch: &SwitchState,
    ) -> Result<IterationRecord> {
        if tally.resolved {
            clear_retry_count(self.state, &item.id)?;
        }
        self.switch_store.save(switch)?;
        let head_after = self
            .git
            .head_sha()
            .map_err(|err| Fault::GitState(format!("cannot read HEAD: {err:#}")))?;
        let activity = self.git_activity(head_before, &head_after);

        let record = IterationRecord {
            run_id: self.run_id.to_string(),
            iteration,
            story_id: item.id.clone(),
            story_title: item.title.clone(),
            started_at,
            ended_at: Utc::now(),
            duration_secs: clock.elapsed().as_secs(),
            status: if tally.resolved {
                IterationStatus::Success
            } else {
                IterationStatus::Error
            },
            exit_code: tally.attempt.exit_code,
            retry_count: tally.attempt.retry_count,
            retry_wait_secs: tally.attempt.wait.as_secs(),
            failure_kind: (!tally.resolved).then_some(tally.kind),
            agent: agent.to_string(),
            head_before: head_before.to_string(),
            head_after: head_after.clone(),
            rolled_back: tally.rolled_back,
            rollback_retries: tally.rollback_retries,
            switch: switch_record,
            log_path: files.log_path.display().to_string(),
        };
        let record_path = self.run_log.write_record(&record, &activity)?;
        self.run_log.append_progress(&record)?;
        if !tally.resolved {
            self.run_log.append_error(&record, &record_path)?;
        }
        self.checkpoints.save(&Checkpoint {
            iteration: iteration + 1,
            story_id: item.id.clone(),
            git_sha: head_after,
            agent: switch.current_agent.clone(),
            created_at: Utc::now(),
        })?;
        info!(
            iteration,
            story = %item.id,
            status = if tally.resolved { "success" } else { "error" },
            duration_secs = record.duration_secs,
            "iteration finished"
        );
        Ok(record)
    }

    /// Commit range, changed files and dirty paths; best effort.
    fn git_activity(&self, head_before: &str, head_after: &str) -> GitActivity {
        let commits = self.git.log_oneline(head_before, head_after).unwrap_or_else(|err| {
            warn!(err = %err, "could not list commits");
            Vec::new()
        });
        let changed_files = self.git.diff_names(head_before, head_after).unwrap_or_default();
        let uncommitted = self
            .git
            .status_porcelain()
            .map(|entries| {
                entries
                    .into_iter()
                    .map(|e| format!("{} {}", e.code.trim(), e.path))
                    .collect()
            })
            .unwrap_or_default();
        GitActivity {
            commits,
            changed_files,
            uncommitted,
        }
    }

    fn ensure_agent_available(&self, switch: &mut SwitchState) -> Result<()> {
        if self.agents.is_available(&switch.current_agent) {
            return Ok(());
        }
        let fallback = self
            .chain
            .initial_state(|agent| self.agents.is_available(agent));
        if !self.agents.is_available(&fallback.current_agent) {
            return Err(Fault::Configuration(format!(
                "no agent of the chain [{}] is available on PATH",
                self.chain.agents().join(", ")
            ))
            .into());
        }
        warn!(
            unavailable = %switch.current_agent,
            using = %fallback.current_agent,
            "active agent is not available"
        );
        switch.current_agent = fallback.current_agent;
        switch.chain_position = fallback.chain_position;
        Ok(())
    }

    fn prompt_vars(&self, iteration: u32, item: &WorkItem, agent: &str) -> PromptVars {
        PromptVars {
            prd_path: self.source.location().display().to_string(),
            progress_path: self.state.progress_path.display().to_string(),
            errors_log_path: self.state.errors_log_path.display().to_string(),
            run_id: self.run_id.to_string(),
            iteration,
            story_id: item.id.clone(),
            story_title: item.title.clone(),
            story_block: item.block.clone(),
            no_commit: self.no_commit,
            agent: agent.to_string(),
            completion_sentinel: self.config.completion_sentinel.clone(),
        }
    }
}

/// Accumulated result of the initial run plus any rollback retries.
struct Tally {
    resolved: bool,
    kind: FailureKind,
    attempt: Attempt,
    rolled_back: bool,
    rollback_retries: u32,
}

impl Tally {
    fn interrupt_code(&self) -> Option<i32> {
        (self.kind == FailureKind::Interrupted).then_some(self.attempt.exit_code)
    }
}
