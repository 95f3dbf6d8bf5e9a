//! `buildloop plan`: have the primary agent write the work-item document.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::core::types::ItemCounts;
use crate::error::Fault;
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::config::{BuildConfig, write_atomic};
use crate::io::paths::StatePaths;
use crate::io::prompt::{PromptTemplates, PromptVars};
use crate::io::signals::Sleeper;
use crate::io::work_source::PrdSource;
use crate::looping::new_run_id;
use crate::retry::{Backoff, run_with_retry};

pub struct PlanEnv<'a> {
    pub workdir: &'a Path,
    pub state: &'a StatePaths,
    pub prompt_dir: &'a Path,
    pub config: &'a BuildConfig,
    pub agents: &'a dyn AgentRunner,
    pub sleeper: &'a dyn Sleeper,
    pub jitter: fn() -> Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutcome {
    pub agent: String,
    pub exit_code: i32,
    pub retry_count: u32,
    pub log_path: PathBuf,
    /// Items in the document after the agent ran.
    pub counts: ItemCounts,
}

pub fn run_plan(env: &PlanEnv<'_>, prd_path: &Path) -> Result<PlanOutcome> {
    env.config.validate()?;
    let chain = env.config.fallback_chain()?;
    let agent = chain
        .initial_state(|a| env.agents.is_available(a))
        .current_agent;
    if !env.agents.is_available(&agent) {
        return Err(Fault::Configuration(format!(
            "no agent of the chain [{}] is available on PATH",
            chain.agents().join(", ")
        ))
        .into());
    }

    let run_id = new_run_id();
    let log_path = env.state.runs_dir.join(format!("plan-{run_id}.log"));
    let prompt_path = env.state.runs_dir.join(format!("plan-{run_id}.prompt.md"));
    let vars = PromptVars {
        prd_path: prd_path.display().to_string(),
        progress_path: env.state.progress_path.display().to_string(),
        errors_log_path: env.state.errors_log_path.display().to_string(),
        run_id: run_id.clone(),
        iteration: 0,
        story_id: String::new(),
        story_title: String::new(),
        story_block: String::new(),
        no_commit: true,
        agent: agent.clone(),
        completion_sentinel: env.config.completion_sentinel.clone(),
    };
    let prompt = PromptTemplates::load(env.prompt_dir)?.render_plan(&vars)?;
    write_atomic(&prompt_path, &prompt)?;

    let request = AgentRequest {
        agent: agent.clone(),
        workdir: env.workdir.to_path_buf(),
        prompt,
        log_path: log_path.clone(),
        prompt_path,
        timeout: env.config.agent_timeout(),
        output_limit_bytes: env.config.agent_output_limit_bytes,
        progress_interval: env.config.progress_interval(),
    };
    info!(agent = %agent, prd = %prd_path.display(), "planning");
    let backoff = Backoff {
        sleeper: env.sleeper,
        jitter: env.jitter,
    };
    let outcome = run_with_retry(
        &env.config.retry_policy(),
        &backoff,
        &log_path,
        "RETRY ATTEMPT",
        |_| env.agents.invoke(&request),
    )?;

    let counts = PrdSource::new(prd_path).counts_lenient()?;
    if outcome.exit_code == 0 && counts.total == 0 {
        warn!(prd = %prd_path.display(), "agent finished but the document has no work items");
    }
    Ok(PlanOutcome {
        agent,
        exit_code: outcome.exit_code,
        retry_count: outcome.retry_count,
        log_path,
        counts,
    })
}
