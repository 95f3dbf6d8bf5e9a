//! Prompt rendering for agent invocations.
//!
//! Built-in templates can be overridden per project with
//! `.buildloop/PROMPT_<name>.md`. Undefined variables are render errors.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior, context};
use serde::Serialize;
use tracing::debug;

const BUILD_TEMPLATE: &str = include_str!("prompts/build.md");
const RETRY_TEMPLATE: &str = include_str!("prompts/retry.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");

/// Variables shared by every template.
#[derive(Debug, Clone, Serialize)]
pub struct PromptVars {
    pub prd_path: String,
    pub progress_path: String,
    pub errors_log_path: String,
    pub run_id: String,
    pub iteration: u32,
    pub story_id: String,
    pub story_title: String,
    pub story_block: String,
    pub no_commit: bool,
    pub agent: String,
    pub completion_sentinel: String,
}

/// Extra variables of the rollback-retry prompt.
#[derive(Debug, Clone, Serialize)]
pub struct RetryVars {
    pub failure_context: String,
    pub attempt: u32,
    pub max: u32,
}

/// Template sources for one project.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    build: String,
    retry: String,
    plan: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            build: BUILD_TEMPLATE.to_string(),
            retry: RETRY_TEMPLATE.to_string(),
            plan: PLAN_TEMPLATE.to_string(),
        }
    }
}

impl PromptTemplates {
    /// Built-ins, replaced by any `PROMPT_<name>.md` found in `state_root`.
    pub fn load(state_root: &Path) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            build: load_override(state_root, "build")?.unwrap_or(defaults.build),
            retry: load_override(state_root, "retry")?.unwrap_or(defaults.retry),
            plan: load_override(state_root, "plan")?.unwrap_or(defaults.plan),
        })
    }

    pub fn render_build(&self, vars: &PromptVars) -> Result<String> {
        render(&self.build, "build", vars, None)
    }

    pub fn render_retry(&self, vars: &PromptVars, retry: &RetryVars) -> Result<String> {
        render(&self.retry, "retry", vars, Some(retry))
    }

    pub fn render_plan(&self, vars: &PromptVars) -> Result<String> {
        render(&self.plan, "plan", vars, None)
    }
}

fn load_override(state_root: &Path, name: &str) -> Result<Option<String>> {
    let path = state_root.join(format!("PROMPT_{name}.md"));
    match fs::read_to_string(&path) {
        Ok(source) => {
            debug!(template = name, path = %path.display(), "using prompt override");
            Ok(Some(source))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

fn render(source: &str, name: &str, vars: &PromptVars, retry: Option<&RetryVars>) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    let ctx = match retry {
        Some(retry) => context! {
            PRD_PATH => vars.prd_path,
            PROGRESS_PATH => vars.progress_path,
            ERRORS_LOG_PATH => vars.errors_log_path,
            RUN_ID => vars.run_id,
            ITERATION => vars.iteration,
            STORY_ID => vars.story_id,
            STORY_TITLE => vars.story_title,
            STORY_BLOCK => vars.story_block,
            NO_COMMIT => vars.no_commit,
            AGENT => vars.agent,
            COMPLETION_SENTINEL => vars.completion_sentinel,
            FAILURE_CONTEXT => retry.failure_context,
            RETRY_ATTEMPT => retry.attempt,
            RETRY_MAX => retry.max,
        },
        None => context! {
            PRD_PATH => vars.prd_path,
            PROGRESS_PATH => vars.progress_path,
            ERRORS_LOG_PATH => vars.errors_log_path,
            RUN_ID => vars.run_id,
            ITERATION => vars.iteration,
            STORY_ID => vars.story_id,
            STORY_TITLE => vars.story_title,
            STORY_BLOCK => vars.story_block,
            NO_COMMIT => vars.no_commit,
            AGENT => vars.agent,
            COMPLETION_SENTINEL => vars.completion_sentinel,
        },
    };
    env.render_str(source, ctx)
        .with_context(|| format!("render {name} prompt"))
}
