//! Build configuration stored under `.buildloop/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::RetryPolicy;
use crate::core::classifier::{
    DEFAULT_LINT_PATTERNS, DEFAULT_TEST_PATTERNS, DEFAULT_TIMEOUT_EXIT_CODES,
    DEFAULT_TYPE_PATTERNS, FailureClassifier,
};
use crate::core::fallback::FallbackChain;
use crate::core::rollback_policy::RollbackTrigger;
use crate::core::types::FailureKind;
use crate::error::Fault;

pub const DEFAULT_COMPLETION_SENTINEL: &str = "<promise>COMPLETE</promise>";

/// Build configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values that work with the stock agent CLIs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildConfig {
    /// Branch that streams merge into and trunk builds refuse to run on.
    pub trunk_branch: String,

    /// Wall-clock budget for one agent invocation.
    pub agent_timeout_secs: u64,

    /// Stop appending agent output to the iteration log past this many bytes.
    pub agent_output_limit_bytes: usize,

    /// Interval of the "agent still running" heartbeat.
    pub progress_interval_secs: u64,

    /// Literal the agent prints when every work item is done.
    pub completion_sentinel: String,

    pub agents: AgentsConfig,
    pub retry: RetryConfig,
    pub switch: SwitchConfig,
    pub rollback: RollbackConfig,
    pub classifier: ClassifierConfig,
    pub merge: MergeConfig,
}

/// How the rendered prompt reaches the agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromptInput {
    #[default]
    Stdin,
    /// Prompt written to a file; `{prompt_file}` in the argv is replaced by its path.
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentCommand {
    pub command: Vec<String>,
    #[serde(default)]
    pub input: PromptInput,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentsConfig {
    /// Ordered fallback chain; the first entry is the primary agent.
    pub chain: Vec<String>,
    pub commands: BTreeMap<String, AgentCommand>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        let mut commands = BTreeMap::new();
        commands.insert(
            "claude".to_string(),
            AgentCommand {
                command: argv(&["claude", "-p", "--dangerously-skip-permissions"]),
                input: PromptInput::Stdin,
            },
        );
        commands.insert(
            "codex".to_string(),
            AgentCommand {
                command: argv(&["codex", "exec", "--yolo", "-"]),
                input: PromptInput::Stdin,
            },
        );
        commands.insert(
            "droid".to_string(),
            AgentCommand {
                command: argv(&["droid", "exec", "--skip-permissions-unsafe", "-f", "{prompt_file}"]),
                input: PromptInput::File,
            },
        );
        Self {
            chain: argv(&["claude", "codex", "droid"]),
            commands,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per invocation, first one included.
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 2,
            max_delay_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SwitchConfig {
    /// Consecutive qualifying failures before switching agents.
    pub threshold: u32,
    /// Failure kinds that count towards the threshold.
    pub on: Vec<FailureKind>,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            threshold: 2,
            on: vec![FailureKind::Timeout, FailureKind::Error, FailureKind::Quality],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RollbackConfig {
    pub enabled: bool,
    pub trigger: RollbackTrigger,
    /// Re-run the agent with failure context after a rollback.
    pub retry: bool,
    /// Rollback retries per work item, counted across runs.
    pub max_retries: u32,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger: RollbackTrigger::TestFail,
            retry: true,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierConfig {
    pub test_patterns: Vec<String>,
    pub type_patterns: Vec<String>,
    pub lint_patterns: Vec<String>,
    pub timeout_exit_codes: Vec<i32>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            test_patterns: argv(&DEFAULT_TEST_PATTERNS),
            type_patterns: argv(&DEFAULT_TYPE_PATTERNS),
            lint_patterns: argv(&DEFAULT_LINT_PATTERNS),
            timeout_exit_codes: DEFAULT_TIMEOUT_EXIT_CODES.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MergeConfig {
    /// Give up waiting for the merge lock after this long.
    pub wait_timeout_secs: u64,
    /// ETA fallback when no merge durations have been recorded yet.
    pub estimated_merge_secs: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 30 * 60,
            estimated_merge_secs: 60,
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            trunk_branch: "main".to_string(),
            agent_timeout_secs: 60 * 60,
            agent_output_limit_bytes: 5_000_000,
            progress_interval_secs: 30,
            completion_sentinel: DEFAULT_COMPLETION_SENTINEL.to_string(),
            agents: AgentsConfig::default(),
            retry: RetryConfig::default(),
            switch: SwitchConfig::default(),
            rollback: RollbackConfig::default(),
            classifier: ClassifierConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

impl BuildConfig {
    /// Check the config; problems surface as a configuration fault.
    pub fn validate(&self) -> Result<()> {
        self.check()
            .map_err(|err| Fault::Configuration(format!("{err:#}")).into())
    }

    fn check(&self) -> Result<()> {
        if self.trunk_branch.trim().is_empty() {
            return Err(anyhow!("trunk_branch must not be empty"));
        }
        if self.agent_timeout_secs == 0 {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.agent_output_limit_bytes == 0 {
            return Err(anyhow!("agent_output_limit_bytes must be > 0"));
        }
        if self.progress_interval_secs == 0 {
            return Err(anyhow!("progress_interval_secs must be > 0"));
        }
        if self.agents.chain.is_empty() {
            return Err(anyhow!("agents.chain must name at least one agent"));
        }
        for name in &self.agents.chain {
            let Some(cmd) = self.agents.commands.get(name) else {
                return Err(anyhow!("agents.commands.{name} is missing"));
            };
            if cmd.command.is_empty() || cmd.command[0].trim().is_empty() {
                return Err(anyhow!("agents.commands.{name}.command must be a non-empty array"));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            return Err(anyhow!("retry.max_delay_secs must be >= retry.base_delay_secs"));
        }
        if self.switch.threshold == 0 {
            return Err(anyhow!("switch.threshold must be > 0"));
        }
        if self.merge.wait_timeout_secs == 0 {
            return Err(anyhow!("merge.wait_timeout_secs must be > 0"));
        }
        self.classifier()?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_secs(self.retry.base_delay_secs),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
        }
    }

    pub fn classifier(&self) -> Result<FailureClassifier> {
        let c = &self.classifier;
        FailureClassifier::from_patterns(
            &c.timeout_exit_codes,
            &c.test_patterns,
            &c.type_patterns,
            &c.lint_patterns,
        )
        .context("compile classifier patterns")
    }

    pub fn fallback_chain(&self) -> Result<FallbackChain> {
        FallbackChain::new(
            self.agents.chain.clone(),
            self.switch.threshold,
            self.switch.on.clone(),
        )
        .ok_or_else(|| anyhow!("agents.chain must name at least one agent"))
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `BuildConfig::default()`.
pub fn load_config(path: &Path) -> Result<BuildConfig> {
    if !path.exists() {
        let cfg = BuildConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: BuildConfig = toml::from_str(&contents).map_err(|err| {
        Fault::Configuration(format!("cannot parse {}: {err}", path.display()))
    })?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &BuildConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` to `path` through a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
