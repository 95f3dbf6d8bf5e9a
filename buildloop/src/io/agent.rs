//! Agent invocation.
//!
//! The [`AgentRunner`] trait decouples the build loop from the actual agent
//! CLIs. Tests use scripted runners that write predetermined logs and exit
//! codes without spawning processes.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::config::{AgentCommand, PromptInput};
use crate::io::process::run_logged;
use crate::io::progress::Heartbeat;
use crate::io::signals::CancelToken;

/// Exit code used when the agent executable could not be started.
pub const EXIT_NOT_FOUND: i32 = 127;

const PROMPT_FILE_PLACEHOLDER: &str = "{prompt_file}";

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub agent: String,
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    pub prompt: String,
    /// Output of every attempt is appended here.
    pub log_path: PathBuf,
    /// Where the prompt is written for file-input agents.
    pub prompt_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub progress_interval: Duration,
}

/// Abstraction over agent backends.
pub trait AgentRunner {
    /// Run the agent once and return its exit code.
    ///
    /// Errors are reserved for local failures (log not writable, ...); a
    /// failing agent is reported through its exit code.
    fn invoke(&self, request: &AgentRequest) -> Result<i32>;

    /// True if `agent` can be started on this host.
    fn is_available(&self, agent: &str) -> bool;
}

/// Runner that spawns the configured agent CLIs.
pub struct CommandAgentRunner {
    commands: BTreeMap<String, AgentCommand>,
    cancel: CancelToken,
}

impl CommandAgentRunner {
    pub fn new(commands: BTreeMap<String, AgentCommand>, cancel: CancelToken) -> Self {
        Self { commands, cancel }
    }

    fn command_for(&self, agent: &str) -> Result<&AgentCommand> {
        self.commands
            .get(agent)
            .ok_or_else(|| anyhow!("no command configured for agent '{agent}'"))
    }
}

impl AgentRunner for CommandAgentRunner {
    #[instrument(skip_all, fields(agent = %request.agent, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &AgentRequest) -> Result<i32> {
        let spec = self.command_for(&request.agent)?;
        let (argv, stdin) = match spec.input {
            PromptInput::Stdin => (spec.command.clone(), Some(request.prompt.as_bytes())),
            PromptInput::File => {
                write_prompt_file(&request.prompt_path, &request.prompt)?;
                (
                    substitute_prompt_file(&spec.command, &request.prompt_path),
                    None,
                )
            }
        };
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty command for agent '{}'", request.agent))?;

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);

        info!(workdir = %request.workdir.display(), "starting agent");
        let _heartbeat = Heartbeat::start(request.agent.clone(), request.progress_interval);
        match run_logged(
            cmd,
            stdin,
            request.timeout,
            request.output_limit_bytes,
            &request.log_path,
            &self.cancel,
        ) {
            Ok(outcome) => {
                if outcome.timed_out {
                    warn!("agent timed out");
                }
                Ok(outcome.exit_code)
            }
            Err(err) if is_spawn_failure(&err) => {
                warn!(err = %err, "agent could not be started");
                append_line(
                    &request.log_path,
                    &format!("[buildloop] failed to start {program}: {err:#}"),
                )?;
                Ok(EXIT_NOT_FOUND)
            }
            Err(err) => Err(err).context("run agent"),
        }
    }

    fn is_available(&self, agent: &str) -> bool {
        self.commands
            .get(agent)
            .and_then(|spec| spec.command.first())
            .is_some_and(|program| can_resolve_command(program))
    }
}

/// Append a single line to a log file.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("append to {}", path.display()))
}

fn write_prompt_file(path: &Path, prompt: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create prompt dir {}", parent.display()))?;
    }
    fs::write(path, prompt).with_context(|| format!("write prompt {}", path.display()))
}

/// Replace the `{prompt_file}` argument, or append the path if no argument names it.
fn substitute_prompt_file(command: &[String], prompt_path: &Path) -> Vec<String> {
    let path = prompt_path.to_string_lossy().to_string();
    if command.iter().any(|arg| arg.contains(PROMPT_FILE_PLACEHOLDER)) {
        return command
            .iter()
            .map(|arg| arg.replace(PROMPT_FILE_PLACEHOLDER, &path))
            .collect();
    }
    let mut argv = command.to_vec();
    argv.push(path);
    argv
}

fn is_spawn_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| {
                matches!(
                    io.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                )
            })
    }) && err.to_string().contains("spawn")
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && (m.permissions().mode() & 0o111 != 0))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// True if `cmd` is an executable path or resolves to one on `PATH`.
pub fn can_resolve_command(cmd: &str) -> bool {
    let trimmed = cmd.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.contains('/') || trimmed.contains(std::path::MAIN_SEPARATOR) {
        return is_executable(Path::new(trimmed));
    }
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .any(|dir| is_executable(&dir.join(trimmed)))
}
