//! Test fixtures: a throwaway git repository, a scripted agent and fake sleepers.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::io::agent::{AgentRequest, AgentRunner, append_line};
use crate::io::git::Git;
use crate::io::signals::Sleeper;

/// Git repository in a temp dir with one commit on `main`.
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = temp.path().join("repo");
        fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;
        run_git(&root, &["init", "--quiet"])?;
        run_git(&root, &["symbolic-ref", "HEAD", "refs/heads/main"])?;
        run_git(&root, &["config", "user.email", "buildloop@example.com"])?;
        run_git(&root, &["config", "user.name", "buildloop tests"])?;
        run_git(&root, &["config", "commit.gpgsign", "false"])?;
        fs::write(root.join("README.md"), "# fixture\n").context("write README")?;
        run_git(&root, &["add", "-A"])?;
        run_git(&root, &["commit", "--quiet", "-m", "init"])?;
        Ok(Self { _temp: temp, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn git(&self) -> Git {
        Git::new(&self.root)
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        write_file(&self.root.join(rel), contents)
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.root.join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Stage everything and commit; returns the new HEAD.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        let git = self.git();
        git.add_all()?;
        git.commit_staged(message)?;
        git.head_sha()
    }
}

/// Markdown work-item document with one `### [ ] ID: Title` block per entry.
pub fn prd_document(items: &[(&str, &str, bool)]) -> String {
    let mut out = String::from("# Requirements\n\n");
    for (id, title, done) in items {
        let mark = if *done { "x" } else { " " };
        out.push_str(&format!(
            "### [{mark}] {id}: {title}\n- {title} works\n\n"
        ));
    }
    out
}

/// One scripted agent run.
#[derive(Debug, Clone, Default)]
pub struct AgentStep {
    pub exit_code: i32,
    pub log: String,
    /// Files written before exiting, relative to the workdir (or absolute).
    pub files: Vec<(PathBuf, String)>,
    /// `(document, id)` items flipped to done.
    pub done: Vec<(PathBuf, String)>,
    pub commit: Option<String>,
    /// Files written after the commit and left dirty.
    pub uncommitted: Vec<(PathBuf, String)>,
}

impl AgentStep {
    pub fn success(log: &str) -> Self {
        Self {
            exit_code: 0,
            log: log.to_string(),
            ..Self::default()
        }
    }

    pub fn failure(exit_code: i32, log: &str) -> Self {
        Self {
            exit_code,
            log: log.to_string(),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.files.push((path.into(), contents.to_string()));
        self
    }

    pub fn marking_done(mut self, document: &Path, id: &str) -> Self {
        self.done.push((document.to_path_buf(), id.to_string()));
        self
    }

    pub fn with_commit(mut self, message: &str) -> Self {
        self.commit = Some(message.to_string());
        self
    }

    pub fn with_uncommitted(mut self, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.uncommitted.push((path.into(), contents.to_string()));
        self
    }
}

/// What the scripted agent was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCall {
    pub agent: String,
    pub workdir: PathBuf,
    pub prompt: String,
}

/// Agent runner that replays [`AgentStep`]s in order.
pub struct ScriptedAgent {
    available: Vec<String>,
    steps: RefCell<VecDeque<AgentStep>>,
    calls: RefCell<Vec<AgentCall>>,
}

impl ScriptedAgent {
    pub fn new(available: &[&str], steps: Vec<AgentStep>) -> Self {
        Self {
            available: available.iter().map(|s| s.to_string()).collect(),
            steps: RefCell::new(steps.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.borrow().clone()
    }

    pub fn remaining_steps(&self) -> usize {
        self.steps.borrow().len()
    }
}

impl AgentRunner for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<i32> {
        self.calls.borrow_mut().push(AgentCall {
            agent: request.agent.clone(),
            workdir: request.workdir.clone(),
            prompt: request.prompt.clone(),
        });
        let step = self
            .steps
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no step left for {}", request.agent))?;

        for (path, contents) in &step.files {
            write_file(&request.workdir.join(path), contents)?;
        }
        for (document, id) in &step.done {
            mark_done(document, id)?;
        }
        if let Some(message) = &step.commit {
            let git = Git::new(&request.workdir);
            git.add_all()?;
            git.commit_staged(message)?;
        }
        for (path, contents) in &step.uncommitted {
            write_file(&request.workdir.join(path), contents)?;
        }
        for line in step.log.lines() {
            append_line(&request.log_path, line)?;
        }
        Ok(step.exit_code)
    }

    fn is_available(&self, agent: &str) -> bool {
        self.available.iter().any(|a| a == agent)
    }
}

/// Flip `### [ ] <id>:` to `### [x] <id>:` in a work-item document.
pub fn mark_done(document: &Path, id: &str) -> Result<()> {
    let text = fs::read_to_string(document)
        .with_context(|| format!("read {}", document.display()))?;
    let open = format!("### [ ] {id}:");
    if !text.contains(&open) {
        bail!("{id} is not an open item in {}", document.display());
    }
    let updated = text.replacen(&open, &format!("### [x] {id}:"), 1);
    fs::write(document, updated).with_context(|| format!("write {}", document.display()))
}

/// Sleeper that returns immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSleeper;

impl Sleeper for NoopSleeper {
    fn sleep(&self, _duration: Duration) -> bool {
        true
    }
}

/// Sleeper that records requested durations; `allow = false` simulates an interrupt.
#[derive(Debug)]
pub struct RecordingSleeper {
    pub slept: RefCell<Vec<Duration>>,
    pub allow: bool,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self {
            slept: RefCell::new(Vec::new()),
            allow: true,
        }
    }

    pub fn interrupting() -> Self {
        Self {
            allow: false,
            ..Self::new()
        }
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

impl Default for RecordingSleeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> bool {
        self.slept.borrow_mut().push(duration);
        self.allow
    }
}

pub fn no_jitter() -> Duration {
    Duration::ZERO
}

/// Run git in `dir`, failing with its stderr on a non-zero exit.
pub fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !out.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
