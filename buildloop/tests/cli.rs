//! CLI tests: spawn the binary and check exit codes and output.

use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use buildloop::exit_codes;
use buildloop::io::config::{AgentCommand, BuildConfig, PromptInput, write_config};
use buildloop::io::paths::{ProjectPaths, ensure_state_gitignore};
use buildloop::test_support::{TestRepo, prd_document};

fn buildloop(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_buildloop"))
        .current_dir(dir)
        .args(args)
        .env("RUST_LOG", "buildloop=warn")
        .output()
        .expect("spawn buildloop")
}

/// Repo with `.buildloop/` set up, one agent `sh -c <script>` and one open item.
fn project_with_agent(script: &str) -> TestRepo {
    let repo = TestRepo::new().expect("repo");
    let paths = ProjectPaths::new(repo.root());
    ensure_state_gitignore(&paths).expect("gitignore");
    let mut config = BuildConfig::default();
    config.agents.chain = vec!["shell".into()];
    config.agents.commands.insert(
        "shell".into(),
        AgentCommand {
            command: vec!["sh".into(), "-c".into(), script.into()],
            input: PromptInput::Stdin,
        },
    );
    config.retry.max_attempts = 1;
    write_config(&paths.config_path, &config).expect("write config");
    fs::write(
        paths.default_state().prd_path,
        prd_document(&[("US-001", "Say hello", false)]),
    )
    .expect("write prd");
    repo
}

#[test]
fn build_outside_git_repo_is_fatal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = buildloop(temp.path(), &["build", "1"]);
    assert_eq!(out.status.code(), Some(exit_codes::FATAL));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("git"), "{stderr}");
}

#[test]
fn init_scaffolds_state_dir() {
    let repo = TestRepo::new().expect("repo");
    let out = buildloop(repo.root(), &["init"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let paths = ProjectPaths::new(repo.root());
    assert!(paths.config_path.exists());
    assert!(paths.default_state().prd_path.exists());
    assert!(repo.git().is_clean().expect("status"));
}

#[test]
fn stream_list_without_streams() {
    let repo = TestRepo::new().expect("repo");
    let out = buildloop(repo.root(), &["stream", "list"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&out.stdout).contains("No streams"));
}

#[test]
fn merging_unknown_stream_is_fatal() {
    let repo = TestRepo::new().expect("repo");
    let out = buildloop(repo.root(), &["stream", "merge", "7"]);
    assert_eq!(out.status.code(), Some(exit_codes::FATAL));
    assert!(String::from_utf8_lossy(&out.stderr).contains("stream 7 does not exist"));
}

#[test]
fn unavailable_agent_is_fatal() {
    let repo = TestRepo::new().expect("repo");
    let paths = ProjectPaths::new(repo.root());
    ensure_state_gitignore(&paths).expect("gitignore");
    let mut config = BuildConfig::default();
    config.agents.chain = vec!["ghost".into()];
    config.agents.commands.insert(
        "ghost".into(),
        AgentCommand {
            command: vec!["buildloop-no-such-agent-binary".into()],
            input: PromptInput::Stdin,
        },
    );
    write_config(&paths.config_path, &config).expect("write config");
    fs::write(
        paths.default_state().prd_path,
        prd_document(&[("US-001", "Say hello", false)]),
    )
    .expect("write prd");

    let out = buildloop(repo.root(), &["build", "1"]);
    assert_eq!(out.status.code(), Some(exit_codes::FATAL));
    assert!(String::from_utf8_lossy(&out.stderr).contains("available"));
}

#[test]
fn successful_build_exits_ok() {
    let repo = project_with_agent(
        "cat >/dev/null; \
         sed 's/### \\[ \\] US-001/### [x] US-001/' .buildloop/prd.md > .buildloop/prd.tmp && \
         mv .buildloop/prd.tmp .buildloop/prd.md && \
         echo hello > hello.txt && git add hello.txt && git commit -q -m 'US-001: hello' && \
         echo '<promise>COMPLETE</promise>'",
    );
    let out = buildloop(repo.root(), &["build", "3"]);
    assert_eq!(
        out.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert_eq!(repo.read("hello.txt").expect("hello"), "hello\n");
    let prd = fs::read_to_string(ProjectPaths::new(repo.root()).default_state().prd_path)
        .expect("prd");
    assert!(prd.contains("### [x] US-001"));
    let checkpoint = ProjectPaths::new(repo.root()).default_state().checkpoint_path;
    assert!(!checkpoint.exists());
}

#[test]
fn failing_agent_exits_failed() {
    let repo = project_with_agent("cat >/dev/null; echo 'boom'; exit 3");
    let out = buildloop(repo.root(), &["build", "1"]);
    assert_eq!(out.status.code(), Some(exit_codes::FAILED));
}

#[cfg(unix)]
#[test]
fn sigterm_stops_a_running_agent_with_143() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let repo = project_with_agent("cat >/dev/null; sleep 30 & sleep 30");
    let mut child = Command::new(env!("CARGO_BIN_EXE_buildloop"))
        .current_dir(repo.root())
        .args(["build", "1"])
        .env("RUST_LOG", "buildloop=warn")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn buildloop");
    thread::sleep(Duration::from_millis(1500));
    let pid = i32::try_from(child.id()).expect("pid");
    kill(Pid::from_raw(pid), Signal::SIGTERM).expect("send SIGTERM");

    let started = Instant::now();
    let out = child.wait_with_output().expect("wait buildloop");
    assert_eq!(
        out.status.code(),
        Some(exit_codes::TERMINATED),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(started.elapsed() < Duration::from_secs(10));
}
