//! End-to-end build loop scenarios against a real git repository.
//!
//! Agents are scripted; git, the state files and the loop itself are real.

use std::fs;

use buildloop::core::fallback::SwitchState;
use buildloop::core::types::{FailureKind, IterationStatus};
use buildloop::error::exit_code_for;
use buildloop::exit_codes;
use buildloop::io::checkpoint::CheckpointStore;
use buildloop::io::config::BuildConfig;
use buildloop::io::confirm::{Confirm, FixedAnswer, NonInteractive};
use buildloop::io::json_file::read_json;
use buildloop::io::paths::{ProjectPaths, StatePaths, ensure_state_gitignore};
use buildloop::io::signals::CancelToken;
use buildloop::looping::{BuildEnv, BuildOptions, BuildOutcome, LoopStop, run_build};
use buildloop::rollback::read_retry_count;
use buildloop::test_support::{
    AgentStep, NoopSleeper, ScriptedAgent, TestRepo, no_jitter, prd_document, run_git,
};

struct Project {
    repo: TestRepo,
    paths: ProjectPaths,
    state: StatePaths,
}

fn project(items: &[(&str, &str, bool)]) -> Project {
    let repo = TestRepo::new().expect("repo");
    let paths = ProjectPaths::new(repo.root());
    ensure_state_gitignore(&paths).expect("gitignore");
    let state = paths.default_state();
    fs::write(&state.prd_path, prd_document(items)).expect("write prd");
    Project { repo, paths, state }
}

fn config(chain: &[&str]) -> BuildConfig {
    let mut config = BuildConfig::default();
    config.agents.chain = chain.iter().map(|s| s.to_string()).collect();
    config.retry.max_attempts = 1;
    config
}

fn build(
    p: &Project,
    config: &BuildConfig,
    agent: &ScriptedAgent,
    confirm: &dyn Confirm,
    iterations: u32,
    resume: bool,
) -> anyhow::Result<BuildOutcome> {
    let cancel = CancelToken::new();
    let env = BuildEnv {
        workdir: p.repo.root(),
        state: &p.state,
        prompt_dir: &p.paths.state_root,
        config,
        agents: agent,
        sleeper: &NoopSleeper,
        jitter: no_jitter,
        confirm,
        cancel: &cancel,
    };
    run_build(
        &env,
        &BuildOptions {
            iterations,
            no_commit: false,
            resume,
        },
    )
}

/// A test failure under the `test-fail` trigger rolls the tree back to the
/// pre-story commit, stashing uncommitted work and leaving a failure context.
#[test]
fn clean_rollback_restores_pre_story_commit() {
    let p = project(&[("US-001", "Add parser", false)]);
    let mut cfg = config(&["claude"]);
    cfg.rollback.retry = false;
    let pre_story = p.repo.git().head_sha().expect("head");

    let agent = ScriptedAgent::new(
        &["claude"],
        vec![
            AgentStep::failure(1, "running tests\n3 failed, 10 passed")
                .with_file("parser.rs", "fn parse() {}\n")
                .with_commit("US-001: parser")
                .with_uncommitted("scratch.txt", "notes\n"),
        ],
    );
    let outcome = build(&p, &cfg, &agent, &NonInteractive, 1, false).expect("build");

    let record = &outcome.records[0];
    assert_eq!(record.status, IterationStatus::Error);
    assert_eq!(record.failure_kind, Some(FailureKind::Quality));
    assert!(record.rolled_back);
    assert_eq!(record.head_before, pre_story);
    assert_eq!(record.head_after, pre_story);

    let git = p.repo.git();
    assert_eq!(git.head_sha().expect("head"), pre_story);
    assert!(git.is_clean().expect("status"));
    assert!(!p.repo.root().join("parser.rs").exists());
    assert!(!p.repo.root().join("scratch.txt").exists());

    let stashes = run_git(p.repo.root(), &["stash", "list"]).expect("stash list");
    assert!(stashes.contains("buildloop-rollback US-001"), "{stashes}");
    let context = fs::read_to_string(p.state.failure_context_dir.join("US-001.txt"))
        .expect("failure context");
    assert!(context.contains("3 failed, 10 passed"));
    assert_eq!(outcome.exit_code(), exit_codes::FAILED);
}

#[test]
fn rollback_retry_with_failure_context_resolves_item() {
    let p = project(&[("US-001", "Add parser", false)]);
    let mut cfg = config(&["claude", "codex"]);
    cfg.rollback.max_retries = 2;

    let agent = ScriptedAgent::new(
        &["claude", "codex"],
        vec![
            AgentStep::failure(1, "test result: FAILED. 3 failed; 7 passed")
                .with_file("parser.rs", "broken\n")
                .with_commit("US-001: first try"),
            AgentStep::success("all green")
                .with_file("parser.rs", "fn parse() {}\n")
                .marking_done(&p.state.prd_path, "US-001")
                .with_commit("US-001: parser"),
        ],
    );
    let outcome = build(&p, &cfg, &agent, &NonInteractive, 3, false).expect("build");

    assert_eq!(outcome.stop, LoopStop::AllDone);
    assert_eq!(outcome.records.len(), 1);
    let record = &outcome.records[0];
    assert_eq!(record.status, IterationStatus::Success);
    assert!(record.rolled_back);
    assert_eq!(record.rollback_retries, 1);
    assert_eq!(record.agent, "claude");

    let calls = agent.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].agent, "claude");
    assert!(calls[1].prompt.contains("Retry 1/2"));
    assert!(calls[1].prompt.contains("3 failed; 7 passed"));
    assert_eq!(read_retry_count(&p.state, "US-001").expect("count"), 0);
    assert_eq!(p.repo.read("parser.rs").expect("parser"), "fn parse() {}\n");

    let log = fs::read_to_string(&record.log_path).expect("log");
    assert!(log.contains("=== ROLLBACK RETRY 1/2 ==="));
}

#[test]
fn exhausted_rollback_retries_leave_item_for_manual_work() {
    let p = project(&[("US-001", "Add parser", false)]);
    let mut cfg = config(&["claude"]);
    cfg.rollback.max_retries = 1;
    let pre_story = p.repo.git().head_sha().expect("head");

    let agent = ScriptedAgent::new(
        &["claude"],
        vec![
            AgentStep::failure(1, "2 failed").with_file("a.txt", "a\n").with_commit("wip a"),
            AgentStep::failure(1, "1 failed").with_file("b.txt", "b\n").with_commit("wip b"),
        ],
    );
    let outcome = build(&p, &cfg, &agent, &NonInteractive, 1, false).expect("build");

    let record = &outcome.records[0];
    assert_eq!(record.status, IterationStatus::Error);
    assert_eq!(record.rollback_retries, 1);
    assert_eq!(agent.calls().len(), 2);
    assert_eq!(p.repo.git().head_sha().expect("head"), pre_story);
    assert_eq!(read_retry_count(&p.state, "US-001").expect("count"), 1);
    let errors = fs::read_to_string(&p.state.errors_log_path).expect("errors");
    assert!(errors.contains("US-001"));
}

#[test]
fn no_rollback_directive_keeps_commits() {
    let p = project(&[]);
    fs::write(
        &p.state.prd_path,
        "### [ ] US-001: Migrate data\n<!-- no-rollback -->\n- keep partial work\n",
    )
    .expect("write prd");
    let cfg = config(&["claude"]);
    let agent = ScriptedAgent::new(
        &["claude"],
        vec![AgentStep::failure(1, "4 failed").with_file("m.sql", "x\n").with_commit("wip")],
    );
    let outcome = build(&p, &cfg, &agent, &NonInteractive, 1, false).expect("build");
    assert!(!outcome.records[0].rolled_back);
    assert!(p.repo.root().join("m.sql").exists());
}

/// After `threshold` qualifying failures the next agent takes over; a success
/// resets the chain to its primary.
#[test]
fn fallback_chain_switches_then_resets() {
    let p = project(&[("US-001", "Add parser", false)]);
    let mut cfg = config(&["claude", "codex", "droid"]);
    cfg.rollback.enabled = false;

    let agent = ScriptedAgent::new(
        &["claude", "codex", "droid"],
        vec![
            AgentStep::failure(1, "api error"),
            AgentStep::failure(1, "api error"),
            AgentStep::success("done").marking_done(&p.state.prd_path, "US-001"),
        ],
    );
    let outcome = build(&p, &cfg, &agent, &NonInteractive, 5, false).expect("build");

    let agents: Vec<String> = agent.calls().into_iter().map(|c| c.agent).collect();
    assert_eq!(agents, vec!["claude", "claude", "codex"]);
    assert_eq!(outcome.records.len(), 3);
    assert_eq!(outcome.records[0].switch, None);
    let switch = outcome.records[1].switch.as_ref().expect("switch recorded");
    assert_eq!(
        (switch.from.as_str(), switch.to.as_str(), switch.reason),
        ("claude", "codex", FailureKind::Error)
    );
    assert_eq!(outcome.records[2].status, IterationStatus::Success);

    let state: SwitchState = read_json(&p.state.switch_state_path)
        .expect("read")
        .expect("switch state");
    assert_eq!(state.current_agent, "claude");
    assert_eq!(state.consecutive_failures, 0);
}

#[test]
fn resume_continues_from_checkpoint_iteration() {
    let p = project(&[("US-001", "Add parser", false)]);
    let mut cfg = config(&["claude"]);
    cfg.rollback.enabled = false;

    let first = ScriptedAgent::new(&["claude"], vec![AgentStep::failure(1, "api error")]);
    let outcome = build(&p, &cfg, &first, &NonInteractive, 1, false).expect("first run");
    assert_eq!(outcome.stop, LoopStop::IterationLimit);
    let checkpoint = CheckpointStore::new(&p.state.checkpoint_path)
        .load()
        .expect("load")
        .expect("checkpoint");
    assert_eq!(checkpoint.iteration, 2);

    let second = ScriptedAgent::new(
        &["claude"],
        vec![AgentStep::success("done").marking_done(&p.state.prd_path, "US-001")],
    );
    let outcome = build(&p, &cfg, &second, &NonInteractive, 3, true).expect("resume");
    assert_eq!(outcome.started_at_iter, 2);
    assert_eq!(outcome.records[0].iteration, 2);
    assert_eq!(outcome.stop, LoopStop::AllDone);
    assert!(CheckpointStore::new(&p.state.checkpoint_path)
        .load()
        .expect("load")
        .is_none());
}

#[test]
fn resume_on_diverged_head_needs_confirmation() {
    let p = project(&[("US-001", "Add parser", false)]);
    let cfg = config(&["claude"]);

    let interrupted = ScriptedAgent::new(&["claude"], vec![AgentStep::failure(130, "^C")]);
    let outcome = build(&p, &cfg, &interrupted, &NonInteractive, 1, false).expect("run");
    assert_eq!(outcome.exit_code(), exit_codes::INTERRUPTED);

    p.repo.write("hotfix.txt", "manual\n").expect("write");
    p.repo.commit_all("manual hotfix").expect("commit");

    let idle = ScriptedAgent::new(&["claude"], Vec::new());
    let err = build(&p, &cfg, &idle, &NonInteractive, 1, true).expect_err("mismatch");
    assert_eq!(exit_code_for(&err), exit_codes::FATAL);
    assert!(format!("{err:#}").contains("HEAD"));
    let err = build(&p, &cfg, &idle, &FixedAnswer(false), 1, true).expect_err("declined");
    assert_eq!(exit_code_for(&err), exit_codes::FATAL);
    assert!(idle.calls().is_empty());

    let agent = ScriptedAgent::new(
        &["claude"],
        vec![AgentStep::success("done").marking_done(&p.state.prd_path, "US-001")],
    );
    let outcome = build(&p, &cfg, &agent, &FixedAnswer(true), 1, true).expect("confirmed");
    assert_eq!(outcome.records[0].status, IterationStatus::Success);
}

#[test]
fn run_records_are_written_per_iteration() {
    let p = project(&[("US-001", "Add parser", false)]);
    let cfg = config(&["claude"]);
    let agent = ScriptedAgent::new(
        &["claude"],
        vec![AgentStep::success("done")
            .with_file("parser.rs", "fn parse() {}\n")
            .marking_done(&p.state.prd_path, "US-001")
            .with_commit("US-001: parser")],
    );
    let outcome = build(&p, &cfg, &agent, &NonInteractive, 1, false).expect("build");
    let run_id = &outcome.run_id;

    let json = p.state.runs_dir.join(format!("{run_id}-iter-1.json"));
    let value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&json).expect("record")).expect("json");
    assert_eq!(value["status"], "success");
    assert_eq!(value["story_id"], "US-001");
    assert_eq!(value["failure_kind"], serde_json::Value::Null);

    let summary = fs::read_to_string(p.state.runs_dir.join(format!("{run_id}-iter-1.md")))
        .expect("summary");
    assert!(summary.contains("US-001: parser"));
    assert!(summary.contains("parser.rs"));
    let prompt = fs::read_to_string(p.state.runs_dir.join(format!("{run_id}-iter-1.prompt.md")))
        .expect("prompt");
    assert!(prompt.contains("### [ ] US-001: Add parser"));
}
