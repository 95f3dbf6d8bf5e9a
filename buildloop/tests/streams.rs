//! Two workstreams built side by side in their own worktrees, then merged
//! concurrently through the merge lock.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use buildloop::core::types::StreamStatus;
use buildloop::io::config::BuildConfig;
use buildloop::io::confirm::NonInteractive;
use buildloop::io::git::MergeKind;
use buildloop::io::lock::{Acquire, Lock};
use buildloop::io::paths::ProjectPaths;
use buildloop::io::signals::{CancelToken, CancellableSleeper};
use buildloop::looping::BuildOptions;
use buildloop::stream::{BuildDeps, MergeOptions, MergeReport, Streams};
use buildloop::test_support::{
    AgentStep, NoopSleeper, ScriptedAgent, TestRepo, no_jitter, prd_document, run_git,
};

fn config() -> BuildConfig {
    let mut config = BuildConfig::default();
    config.agents.chain = vec!["claude".into()];
    config.merge.wait_timeout_secs = 60;
    config
}

fn seed(repo: &TestRepo, name: &str, id: &str) -> PathBuf {
    let path = repo.root().join("..").join(name);
    fs::write(&path, prd_document(&[(id, "Parallel feature", false)])).expect("write seed");
    path
}

fn build_stream(repo: &TestRepo, config: &BuildConfig, id: u32, item: &str, file: &str) {
    let streams = Streams::new(repo.root(), config);
    let worktree = streams.paths().worktree_dir(id);
    let prd = worktree
        .join(ProjectPaths::stream_state_relative(id))
        .join("prd.md");
    let agent = ScriptedAgent::new(
        &["claude"],
        vec![AgentStep::success("implemented")
            .with_file(file, &format!("{item}\n"))
            .marking_done(&prd, item)
            .with_commit(&format!("{item}: implement"))],
    );
    let cancel = CancelToken::new();
    let deps = BuildDeps {
        agents: &agent,
        sleeper: &NoopSleeper,
        jitter: no_jitter,
        confirm: &NonInteractive,
        cancel: &cancel,
    };
    let options = BuildOptions {
        iterations: 3,
        no_commit: false,
        resume: false,
    };
    let outcome = streams.build(id, &options, false, &deps).expect("stream build");
    assert_eq!(outcome.exit_code(), 0, "stream {id}");
    assert_eq!(agent.calls()[0].workdir, worktree);
}

#[test]
fn parallel_streams_build_and_merge_one_at_a_time() {
    let repo = TestRepo::new().expect("repo");
    let config = config();
    let streams = Streams::new(repo.root(), &config);

    let first = streams
        .create(Some(&seed(&repo, "one.md", "ST1-001")))
        .expect("create first");
    let second = streams
        .create(Some(&seed(&repo, "two.md", "ST2-001")))
        .expect("create second");
    streams.init_worktree(first).expect("init first");
    streams.init_worktree(second).expect("init second");

    thread::scope(|s| {
        s.spawn(|| build_stream(&repo, &config, first, "ST1-001", "one.txt"));
        s.spawn(|| build_stream(&repo, &config, second, "ST2-001", "two.txt"));
    });
    for id in [first, second] {
        assert_eq!(
            streams.status(id).expect("status").status,
            StreamStatus::Completed
        );
    }
    // Trunk is untouched until a merge.
    assert!(!repo.root().join("one.txt").exists());
    assert!(!repo.root().join("two.txt").exists());

    let options = MergeOptions {
        wait: true,
        ..MergeOptions::default()
    };
    let reports: Vec<MergeReport> = thread::scope(|s| {
        let handles: Vec<_> = [first, second]
            .into_iter()
            .map(|id| {
                let (repo, config) = (&repo, &config);
                s.spawn(move || {
                    let streams = Streams::new(repo.root(), config);
                    let sleeper = CancellableSleeper::new(CancelToken::new());
                    streams
                        .merge(id, &options, &sleeper, &NonInteractive)
                        .expect("merge")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("merge thread"))
            .collect()
    });

    let kinds: Vec<MergeKind> = reports
        .iter()
        .map(|r| match r {
            MergeReport::Merged { kind, .. } => *kind,
            other => panic!("unexpected merge report {other:?}"),
        })
        .collect();
    assert!(kinds.contains(&MergeKind::FastForward), "{kinds:?}");
    assert!(kinds.contains(&MergeKind::MergeCommit), "{kinds:?}");

    assert_eq!(repo.read("one.txt").expect("one"), "ST1-001\n");
    assert_eq!(repo.read("two.txt").expect("two"), "ST2-001\n");
    assert!(repo.git().is_clean().expect("clean"));
    let merges = run_git(repo.root(), &["log", "--merges", "--format=%s"]).expect("log");
    assert_eq!(merges.lines().count(), 1, "{merges}");

    let status = streams.merge_status().expect("merge status");
    assert!(status.holder.is_none());
    assert!(status.waiters.is_empty());
    for id in [first, second] {
        let info = streams.status(id).expect("status");
        assert_eq!(info.status, StreamStatus::Merged);
        let canonical = streams.paths().stream_state(id);
        let prd = fs::read_to_string(&canonical.prd_path).expect("canonical prd");
        assert!(prd.contains("[x] ST"), "{prd}");
    }

    streams.cleanup(first, false).expect("cleanup first");
    streams.cleanup(second, false).expect("cleanup second");
    assert!(!streams.paths().worktree_dir(first).exists());
    assert!(!streams.paths().worktree_dir(second).exists());
}

#[test]
fn waiting_merge_is_queued_until_the_lock_is_released() {
    let repo = TestRepo::new().expect("repo");
    let config = config();
    let streams = Streams::new(repo.root(), &config);
    let seed_path = repo.root().join("..").join("queued.md");
    fs::write(&seed_path, prd_document(&[("ST3-001", "Queued feature", true)])).expect("seed");
    let id = streams.create(Some(&seed_path)).expect("create");
    let worktree = streams.init_worktree(id).expect("init");
    fs::write(worktree.join("queued.txt"), "queued\n").expect("write");
    run_git(&worktree, &["add", "-A"]).expect("add");
    run_git(&worktree, &["commit", "-q", "-m", "ST3-001: queued"]).expect("commit");

    let lock = Lock::file(&streams.paths().merge_lock_path);
    let Acquire::Acquired(guard) = lock.acquire("release train").expect("acquire") else {
        panic!("merge lock should be free");
    };

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let streams = Streams::new(repo.root(), &config);
            let sleeper = CancellableSleeper::new(CancelToken::new());
            let options = MergeOptions {
                wait: true,
                ..MergeOptions::default()
            };
            streams.merge(id, &options, &sleeper, &NonInteractive)
        });

        let deadline = Instant::now() + Duration::from_secs(20);
        let status = loop {
            let status = streams.merge_status().expect("merge status");
            if !status.waiters.is_empty() {
                break status;
            }
            assert!(Instant::now() < deadline, "merge never joined the queue");
            thread::sleep(Duration::from_millis(50));
        };
        assert!(status.holder_alive);
        assert_eq!(status.holder.as_ref().map(|h| h.owner.as_str()), Some("release train"));
        assert_eq!(status.waiters.len(), 1);
        let queued = &status.waiters[0];
        assert_eq!(queued.entry.stream_id, id);
        assert_eq!(queued.position, 1);
        assert!(queued.eta > Duration::ZERO, "{queued:?}");
        assert!(!repo.root().join("queued.txt").exists());

        guard.release().expect("release");
        let report = waiter.join().expect("merge thread").expect("merge");
        assert!(matches!(report, MergeReport::Merged { .. }), "{report:?}");
    });

    assert_eq!(repo.read("queued.txt").expect("merged file"), "queued\n");
    let status = streams.merge_status().expect("merge status");
    assert!(status.holder.is_none());
    assert!(status.waiters.is_empty());
}
