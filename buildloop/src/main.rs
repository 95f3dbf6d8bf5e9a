//! Autonomous build loop for coding agents.
//!
//! Drives an agent through `.buildloop/prd.md` one work item per iteration,
//! with retry, rollback, agent fallback and resumable checkpoints. Workstreams
//! run in their own worktrees and merge into trunk one at a time.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use buildloop::core::types::is_interrupt_code;
use buildloop::error::exit_code_for;
use buildloop::exit_codes;
use buildloop::io::agent::CommandAgentRunner;
use buildloop::io::config::{BuildConfig, load_config, write_config};
use buildloop::io::confirm::TerminalConfirm;
use buildloop::io::paths::{ProjectPaths, ensure_state_gitignore};
use buildloop::io::signals::{CancelToken, CancellableSleeper};
use buildloop::logging;
use buildloop::looping::{BuildEnv, BuildOptions, acquire_run_lock, run_build};
use buildloop::plan::{PlanEnv, run_plan};
use buildloop::retry::random_jitter;
use buildloop::stream::{
    BuildDeps, MergeOptions, MergeReport, Streams, render_merge_status, render_stream_info,
    render_stream_list,
};
use clap::{Parser, Subcommand};

const DEFAULT_PRD: &str = "# Requirements\n\n\
Add one heading per work item, for example `### [ ] US-001: Title`,\n\
followed by its acceptance criteria. Or run `buildloop plan`.\n";

#[derive(Parser)]
#[command(
    name = "buildloop",
    version,
    about = "Autonomous build loop for coding agents"
)]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.buildloop/` with a default config and requirements document.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run up to N build iterations against `.buildloop/prd.md`.
    Build {
        #[arg(default_value_t = 10)]
        iterations: u32,
        /// Tell the agent not to commit.
        #[arg(long)]
        no_commit: bool,
        /// Continue from the last checkpoint.
        #[arg(long)]
        resume: bool,
    },
    /// Have the primary agent write or refresh the requirements document.
    Plan {
        /// Document to write (defaults to `.buildloop/prd.md`).
        #[arg(long)]
        prd: Option<PathBuf>,
    },
    /// Parallel workstreams.
    #[command(subcommand)]
    Stream(StreamCommand),
}

#[derive(Subcommand)]
enum StreamCommand {
    /// Create a stream, optionally seeded with a requirements document.
    New {
        #[arg(long)]
        prd: Option<PathBuf>,
    },
    /// List streams with status and progress.
    List,
    /// Show one stream in detail.
    Status { id: u32 },
    /// Create the stream's branch and worktree.
    Init { id: u32 },
    /// Run build iterations for a stream.
    Build {
        id: u32,
        #[arg(default_value_t = 10)]
        iterations: u32,
        #[arg(long)]
        no_commit: bool,
        #[arg(long)]
        resume: bool,
        /// Build in the trunk working copy when the stream has no worktree.
        #[arg(long)]
        allow_trunk: bool,
    },
    /// Merge a completed stream into trunk.
    Merge {
        id: u32,
        /// Rebase the stream onto trunk first.
        #[arg(long)]
        rebase: bool,
        /// Merge even if work items remain.
        #[arg(long)]
        force: bool,
        /// Queue for the merge lock instead of failing when it is held.
        #[arg(long)]
        wait: bool,
        /// Remove a stuck merge lock first.
        #[arg(long)]
        force_unlock: bool,
        /// Do not ask before force-unlocking.
        #[arg(short, long)]
        yes: bool,
    },
    /// Remove the worktree and branch of a merged stream.
    Cleanup {
        id: u32,
        /// Discard an unmerged stream.
        #[arg(long)]
        force: bool,
    },
    /// Show the merge lock holder and the waiting streams.
    MergeStatus,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let paths = ProjectPaths::new(&root);
    match cli.command {
        Command::Init { force } => cmd_init(&paths, force),
        Command::Build {
            iterations,
            no_commit,
            resume,
        } => cmd_build(
            &paths,
            BuildOptions {
                iterations,
                no_commit,
                resume,
            },
        ),
        Command::Plan { prd } => cmd_plan(&paths, prd.as_deref()),
        Command::Stream(cmd) => cmd_stream(&paths, cmd),
    }
}

/// Process-wide collaborators of commands that run agents.
struct Runtime {
    config: BuildConfig,
    cancel: CancelToken,
    agents: CommandAgentRunner,
    sleeper: CancellableSleeper,
}

impl Runtime {
    fn load(paths: &ProjectPaths) -> Result<Self> {
        let config = load_config(&paths.config_path)?;
        let cancel = CancelToken::new();
        cancel.install_signal_handler()?;
        Ok(Self {
            agents: CommandAgentRunner::new(config.agents.commands.clone(), cancel.clone()),
            sleeper: CancellableSleeper::new(cancel.clone()),
            config,
            cancel,
        })
    }
}

fn cmd_init(paths: &ProjectPaths, force: bool) -> Result<i32> {
    ensure_state_gitignore(paths)?;
    if force || !paths.config_path.exists() {
        write_config(&paths.config_path, &BuildConfig::default())?;
        println!("wrote {}", paths.config_path.display());
    }
    let state = paths.default_state();
    if !state.prd_path.exists() {
        std::fs::write(&state.prd_path, DEFAULT_PRD)
            .with_context(|| format!("write {}", state.prd_path.display()))?;
        println!("wrote {}", state.prd_path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_build(paths: &ProjectPaths, options: BuildOptions) -> Result<i32> {
    let rt = Runtime::load(paths)?;
    ensure_state_gitignore(paths)?;
    let state = paths.default_state();
    let _run_lock = acquire_run_lock(&state, "build")?;
    let env = BuildEnv {
        workdir: &paths.root,
        state: &state,
        prompt_dir: &paths.state_root,
        config: &rt.config,
        agents: &rt.agents,
        sleeper: &rt.sleeper,
        jitter: random_jitter,
        confirm: &TerminalConfirm,
        cancel: &rt.cancel,
    };
    let outcome = run_build(&env, &options)?;
    print!("{}", outcome.summary());
    Ok(outcome.exit_code())
}

fn cmd_plan(paths: &ProjectPaths, prd: Option<&Path>) -> Result<i32> {
    let rt = Runtime::load(paths)?;
    ensure_state_gitignore(paths)?;
    let state = paths.default_state();
    let prd_path = prd.map_or_else(|| state.prd_path.clone(), Path::to_path_buf);
    let env = PlanEnv {
        workdir: &paths.root,
        state: &state,
        prompt_dir: &paths.state_root,
        config: &rt.config,
        agents: &rt.agents,
        sleeper: &rt.sleeper,
        jitter: random_jitter,
    };
    let outcome = run_plan(&env, &prd_path)?;
    println!(
        "plan by {}: exit code {}, {} work items in {} (log: {})",
        outcome.agent,
        outcome.exit_code,
        outcome.counts.total,
        prd_path.display(),
        outcome.log_path.display()
    );
    Ok(match outcome.exit_code {
        0 => exit_codes::OK,
        code if is_interrupt_code(code) => code,
        _ => exit_codes::FAILED,
    })
}

fn cmd_stream(paths: &ProjectPaths, cmd: StreamCommand) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let streams = Streams::new(&paths.root, &config);
    match cmd {
        StreamCommand::New { prd } => {
            let id = streams.create(prd.as_deref())?;
            println!(
                "created stream {id} ({})",
                paths.stream_state(id).prd_path.display()
            );
        }
        StreamCommand::List => print!("{}", render_stream_list(&streams.list()?)),
        StreamCommand::Status { id } => print!("{}", render_stream_info(&streams.status(id)?)),
        StreamCommand::Init { id } => {
            let worktree = streams.init_worktree(id)?;
            println!("stream {id} worktree: {}", worktree.display());
        }
        StreamCommand::Build {
            id,
            iterations,
            no_commit,
            resume,
            allow_trunk,
        } => {
            let rt = Runtime::load(paths)?;
            let deps = BuildDeps {
                agents: &rt.agents,
                sleeper: &rt.sleeper,
                jitter: random_jitter,
                confirm: &TerminalConfirm,
                cancel: &rt.cancel,
            };
            let options = BuildOptions {
                iterations,
                no_commit,
                resume,
            };
            let outcome = streams.build(id, &options, allow_trunk, &deps)?;
            print!("{}", outcome.summary());
            return Ok(outcome.exit_code());
        }
        StreamCommand::Merge {
            id,
            rebase,
            force,
            wait,
            force_unlock,
            yes,
        } => {
            let cancel = CancelToken::new();
            cancel.install_signal_handler()?;
            let options = MergeOptions {
                rebase,
                force,
                wait,
                force_unlock,
                yes,
            };
            let sleeper = CancellableSleeper::new(cancel);
            match streams.merge(id, &options, &sleeper, &TerminalConfirm)? {
                MergeReport::AlreadyMerged => println!("stream {id} is already merged"),
                MergeReport::NothingToMerge => {
                    println!("stream {id} has no branch; marked merged")
                }
                MergeReport::Merged { kind, duration } => println!(
                    "merged stream {id} into {} ({kind:?}, {:.1}s)",
                    config.trunk_branch,
                    duration.as_secs_f64()
                ),
            }
        }
        StreamCommand::Cleanup { id, force } => {
            streams.cleanup(id, force)?;
            println!("cleaned up stream {id}");
        }
        StreamCommand::MergeStatus => print!("{}", render_merge_status(&streams.merge_status()?)),
    }
    Ok(exit_codes::OK)
}
