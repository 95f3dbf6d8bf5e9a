//! Autonomous build loop for coding agents.
//!
//! An agent works through a markdown requirements document one work item per
//! iteration. Failures are retried with backoff, classified, rolled back to the
//! pre-item commit and retried with failure context, and may switch to the next
//! agent of a fallback chain. Every iteration leaves a checkpoint so an
//! interrupted run can resume. Workstreams run the same loop in isolated git
//! worktrees and merge into trunk one at a time under a global lock.
//!
//! - **[`core`]**: Pure, deterministic logic (classification, backoff, fallback
//!   chain, rollback policy, work-item parsing, summaries). No I/O.
//! - **[`io`]**: Side-effecting adapters (git, processes, agents, files, locks).
//!
//! Orchestration modules ([`retry`], [`rollback`], [`iteration`], [`looping`],
//! [`stream`], [`plan`]) combine the two to implement the CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod looping;
pub mod plan;
pub mod retry;
pub mod rollback;
pub mod stream;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
