//! Stable exit codes for buildloop CLI commands.

/// Command succeeded (all iterations resolved, merge done, ...).
pub const OK: i32 = 0;
/// An iteration ended unresolved, or a merge wait timed out.
pub const FAILED: i32 = 1;
/// Configuration, git-state or lock fault; nothing was looped.
pub const FATAL: i32 = 2;
/// Interrupted by SIGINT.
pub const INTERRUPTED: i32 = 130;
/// Terminated by SIGTERM.
pub const TERMINATED: i32 = 143;
