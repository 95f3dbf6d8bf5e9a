//! I/O adapters for buildloop commands.
//!
//! Everything that touches git, the filesystem, child processes or the
//! terminal lives here; orchestration modules combine these with `core`.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod confirm;
pub mod git;
pub mod json_file;
pub mod lock;
pub mod merge_queue;
pub mod paths;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod run_log;
pub mod signals;
pub mod switch_state;
pub mod work_source;
