//! Shared deterministic types for the build loop core.
//!
//! These types define stable contracts between core components and the
//! persisted records. Serialized names are part of the on-disk format.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Exit code reported when the process was interrupted with SIGINT.
pub const EXIT_SIGINT: i32 = 130;
/// Exit code reported when the process was terminated with SIGTERM.
pub const EXIT_SIGTERM: i32 = 143;

/// Returns true if `code` is one of the interrupted exit codes.
pub fn is_interrupt_code(code: i32) -> bool {
    code == EXIT_SIGINT || code == EXIT_SIGTERM
}

/// Classification of a finished agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Success,
    Timeout,
    Interrupted,
    /// Tests, type-check or lint failed.
    Quality,
    Error,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Success => "success",
            FailureKind::Timeout => "timeout",
            FailureKind::Interrupted => "interrupted",
            FailureKind::Quality => "quality",
            FailureKind::Error => "error",
        }
    }

    pub fn is_failure(self) -> bool {
        !matches!(self, FailureKind::Success)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(FailureKind::Success),
            "timeout" => Ok(FailureKind::Timeout),
            "interrupted" => Ok(FailureKind::Interrupted),
            "quality" => Ok(FailureKind::Quality),
            "error" => Ok(FailureKind::Error),
            other => Err(format!("unknown failure kind '{other}'")),
        }
    }
}

/// Terminal status of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationStatus {
    Success,
    Error,
}

/// Lifecycle status of a workstream.
///
/// `Running` is derived from lock liveness and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    NotFound,
    Ready,
    InProgress,
    Running,
    Completed,
    Merged,
}

impl StreamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamStatus::NotFound => "not_found",
            StreamStatus::Ready => "ready",
            StreamStatus::InProgress => "in_progress",
            StreamStatus::Running => "running",
            StreamStatus::Completed => "completed",
            StreamStatus::Merged => "merged",
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of requested change from the work-item document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    /// Raw markdown block, heading line included.
    pub block: String,
    pub done: bool,
}

/// Done/remaining totals for a work-item document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItemCounts {
    pub total: usize,
    pub remaining: usize,
}

impl ItemCounts {
    pub fn done(&self) -> usize {
        self.total - self.remaining
    }
}
