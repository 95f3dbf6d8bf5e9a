//! Per-iteration run records and the human-readable logs next to them.
//!
//! Each iteration leaves `runs/<run-id>-iter-<n>.{log,json,md}`. Failed
//! iterations are also listed in `errors.log`, and every iteration adds a line
//! to the `## Run Summary` section of `progress.md`.

use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::summary::SummaryRow;
use crate::core::types::{FailureKind, IterationStatus};
use crate::io::agent::append_line;
use crate::io::json_file::write_json;
use crate::io::paths::StatePaths;

const RUN_SUMMARY_HEADING: &str = "## Run Summary";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub from: String,
    pub to: String,
    pub reason: FailureKind,
}

/// Immutable record of one iteration (`runs/<run-id>-iter-<n>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub run_id: String,
    pub iteration: u32,
    pub story_id: String,
    pub story_title: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub status: IterationStatus,
    pub exit_code: i32,
    pub retry_count: u32,
    pub retry_wait_secs: u64,
    pub failure_kind: Option<FailureKind>,
    pub agent: String,
    pub head_before: String,
    pub head_after: String,
    pub rolled_back: bool,
    pub rollback_retries: u32,
    pub switch: Option<SwitchRecord>,
    pub log_path: String,
}

impl IterationRecord {
    pub fn summary_row(&self) -> SummaryRow {
        SummaryRow {
            iteration: self.iteration,
            story_id: self.story_id.clone(),
            agent: self.agent.clone(),
            duration_secs: self.duration_secs,
            retries: self.retry_count + self.rollback_retries,
            status: self.status,
            failure_kind: self.failure_kind,
            log_path: self.log_path.clone(),
        }
    }
}

/// Git activity between the iteration's start and end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitActivity {
    pub commits: Vec<String>,
    pub changed_files: Vec<String>,
    pub uncommitted: Vec<String>,
}

/// Files belonging to one iteration.
#[derive(Debug, Clone)]
pub struct IterationFiles {
    pub log_path: PathBuf,
    pub prompt_path: PathBuf,
    pub record_path: PathBuf,
    pub summary_path: PathBuf,
}

/// Writer for the run artifacts of one state directory.
#[derive(Debug, Clone)]
pub struct RunLog {
    state: StatePaths,
}

impl RunLog {
    pub fn new(state: StatePaths) -> Self {
        Self { state }
    }

    pub fn iteration_files(&self, run_id: &str, iteration: u32) -> IterationFiles {
        let stem = format!("{run_id}-iter-{iteration}");
        let runs = &self.state.runs_dir;
        IterationFiles {
            log_path: runs.join(format!("{stem}.log")),
            prompt_path: runs.join(format!("{stem}.prompt.md")),
            record_path: runs.join(format!("{stem}.json")),
            summary_path: runs.join(format!("{stem}.md")),
        }
    }

    /// Write the JSON record and its markdown summary; returns the record path.
    pub fn write_record(&self, record: &IterationRecord, activity: &GitActivity) -> Result<PathBuf> {
        let files = self.iteration_files(&record.run_id, record.iteration);
        write_json(&files.record_path, record)?;
        fs::write(&files.summary_path, render_markdown(record, activity))
            .with_context(|| format!("write {}", files.summary_path.display()))?;
        debug!(path = %files.record_path.display(), "iteration record written");
        Ok(files.record_path)
    }

    pub fn append_error(&self, record: &IterationRecord, record_path: &Path) -> Result<()> {
        let kind = record.failure_kind.map(FailureKind::as_str).unwrap_or("error");
        let line = format!(
            "[{}] run={} iteration={} story={} kind={} exit={} agent={} record={} log={}",
            record.ended_at.to_rfc3339(),
            record.run_id,
            record.iteration,
            record.story_id,
            kind,
            record.exit_code,
            record.agent,
            record_path.display(),
            record.log_path
        );
        append_line(&self.state.errors_log_path, &line)
    }

    pub fn append_progress(&self, record: &IterationRecord) -> Result<()> {
        let status = match record.status {
            IterationStatus::Success => "success",
            IterationStatus::Error => "error",
        };
        let line = format!(
            "{} | run {} | iter {} | {} | {} | {}s | agent {}",
            record.ended_at.format("%Y-%m-%d %H:%M:%S"),
            record.run_id,
            record.iteration,
            record.story_id,
            status,
            record.duration_secs,
            record.agent
        );
        insert_run_summary_line(&self.state.progress_path, &line)
    }
}

/// Insert `- line` right below `## Run Summary`, creating the section if needed.
fn insert_run_summary_line(path: &Path, line: &str) -> Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let mut out: Vec<String> = Vec::new();
    let mut inserted = false;
    for l in existing.lines() {
        out.push(l.to_string());
        if !inserted && l.trim() == RUN_SUMMARY_HEADING {
            out.push(format!("- {line}"));
            inserted = true;
        }
    }
    if !inserted {
        let mut header = vec![
            "# Progress".to_string(),
            String::new(),
            RUN_SUMMARY_HEADING.to_string(),
            format!("- {line}"),
            String::new(),
        ];
        if !existing.trim().is_empty() {
            header.extend(out);
        }
        out = header;
    }
    let mut text = out.join("\n").trim_end().to_string();
    text.push('\n');
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, text).with_context(|| format!("write {}", path.display()))
}

fn render_markdown(record: &IterationRecord, activity: &GitActivity) -> String {
    let mut out = String::new();
    out.push_str("# Iteration Summary\n\n");
    let _ = writeln!(out, "- Run ID: {}", record.run_id);
    let _ = writeln!(out, "- Iteration: {}", record.iteration);
    let _ = writeln!(out, "- Story: {}: {}", record.story_id, record.story_title);
    let _ = writeln!(out, "- Agent: {}", record.agent);
    let _ = writeln!(out, "- Started: {}", record.started_at.to_rfc3339());
    let _ = writeln!(out, "- Ended: {}", record.ended_at.to_rfc3339());
    let _ = writeln!(out, "- Duration: {}s", record.duration_secs);
    let status = match (record.status, record.failure_kind) {
        (IterationStatus::Success, _) => "success".to_string(),
        (IterationStatus::Error, Some(kind)) => format!("error ({kind})"),
        (IterationStatus::Error, None) => "error".to_string(),
    };
    let _ = writeln!(out, "- Status: {status} (exit {})", record.exit_code);
    let _ = writeln!(out, "- Log: {}\n", record.log_path);

    out.push_str("## Git\n");
    let _ = writeln!(out, "- Head (before): {}", record.head_before);
    let _ = writeln!(out, "- Head (after): {}", record.head_after);
    if record.rolled_back {
        out.push_str("- Rolled back to the pre-story commit\n");
    }
    out.push('\n');
    out.push_str("### Commits\n");
    push_list(&mut out, &activity.commits, "(none)");
    out.push_str("### Changed Files (commits)\n");
    push_list(&mut out, &activity.changed_files, "(none)");
    out.push_str("### Uncommitted Changes\n");
    push_list(&mut out, &activity.uncommitted, "(clean)");

    out.push_str("## Retry Statistics\n");
    if record.retry_count > 0 {
        let _ = writeln!(out, "- Retry count: {}", record.retry_count);
        let _ = writeln!(out, "- Total retry wait time: {}s", record.retry_wait_secs);
    } else {
        out.push_str("- Retry count: 0 (succeeded on first attempt)\n");
    }
    if record.rollback_retries > 0 {
        let _ = writeln!(out, "- Rollback retries: {}", record.rollback_retries);
    }
    out.push('\n');

    out.push_str("## Agent Switches\n");
    match &record.switch {
        Some(switch) => {
            let _ = writeln!(out, "- From: {}", switch.from);
            let _ = writeln!(out, "- To: {}", switch.to);
            let _ = writeln!(out, "- Reason: {}", switch.reason);
        }
        None => out.push_str("- none\n"),
    }
    out
}

fn push_list(out: &mut String, items: &[String], empty: &str) {
    if items.is_empty() {
        let _ = writeln!(out, "- {empty}");
    } else {
        for item in items {
            let _ = writeln!(out, "- {item}");
        }
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: IterationStatus) -> IterationRecord {
        let now = Utc::now();
        IterationRecord {
            run_id: "run-1".into(),
            iteration: 2,
            story_id: "US-002".into(),
            story_title: "Add login".into(),
            started_at: now,
            ended_at: now,
            duration_secs: 12,
            status,
            exit_code: if status == IterationStatus::Success { 0 } else { 1 },
            retry_count: 1,
            retry_wait_secs: 2,
            failure_kind: (status == IterationStatus::Error).then_some(FailureKind::Quality),
            agent: "claude".into(),
            head_before: "aaa".into(),
            head_after: "bbb".into(),
            rolled_back: status == IterationStatus::Error,
            rollback_retries: 0,
            switch: Some(SwitchRecord {
                from: "claude".into(),
                to: "codex".into(),
                reason: FailureKind::Quality,
            }),
            log_path: "runs/run-1-iter-2.log".into(),
        }
    }

    #[test]
    fn record_json_uses_stable_field_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = RunLog::new(StatePaths::new(temp.path()));
        let rec = record(IterationStatus::Error);
        let path = log
            .write_record(&rec, &GitActivity::default())
            .expect("write");
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["status"], "error");
        assert_eq!(value["failure_kind"], "quality");
        assert_eq!(value["switch"]["to"], "codex");
        assert_eq!(value["retry_wait_secs"], 2);
        let md = fs::read_to_string(path.with_extension("md")).expect("md");
        assert!(md.contains("- Head (before): aaa"));
        assert!(md.contains("Rolled back"));
    }

    #[test]
    fn progress_lines_go_under_run_summary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = StatePaths::new(temp.path());
        fs::write(&state.progress_path, "# Progress\n\n## Run Summary\n\n## Notes\nkeep me\n")
            .expect("seed");
        let log = RunLog::new(state.clone());
        log.append_progress(&record(IterationStatus::Success))
            .expect("append");
        let text = fs::read_to_string(&state.progress_path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[2], "## Run Summary");
        assert!(lines[3].starts_with("- ") && lines[3].contains("US-002 | success"));
        assert!(text.contains("keep me"));
    }

    #[test]
    fn progress_section_is_created_when_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = StatePaths::new(temp.path());
        let log = RunLog::new(state.clone());
        log.append_progress(&record(IterationStatus::Error))
            .expect("append");
        let text = fs::read_to_string(&state.progress_path).expect("read");
        assert!(text.starts_with("# Progress\n\n## Run Summary\n- "));
    }

    #[test]
    fn errors_log_gets_one_line_per_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = StatePaths::new(temp.path());
        let log = RunLog::new(state.clone());
        let rec = record(IterationStatus::Error);
        log.append_error(&rec, Path::new("runs/run-1-iter-2.json"))
            .expect("append");
        log.append_error(&rec, Path::new("runs/run-1-iter-2.json"))
            .expect("append");
        let text = fs::read_to_string(&state.errors_log_path).expect("read");
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("kind=quality"));
    }
}
