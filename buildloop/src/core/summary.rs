//! Rendering of the end-of-run summary table and error section.

use std::fmt::Write as _;

use crate::core::types::{FailureKind, IterationStatus};

/// One row of the run summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    pub iteration: u32,
    pub story_id: String,
    pub agent: String,
    pub duration_secs: u64,
    pub retries: u32,
    pub status: IterationStatus,
    pub failure_kind: Option<FailureKind>,
    /// Full agent log for this iteration.
    pub log_path: String,
}

/// Render the summary table (always) and the error section (if any row failed).
pub fn render_summary(rows: &[SummaryRow]) -> String {
    let mut out = String::new();
    out.push_str("Run summary\n");
    if rows.is_empty() {
        out.push_str("  (no iterations executed)\n");
        return out;
    }

    let story_w = rows
        .iter()
        .map(|r| r.story_id.len())
        .max()
        .unwrap_or(0)
        .max("Story".len());
    let agent_w = rows
        .iter()
        .map(|r| r.agent.len())
        .max()
        .unwrap_or(0)
        .max("Agent".len());

    let _ = writeln!(
        out,
        "  {:>4}  {:<story_w$}  {:<agent_w$}  {:>8}  {:>7}  Result",
        "Iter", "Story", "Agent", "Duration", "Retries"
    );
    for row in rows {
        let result = match (row.status, row.failure_kind) {
            (IterationStatus::Success, _) => "success".to_string(),
            (IterationStatus::Error, Some(kind)) => format!("error ({kind})"),
            (IterationStatus::Error, None) => "error".to_string(),
        };
        let _ = writeln!(
            out,
            "  {:>4}  {:<story_w$}  {:<agent_w$}  {:>8}  {:>7}  {}",
            row.iteration,
            row.story_id,
            row.agent,
            format_duration(row.duration_secs),
            row.retries,
            result
        );
    }

    let failed: Vec<&SummaryRow> = rows
        .iter()
        .filter(|r| r.status == IterationStatus::Error)
        .collect();
    let total_secs: u64 = rows.iter().map(|r| r.duration_secs).sum();
    let total_retries: u32 = rows.iter().map(|r| r.retries).sum();
    let _ = writeln!(
        out,
        "  iterations={} success={} failed={} duration={} retries={}",
        rows.len(),
        rows.len() - failed.len(),
        failed.len(),
        format_duration(total_secs),
        total_retries
    );

    if !failed.is_empty() {
        out.push_str("\nErrors\n");
        for row in failed {
            let kind = row.failure_kind.map(|k| k.as_str()).unwrap_or("error");
            let _ = writeln!(
                out,
                "  iteration {} ({}): {} - see {}",
                row.iteration, row.story_id, kind, row.log_path
            );
        }
    }
    out
}

/// `75` -> `1m15s`, `3700` -> `1h01m40s`.
pub fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}
