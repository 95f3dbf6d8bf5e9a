//! Parsing of the markdown work-item document.
//!
//! An item starts at a heading `### [ ] US-001: Title` (status box optional,
//! `[x]` marks it done) and runs until the next item heading.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{ItemCounts, WorkItem};

static ITEM_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^###\s+(\[(?P<status>[ xX])\]\s+)?(?P<id>[A-Z][A-Z0-9]*-\d+):\s*(?P<title>.+)$")
        .expect("item heading regex is valid")
});

static NO_ROLLBACK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[no-rollback\]|<!--\s*no-rollback\s*-->")
        .expect("no-rollback regex is valid")
});

/// Parse all items in document order.
pub fn parse_work_items(document: &str) -> Vec<WorkItem> {
    let mut items = Vec::new();
    let mut current: Option<(WorkItem, Vec<&str>)> = None;

    for line in document.lines() {
        if let Some(caps) = ITEM_HEADING_RE.captures(line) {
            if let Some((item, lines)) = current.take() {
                items.push(finish(item, lines));
            }
            let done = caps
                .name("status")
                .is_some_and(|m| m.as_str().eq_ignore_ascii_case("x"));
            let item = WorkItem {
                id: caps["id"].to_string(),
                title: caps["title"].trim().to_string(),
                block: String::new(),
                done,
            };
            current = Some((item, vec![line]));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some((item, lines)) = current.take() {
        items.push(finish(item, lines));
    }
    items
}

fn finish(mut item: WorkItem, lines: Vec<&str>) -> WorkItem {
    item.block = lines.join("\n").trim_end().to_string();
    item
}

/// First item that is not done.
pub fn next_open(items: &[WorkItem]) -> Option<&WorkItem> {
    items.iter().find(|item| !item.done)
}

pub fn counts(items: &[WorkItem]) -> ItemCounts {
    ItemCounts {
        total: items.len(),
        remaining: items.iter().filter(|item| !item.done).count(),
    }
}

/// True if the item opts out of automatic rollback.
pub fn has_no_rollback_directive(item: &WorkItem) -> bool {
    NO_ROLLBACK_RE.is_match(&item.block)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "# PRD\n\nintro\n\n### [x] US-001: Scaffold app\n- done already\n\n### [ ] US-002: Add login\nAcceptance:\n- form renders\n\n### US-003: Add logout\n<!-- no-rollback -->\n";

    #[test]
    fn parses_items_in_document_order() {
        let items = parse_work_items(DOC);
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["US-001", "US-002", "US-003"]);
        assert!(items[0].done);
        assert!(!items[1].done);
        assert!(!items[2].done, "missing status box means open");
    }

    #[test]
    fn block_spans_until_next_heading() {
        let items = parse_work_items(DOC);
        assert_eq!(
            items[1].block,
            "### [ ] US-002: Add login\nAcceptance:\n- form renders"
        );
        assert_eq!(items[1].title, "Add login");
    }

    #[test]
    fn next_open_skips_done_items() {
        let items = parse_work_items(DOC);
        assert_eq!(next_open(&items).map(|i| i.id.as_str()), Some("US-002"));
    }

    #[test]
    fn counts_total_and_remaining() {
        let items = parse_work_items(DOC);
        let c = counts(&items);
        assert_eq!(c.total, 3);
        assert_eq!(c.remaining, 2);
        assert_eq!(c.done(), 1);
    }

    #[test]
    fn uppercase_x_marks_done() {
        let items = parse_work_items("### [X] T-9: Thing\n");
        assert!(items[0].done);
        assert!(next_open(&items).is_none());
    }

    #[test]
    fn detects_no_rollback_directive() {
        let items = parse_work_items(DOC);
        assert!(!has_no_rollback_directive(&items[1]));
        assert!(has_no_rollback_directive(&items[2]));
    }

    #[test]
    fn document_without_items_is_empty() {
        assert!(parse_work_items("# Nothing here\n## Not an item\n").is_empty());
    }
}
