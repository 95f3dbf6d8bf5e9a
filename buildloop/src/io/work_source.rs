//! Work-item source backed by the markdown requirements document.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::types::{ItemCounts, WorkItem};
use crate::core::work_items::{counts, next_open, parse_work_items};
use crate::error::Fault;

/// Supplier of work items. Marking items done is left to the agent.
pub trait WorkItemSource {
    /// Next unresolved item, or `None` when every item is done.
    fn next_item(&self) -> Result<Option<WorkItem>>;

    fn counts(&self) -> Result<ItemCounts>;

    /// Location passed to prompts.
    fn location(&self) -> &Path;
}

#[derive(Debug, Clone)]
pub struct PrdSource {
    path: PathBuf,
}

impl PrdSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parsed items. A missing document or one without items is a configuration fault.
    pub fn load_items(&self) -> Result<Vec<WorkItem>> {
        let document = match fs::read_to_string(&self.path) {
            Ok(doc) => doc,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Fault::Configuration(format!(
                    "work-item document {} not found",
                    self.path.display()
                ))
                .into());
            }
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };
        let items = parse_work_items(&document);
        if items.is_empty() {
            return Err(Fault::Configuration(format!(
                "no work items in {} (expected headings like '### [ ] US-001: Title')",
                self.path.display()
            ))
            .into());
        }
        Ok(items)
    }

    /// Counts for status displays: a missing or empty document counts as zero items.
    pub fn counts_lenient(&self) -> Result<ItemCounts> {
        match fs::read_to_string(&self.path) {
            Ok(doc) => Ok(counts(&parse_work_items(&doc))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ItemCounts::default()),
            Err(e) => Err(e).with_context(|| format!("read {}", self.path.display())),
        }
    }
}

impl WorkItemSource for PrdSource {
    fn next_item(&self) -> Result<Option<WorkItem>> {
        let items = self.load_items()?;
        Ok(next_open(&items).cloned())
    }

    fn counts(&self) -> Result<ItemCounts> {
        Ok(counts(&self.load_items()?))
    }

    fn location(&self) -> &Path {
        &self.path
    }
}
