//! Deterministic classification of finished agent invocations.
//!
//! The order of checks is fixed: success, interrupted, timeout, then log
//! inspection for quality signatures (test, type, lint), then generic error.

use std::fmt;

use regex::Regex;

use crate::core::types::{FailureKind, is_interrupt_code};

/// Default exit codes treated as timeouts: `timeout(1)`, SIGKILL (OOM killer), SIGALRM.
pub const DEFAULT_TIMEOUT_EXIT_CODES: [i32; 3] = [124, 137, 142];

pub const DEFAULT_TEST_PATTERNS: [&str; 5] = [
    r"\b\d+ (tests? )?failed\b",
    r"(?i)\btests? failed\b",
    r"test result: FAILED",
    r"(?m)^FAIL\b",
    r"(?i)assertion(error| failed)",
];

pub const DEFAULT_TYPE_PATTERNS: [&str; 4] = [
    r"error TS\d+:",
    r"error\[E\d{4}\]",
    r"(?i)\btype ?error\b",
    r"(?i)mypy.*\berror\b",
];

pub const DEFAULT_LINT_PATTERNS: [&str; 4] = [
    r"(?i)\blint(ing)? (error|failed)",
    r"(?i)eslint.*\d+ problems?",
    r"(?i)clippy.*error",
    r"(?i)ruff.*found \d+ errors?",
];

/// A single log signature.
pub trait LogMatcher: Send + Sync {
    fn matches(&self, log: &str) -> bool;

    /// Human-readable description of the signature.
    fn describe(&self) -> String;
}

/// Regex-backed log signature.
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    regex: Regex,
}

impl RegexMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }
}

impl LogMatcher for RegexMatcher {
    fn matches(&self, log: &str) -> bool {
        self.regex.is_match(log)
    }

    fn describe(&self) -> String {
        self.regex.as_str().to_string()
    }
}

/// Category of quality failure, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QualityCategory {
    Test,
    Type,
    Lint,
}

impl QualityCategory {
    pub const ALL: [QualityCategory; 3] = [
        QualityCategory::Test,
        QualityCategory::Type,
        QualityCategory::Lint,
    ];
}

impl fmt::Display for QualityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QualityCategory::Test => "test",
            QualityCategory::Type => "type",
            QualityCategory::Lint => "lint",
        })
    }
}

/// Maps exit code + log text to a [`FailureKind`].
pub struct FailureClassifier {
    timeout_codes: Vec<i32>,
    test: Vec<Box<dyn LogMatcher>>,
    types: Vec<Box<dyn LogMatcher>>,
    lint: Vec<Box<dyn LogMatcher>>,
}

impl FailureClassifier {
    /// Compile a classifier from pattern lists. Fails on the first invalid regex.
    pub fn from_patterns<S: AsRef<str>>(
        timeout_codes: &[i32],
        test: &[S],
        types: &[S],
        lint: &[S],
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            timeout_codes: timeout_codes.to_vec(),
            test: compile(test)?,
            types: compile(types)?,
            lint: compile(lint)?,
        })
    }

    /// Register an extra signature for `category`, checked after the existing ones.
    pub fn add_matcher(&mut self, category: QualityCategory, matcher: Box<dyn LogMatcher>) {
        match category {
            QualityCategory::Test => self.test.push(matcher),
            QualityCategory::Type => self.types.push(matcher),
            QualityCategory::Lint => self.lint.push(matcher),
        }
    }

    pub fn classify(&self, exit_code: i32, log: &str) -> FailureKind {
        if exit_code == 0 {
            return FailureKind::Success;
        }
        if is_interrupt_code(exit_code) {
            return FailureKind::Interrupted;
        }
        if self.timeout_codes.contains(&exit_code) {
            return FailureKind::Timeout;
        }
        if self.quality_category(log).is_some() {
            return FailureKind::Quality;
        }
        FailureKind::Error
    }

    /// First quality category whose signatures match the log (test > type > lint).
    pub fn quality_category(&self, log: &str) -> Option<QualityCategory> {
        QualityCategory::ALL
            .into_iter()
            .find(|category| self.category_matches(*category, log))
    }

    pub fn category_matches(&self, category: QualityCategory, log: &str) -> bool {
        self.matchers(category).iter().any(|m| m.matches(log))
    }

    /// Log lines matching any signature of `category`, in log order.
    pub fn matching_lines<'a>(&self, category: QualityCategory, log: &'a str) -> Vec<&'a str> {
        let matchers = self.matchers(category);
        log.lines()
            .filter(|line| matchers.iter().any(|m| m.matches(line)))
            .collect()
    }

    fn matchers(&self, category: QualityCategory) -> &[Box<dyn LogMatcher>] {
        match category {
            QualityCategory::Test => &self.test,
            QualityCategory::Type => &self.types,
            QualityCategory::Lint => &self.lint,
        }
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::from_patterns(
            &DEFAULT_TIMEOUT_EXIT_CODES,
            &DEFAULT_TEST_PATTERNS,
            &DEFAULT_TYPE_PATTERNS,
            &DEFAULT_LINT_PATTERNS,
        )
        .expect("default classifier patterns are valid")
    }
}

fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Box<dyn LogMatcher>>, regex::Error> {
    patterns
        .iter()
        .map(|p| Ok(Box::new(RegexMatcher::new(p.as_ref())?) as Box<dyn LogMatcher>))
        .collect()
}
