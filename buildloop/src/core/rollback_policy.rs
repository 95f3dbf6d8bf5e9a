//! Rollback trigger policy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::classifier::{FailureClassifier, QualityCategory};

/// Which verification failures trigger a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackTrigger {
    TestFail,
    LintFail,
    TypeFail,
    /// Any non-zero exit.
    AnyFail,
}

impl RollbackTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            RollbackTrigger::TestFail => "test-fail",
            RollbackTrigger::LintFail => "lint-fail",
            RollbackTrigger::TypeFail => "type-fail",
            RollbackTrigger::AnyFail => "any-fail",
        }
    }

    /// Quality category inspected by this trigger (`None` for `any-fail`).
    pub fn category(self) -> Option<QualityCategory> {
        match self {
            RollbackTrigger::TestFail => Some(QualityCategory::Test),
            RollbackTrigger::LintFail => Some(QualityCategory::Lint),
            RollbackTrigger::TypeFail => Some(QualityCategory::Type),
            RollbackTrigger::AnyFail => None,
        }
    }

    pub fn matches(self, classifier: &FailureClassifier, exit_code: i32, log: &str) -> bool {
        if exit_code == 0 {
            return false;
        }
        match self.category() {
            Some(category) => classifier.category_matches(category, log),
            None => true,
        }
    }
}

impl fmt::Display for RollbackTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollbackTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "test-fail" => Ok(RollbackTrigger::TestFail),
            "lint-fail" => Ok(RollbackTrigger::LintFail),
            "type-fail" => Ok(RollbackTrigger::TypeFail),
            "any-fail" => Ok(RollbackTrigger::AnyFail),
            other => Err(format!(
                "unknown rollback trigger '{other}' (expected test-fail, lint-fail, type-fail or any-fail)"
            )),
        }
    }
}

/// Why a failed iteration was not rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackSkip {
    Succeeded,
    Disabled,
    Directive,
    PolicyMismatch,
}

/// Decide whether a finished invocation must be rolled back.
pub fn rollback_skip_reason(
    enabled: bool,
    trigger: RollbackTrigger,
    classifier: &FailureClassifier,
    exit_code: i32,
    log: &str,
    no_rollback_directive: bool,
) -> Option<RollbackSkip> {
    if exit_code == 0 {
        return Some(RollbackSkip::Succeeded);
    }
    if !enabled {
        return Some(RollbackSkip::Disabled);
    }
    if no_rollback_directive {
        return Some(RollbackSkip::Directive);
    }
    if !trigger.matches(classifier, exit_code, log) {
        return Some(RollbackSkip::PolicyMismatch);
    }
    None
}
