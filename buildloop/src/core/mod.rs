//! Deterministic, pure logic shared by the build loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and injected predicates, and return deterministic outputs suitable
//! for tests.

pub mod backoff;
pub mod classifier;
pub mod fallback;
pub mod merge_eta;
pub mod rollback_policy;
pub mod summary;
pub mod types;
pub mod work_items;
