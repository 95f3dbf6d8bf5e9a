//! Merge queue: visibility and waiting over the global merge lock.
//!
//! Waiters register a `<pid>-<stream>.json` entry, then poll the lock with a
//! doubling interval. Ordering is advisory: whoever re-acquires first after a
//! release wins, and losing that race just means polling again.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::backoff::PollBackoff;
use crate::core::merge_eta::{average_merge_duration, estimate_wait, record_duration};
use crate::io::config::write_atomic;
use crate::io::lock::{Acquire, Lock, LockGuard, LockRecord, MERGE_OWNER, pid_alive};
use crate::io::signals::Sleeper;

/// A registered merge-lock waiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub pid: u32,
    pub stream_id: u32,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct MergeStats {
    durations_secs: Vec<f64>,
}

/// Queue directory plus merge-duration history.
#[derive(Debug, Clone)]
pub struct MergeQueue {
    dir: PathBuf,
    stats_path: PathBuf,
    is_alive: fn(u32) -> bool,
}

impl MergeQueue {
    pub fn new(dir: impl Into<PathBuf>, stats_path: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stats_path: stats_path.into(),
            is_alive: pid_alive,
        }
    }

    pub fn with_liveness(mut self, is_alive: fn(u32) -> bool) -> Self {
        self.is_alive = is_alive;
        self
    }

    fn entry_path(&self, pid: u32, stream_id: u32) -> PathBuf {
        self.dir.join(format!("{pid}-{stream_id}.json"))
    }

    /// Register the current process as waiting on behalf of `stream_id`.
    pub fn register(&self, stream_id: u32) -> Result<QueueRegistration> {
        let entry = QueueEntry {
            pid: std::process::id(),
            stream_id,
            registered_at: Utc::now(),
        };
        let path = self.entry_path(entry.pid, stream_id);
        let mut buf = serde_json::to_string_pretty(&entry).context("serialize queue entry")?;
        buf.push('\n');
        write_atomic(&path, &buf)?;
        debug!(stream_id, "registered in merge queue");
        Ok(QueueRegistration { path, entry })
    }

    /// Live waiters in registration order. Entries of dead processes are removed.
    pub fn entries(&self) -> Result<Vec<QueueEntry>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.dir.display())),
        };
        let mut entries = Vec::new();
        for dirent in read_dir {
            let path = dirent
                .with_context(|| format!("read {}", self.dir.display()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let entry = match read_entry(&path) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(err) => {
                    warn!(path = %path.display(), err = %err, "dropping unreadable queue entry");
                    let _ = fs::remove_file(&path);
                    continue;
                }
            };
            if !(self.is_alive)(entry.pid) {
                info!(pid = entry.pid, stream_id = entry.stream_id, "pruning abandoned queue entry");
                let _ = fs::remove_file(&path);
                continue;
            }
            entries.push(entry);
        }
        entries.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then(a.pid.cmp(&b.pid))
        });
        Ok(entries)
    }

    /// 1-indexed position of `(pid, stream_id)` among live waiters.
    pub fn position(&self, pid: u32, stream_id: u32) -> Result<Option<usize>> {
        Ok(self
            .entries()?
            .iter()
            .position(|e| e.pid == pid && e.stream_id == stream_id)
            .map(|idx| idx + 1))
    }

    pub fn merge_history(&self) -> Result<Vec<Duration>> {
        Ok(self
            .load_stats()?
            .durations_secs
            .into_iter()
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .collect())
    }

    pub fn average_merge_duration(&self, fallback: Duration) -> Result<Duration> {
        Ok(average_merge_duration(&self.merge_history()?, fallback))
    }

    /// Append a finished merge's duration to the ETA history.
    pub fn record_merge(&self, duration: Duration) -> Result<()> {
        let mut history = self.merge_history()?;
        record_duration(&mut history, duration);
        let stats = MergeStats {
            durations_secs: history.iter().map(Duration::as_secs_f64).collect(),
        };
        let mut buf = serde_json::to_string_pretty(&stats).context("serialize merge stats")?;
        buf.push('\n');
        write_atomic(&self.stats_path, &buf)
    }

    /// Estimated wait for the waiter at `position` given the current holder.
    pub fn estimate(
        &self,
        position: usize,
        holder: Option<&LockRecord>,
        fallback: Duration,
    ) -> Result<Duration> {
        let average = self.average_merge_duration(fallback)?;
        let holder_elapsed = holder.map(|h| {
            (Utc::now() - h.acquired_at)
                .to_std()
                .unwrap_or(Duration::ZERO)
        });
        Ok(estimate_wait(position, average, holder_elapsed))
    }

    fn load_stats(&self) -> Result<MergeStats> {
        let contents = match fs::read_to_string(&self.stats_path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(MergeStats::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.stats_path.display()));
            }
        };
        match serde_json::from_str(&contents) {
            Ok(stats) => Ok(stats),
            Err(err) => {
                warn!(path = %self.stats_path.display(), err = %err, "ignoring unreadable merge stats");
                Ok(MergeStats::default())
            }
        }
    }
}

fn read_entry(path: &Path) -> Result<Option<QueueEntry>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let entry = serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(entry))
}

/// Queue entry owned by this process; unregistered on drop.
pub struct QueueRegistration {
    path: PathBuf,
    entry: QueueEntry,
}

impl QueueRegistration {
    pub fn entry(&self) -> &QueueEntry {
        &self.entry
    }
}

impl Drop for QueueRegistration {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(stream_id = self.entry.stream_id, "left merge queue"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), err = %e, "failed to remove queue entry"),
        }
    }
}

/// Result of waiting for the merge lock.
pub enum WaitOutcome {
    Acquired(LockGuard),
    TimedOut { holder: Option<LockRecord> },
    Interrupted,
}

/// Wait until the merge lock can be taken for `stream_id`, or `max_wait` elapses.
///
/// The wait is measured as the sum of poll intervals slept.
pub fn wait_with_backoff(
    lock: &Lock,
    queue: &MergeQueue,
    stream_id: u32,
    max_wait: Duration,
    estimated_merge: Duration,
    sleeper: &dyn Sleeper,
) -> Result<WaitOutcome> {
    if let Acquire::Acquired(guard) = lock.acquire(MERGE_OWNER)? {
        return Ok(WaitOutcome::Acquired(guard));
    }
    let registration = queue.register(stream_id)?;
    let mut backoff = PollBackoff::new();
    let mut waited = Duration::ZERO;
    loop {
        let holder = match lock.acquire(MERGE_OWNER)? {
            Acquire::Acquired(guard) => {
                info!(stream_id, waited_secs = waited.as_secs(), "merge lock acquired after waiting");
                drop(registration);
                return Ok(WaitOutcome::Acquired(guard));
            }
            Acquire::HeldBy(holder) => holder,
        };
        if waited >= max_wait {
            warn!(
                stream_id,
                holder_pid = holder.pid,
                holder = %holder.owner,
                waited_secs = waited.as_secs(),
                "timed out waiting for merge lock"
            );
            return Ok(WaitOutcome::TimedOut {
                holder: Some(holder),
            });
        }
        let position = queue
            .position(registration.entry().pid, stream_id)?
            .unwrap_or(1);
        let eta = queue.estimate(position, Some(&holder), estimated_merge)?;
        let interval = backoff.next_interval().min(max_wait - waited);
        info!(
            stream_id,
            holder = %holder.owner,
            holder_pid = holder.pid,
            position,
            eta_secs = eta.as_secs(),
            next_poll_secs = interval.as_secs(),
            "waiting for merge lock"
        );
        if !sleeper.sleep(interval) {
            return Ok(WaitOutcome::Interrupted);
        }
        waited += interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn never_alive(_: u32) -> bool {
        false
    }

    struct RecordingSleeper {
        slept: RefCell<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> bool {
            self.slept.borrow_mut().push(duration);
            true
        }
    }

    fn queue_in(dir: &Path) -> MergeQueue {
        MergeQueue::new(dir.join("merge-queue"), dir.join("merge-stats.json"))
    }

    #[test]
    fn registration_is_listed_and_removed_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = queue_in(temp.path());
        let reg = queue.register(4).expect("register");
        let entries = queue.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stream_id, 4);
        assert_eq!(queue.position(std::process::id(), 4).expect("pos"), Some(1));
        drop(reg);
        assert!(queue.entries().expect("entries").is_empty());
    }

    #[test]
    fn dead_waiters_are_pruned() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = queue_in(temp.path()).with_liveness(never_alive);
        let _reg = queue.register(1).expect("register");
        assert!(queue.entries().expect("entries").is_empty());
        assert_eq!(fs::read_dir(temp.path().join("merge-queue")).expect("dir").count(), 0);
    }

    #[test]
    fn merge_history_feeds_average() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = queue_in(temp.path());
        let fallback = Duration::from_secs(60);
        assert_eq!(queue.average_merge_duration(fallback).expect("avg"), fallback);
        queue.record_merge(Duration::from_secs(10)).expect("record");
        queue.record_merge(Duration::from_secs(20)).expect("record");
        assert_eq!(
            queue.average_merge_duration(fallback).expect("avg"),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn wait_times_out_and_unregisters() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = queue_in(temp.path());
        let lock = Lock::file(temp.path().join("merge.lock"));
        let Acquire::Acquired(_holder) = lock.acquire(MERGE_OWNER).expect("acquire") else {
            panic!("acquire");
        };
        let sleeper = RecordingSleeper {
            slept: RefCell::new(Vec::new()),
        };

        let outcome = wait_with_backoff(
            &lock,
            &queue,
            2,
            Duration::from_secs(10),
            Duration::from_secs(60),
            &sleeper,
        )
        .expect("wait");

        assert!(matches!(outcome, WaitOutcome::TimedOut { holder: Some(_) }));
        assert_eq!(
            *sleeper.slept.borrow(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(3),
            ]
        );
        assert!(queue.entries().expect("entries").is_empty());
    }

    #[test]
    fn free_lock_is_taken_without_waiting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = queue_in(temp.path());
        let lock = Lock::file(temp.path().join("merge.lock"));
        let sleeper = RecordingSleeper {
            slept: RefCell::new(Vec::new()),
        };
        let outcome = wait_with_backoff(
            &lock,
            &queue,
            1,
            Duration::from_secs(10),
            Duration::from_secs(60),
            &sleeper,
        )
        .expect("wait");
        assert!(matches!(outcome, WaitOutcome::Acquired(_)));
        assert!(sleeper.slept.borrow().is_empty());
    }
}
