//! PID-checked mutual exclusion.
//!
//! Used for the per-stream run lock and for the global merge lock. A lock
//! record names its holder PID; a record whose PID is no longer running is
//! stale and is discarded before the next acquisition attempt.
//!
//! Storage sits behind [`LockStore`]. The file store creates the lock with an
//! atomic create-or-fail (`link(2)` of a fully written temp file), so readers
//! never observe a half-written record.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Owner name of the global merge lock.
pub const MERGE_OWNER: &str = "merge";

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    /// Stream id, or `merge` for the merge lock.
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn for_current_process(owner: &str) -> Self {
        Self {
            pid: std::process::id(),
            owner: owner.to_string(),
            acquired_at: Utc::now(),
        }
    }
}

/// Storage backend for one lock.
pub trait LockStore: Send + Sync {
    /// Create the lock if absent. Returns false if a lock already exists.
    fn try_create(&self, record: &LockRecord) -> Result<bool>;

    fn read(&self) -> Result<Option<LockRecord>>;

    /// Remove the lock only if it still holds `expected`.
    fn remove_if(&self, expected: &LockRecord) -> Result<bool>;

    /// Remove the lock unconditionally.
    fn remove(&self) -> Result<bool>;

    /// Human-readable lock name for messages.
    fn name(&self) -> String;
}

/// Lock stored as a JSON file.
#[derive(Debug, Clone)]
pub struct FileLockStore {
    path: PathBuf,
}

impl FileLockStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn sibling(&self, tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{tag}-{}-{nanos}", std::process::id()));
        self.path.with_file_name(name)
    }
}

impl LockStore for FileLockStore {
    fn try_create(&self, record: &LockRecord) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let tmp = self.sibling("tmp");
        let mut buf = serde_json::to_string_pretty(record).context("serialize lock record")?;
        buf.push('\n');
        fs::write(&tmp, buf).with_context(|| format!("write {}", tmp.display()))?;
        let linked = fs::hard_link(&tmp, &self.path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).with_context(|| format!("create lock {}", self.path.display())),
        }
    }

    fn read(&self) -> Result<Option<LockRecord>> {
        read_record(&self.path)
    }

    fn remove_if(&self, expected: &LockRecord) -> Result<bool> {
        match self.read()? {
            Some(current) if current == *expected => {}
            _ => return Ok(false),
        }
        // Move the file aside before deleting so a lock created in between is never removed.
        let tombstone = self.sibling("stale");
        match fs::rename(&self.path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("remove lock {}", self.path.display()));
            }
        }
        let moved = read_record(&tombstone)?;
        if moved.as_ref() == Some(expected) {
            let _ = fs::remove_file(&tombstone);
            return Ok(true);
        }
        // Someone re-acquired between our read and rename: put their lock back.
        let _ = fs::hard_link(&tombstone, &self.path);
        let _ = fs::remove_file(&tombstone);
        Ok(false)
    }

    fn remove(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("remove lock {}", self.path.display())),
        }
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}

/// Unreadable records are treated as owned by PID 0, i.e. stale.
fn read_record(path: &Path) -> Result<Option<LockRecord>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read lock {}", path.display())),
    };
    match serde_json::from_str(&contents) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(lock = %path.display(), err = %e, "unreadable lock record");
            Ok(Some(LockRecord {
                pid: 0,
                owner: "unknown".to_string(),
                acquired_at: DateTime::<Utc>::default(),
            }))
        }
    }
}

/// Result of an acquisition attempt.
#[derive(Debug)]
pub enum Acquire {
    Acquired(LockGuard),
    HeldBy(LockRecord),
}

/// A lock plus the liveness check used to detect stale holders.
#[derive(Clone)]
pub struct Lock {
    store: Arc<dyn LockStore>,
    is_alive: fn(u32) -> bool,
}

impl Lock {
    /// File-backed lock using real process liveness.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::with_store(Arc::new(FileLockStore::new(path)), pid_alive)
    }

    pub fn with_store(store: Arc<dyn LockStore>, is_alive: fn(u32) -> bool) -> Self {
        Self { store, is_alive }
    }

    pub fn name(&self) -> String {
        self.store.name()
    }

    /// Try once to take the lock for `owner`, discarding a stale holder first.
    pub fn acquire(&self, owner: &str) -> Result<Acquire> {
        // Bounded: each round either succeeds, reports a live holder, or removes a stale one.
        for _ in 0..5 {
            if let Some(existing) = self.store.read()? {
                if (self.is_alive)(existing.pid) {
                    debug!(lock = %self.name(), holder = %existing.owner, pid = existing.pid, "lock held");
                    return Ok(Acquire::HeldBy(existing));
                }
                warn!(
                    lock = %self.name(),
                    holder = %existing.owner,
                    pid = existing.pid,
                    since = %existing.acquired_at.to_rfc3339(),
                    "removing stale lock (holder process is gone)"
                );
                self.store.remove_if(&existing)?;
                continue;
            }
            let record = LockRecord::for_current_process(owner);
            if self.store.try_create(&record)? {
                debug!(lock = %self.name(), owner, "lock acquired");
                return Ok(Acquire::Acquired(LockGuard {
                    store: self.store.clone(),
                    record,
                    released: false,
                }));
            }
        }
        match self.store.read()? {
            Some(holder) => Ok(Acquire::HeldBy(holder)),
            None => Err(anyhow!("lock {} keeps changing hands", self.name())),
        }
    }

    pub fn holder(&self) -> Result<Option<LockRecord>> {
        self.store.read()
    }

    /// True if a lock exists and its holder process is gone.
    pub fn is_stale(&self) -> Result<bool> {
        Ok(self
            .store
            .read()?
            .is_some_and(|record| !(self.is_alive)(record.pid)))
    }

    pub fn holder_alive(&self, record: &LockRecord) -> bool {
        (self.is_alive)(record.pid)
    }

    /// Remove the lock regardless of holder liveness. Returns the removed record.
    pub fn force_unlock(&self) -> Result<Option<LockRecord>> {
        let holder = self.store.read()?;
        if let Some(record) = &holder {
            warn!(
                lock = %self.name(),
                holder = %record.owner,
                pid = record.pid,
                "force-unlocking"
            );
            self.store.remove()?;
        }
        Ok(holder)
    }
}

/// Held lock; released on drop.
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    record: LockRecord,
    released: bool,
}

impl LockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if !self.store.remove_if(&self.record)? {
            warn!(lock = %self.store.name(), "lock was no longer ours at release");
        } else {
            info!(lock = %self.store.name(), "lock released");
        }
        Ok(())
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock", &self.store.name())
            .field("record", &self.record)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(err = %err, "failed to release lock");
        }
    }
}

/// True if a process with `pid` exists (EPERM counts as alive).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    pid != 0
}
