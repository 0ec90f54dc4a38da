//! Node-local execution lock.
//!
//! The lock is a small JSON file created with `O_CREAT | O_EXCL`
//! semantics, so two attempts racing on the same node cannot both observe
//! "no lock" and proceed. A lock older than its TTL is presumed abandoned
//! and may be reclaimed; reclaiming is reported to the caller so it can be
//! logged and audited.
//!
//! The lock lives on the node, independent of the coordinator's lifetime,
//! and is the authoritative mutual-exclusion mechanism.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LockError;
use crate::types::StaleLockInfo;

/// Holder id recorded for lock files whose contents cannot be parsed.
const UNREADABLE_HOLDER: &str = "<unreadable>";

/// Rounds of create/evict before giving up.
const MAX_ROUNDS: usize = 4;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLock {
    /// Attempt that owns the lock
    pub holder_attempt_id: String,
    /// When it was taken
    pub acquired_at: DateTime<Utc>,
    /// Time-to-live in milliseconds
    pub ttl_ms: u64,
}

impl ExecutionLock {
    /// Create a lock value.
    #[must_use]
    pub fn new(holder: impl Into<String>, acquired_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            holder_attempt_id: holder.into(),
            acquired_at,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Configured TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Age at `now`; zero if the clock went backwards.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// A lock at or past its TTL is abandoned.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.age(now) >= self.ttl()
    }
}

/// Result of an acquisition attempt.
#[derive(Debug)]
pub enum Acquisition {
    /// No lock existed; we own it now
    Acquired(LockGuard),
    /// An abandoned lock was evicted and we own it now
    Reclaimed {
        guard: LockGuard,
        stale: StaleLockInfo,
    },
    /// A live lock is held by someone else
    Held(ExecutionLock),
}

/// File-backed lock for one node.
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
    ttl: Duration,
    /// Serializes acquisitions from this process; the file handles other processes.
    local: Arc<Mutex<()>>,
}

impl LockFile {
    /// Create a handle for the lock at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            local: Arc::new(Mutex::new(())),
        }
    }

    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// TTL applied to new locks.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Read the current lock, if any.
    pub fn current(&self) -> Result<Option<ExecutionLock>, LockError> {
        read_lock(&self.path, self.ttl)
    }

    /// [`Self::try_acquire`] on the blocking pool, for async callers.
    pub async fn acquire(&self, holder: &str, now: DateTime<Utc>) -> Result<Acquisition, LockError> {
        let lock = self.clone();
        let holder = holder.to_string();
        tokio::task::spawn_blocking(move || lock.try_acquire(&holder, now)).await?
    }

    /// Test-and-set: take the lock for `holder` unless a live lock exists.
    ///
    /// Blocks on filesystem I/O.
    pub fn try_acquire(&self, holder: &str, now: DateTime<Utc>) -> Result<Acquisition, LockError> {
        let _local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_parent()?;

        let mut reclaimed: Option<StaleLockInfo> = None;

        for _ in 0..MAX_ROUNDS {
            match self.create(holder, now) {
                Ok(guard) => {
                    debug!(path = %self.path.display(), holder, "Execution lock acquired");
                    return Ok(match reclaimed {
                        Some(stale) => Acquisition::Reclaimed { guard, stale },
                        None => Acquisition::Acquired(guard),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(self.io_error(e)),
            }

            let Some(existing) = self.current()? else {
                continue;
            };

            if !existing.is_stale(now) {
                return Ok(Acquisition::Held(existing));
            }

            if self.evict(&existing)? {
                reclaimed = Some(StaleLockInfo {
                    previous_holder: existing.holder_attempt_id.clone(),
                    acquired_at: existing.acquired_at,
                    age_ms: u64::try_from(existing.age(now).as_millis()).unwrap_or(u64::MAX),
                    ttl_ms: existing.ttl_ms,
                });
            }
        }

        match self.current()? {
            Some(lock) => Ok(Acquisition::Held(lock)),
            None => Err(LockError::Unsettled(self.path.display().to_string())),
        }
    }

    fn ensure_parent(&self) -> Result<(), LockError> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))
            }
            _ => Ok(()),
        }
    }

    fn create(&self, holder: &str, now: DateTime<Utc>) -> std::io::Result<LockGuard> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;

        let lock = ExecutionLock::new(holder, now, self.ttl);
        let body = serde_json::to_vec(&lock).map_err(std::io::Error::other)?;
        if let Err(e) = file.write_all(&body).and_then(|()| file.sync_all()) {
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }

        Ok(LockGuard {
            path: self.path.clone(),
            holder: holder.to_string(),
            ttl: self.ttl,
            released: false,
        })
    }

    /// Move the stale lock aside. Returns false if it was replaced under us.
    fn evict(&self, stale: &ExecutionLock) -> Result<bool, LockError> {
        let aside = self
            .path
            .with_extension(format!("reclaim-{}", Uuid::new_v4().simple()));

        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(self.io_error(e)),
        }

        let moved = read_lock(&aside, self.ttl)?;
        let same = moved.as_ref().is_some_and(|m| {
            m.holder_attempt_id == stale.holder_attempt_id && m.acquired_at == stale.acquired_at
        });

        if !same {
            // Someone replaced the stale lock between our read and rename; put theirs back.
            if let Err(e) = fs::hard_link(&aside, &self.path) {
                if e.kind() != ErrorKind::AlreadyExists {
                    let _ = fs::remove_file(&aside);
                    return Err(self.io_error(e));
                }
            }
        }

        let _ = fs::remove_file(&aside);
        Ok(same)
    }

    fn io_error(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

/// Parse a lock file; unreadable contents age from the file's mtime.
fn read_lock(path: &Path, ttl: Duration) -> Result<Option<ExecutionLock>, LockError> {
    let io_error = |source| LockError::Io {
        path: path.display().to_string(),
        source,
    };

    let contents = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(e)),
    };

    if let Ok(lock) = serde_json::from_slice::<ExecutionLock>(&contents) {
        return Ok(Some(lock));
    }

    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(t) => DateTime::<Utc>::from(t),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(e)),
    };
    warn!(path = %path.display(), "Lock file unreadable, aging it from mtime");
    Ok(Some(ExecutionLock::new(UNREADABLE_HOLDER, modified, ttl)))
}

/// Ownership of the node lock. Released on drop, whatever the exit path.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    holder: String,
    ttl: Duration,
    released: bool,
}

impl LockGuard {
    /// Attempt id that owns the lock.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release explicitly, surfacing errors.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.release_inner()
    }

    /// [`Self::release`] on the blocking pool, for async callers.
    pub async fn unlock(self) -> Result<(), LockError> {
        tokio::task::spawn_blocking(move || self.release()).await?
    }

    fn release_inner(&self) -> Result<(), LockError> {
        match read_lock(&self.path, self.ttl)? {
            Some(lock) if lock.holder_attempt_id == self.holder => {
                match fs::remove_file(&self.path) {
                    Ok(()) => {
                        debug!(path = %self.path.display(), holder = %self.holder, "Execution lock released");
                        Ok(())
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    Err(source) => Err(LockError::Io {
                        path: self.path.display().to_string(),
                        source,
                    }),
                }
            }
            Some(lock) => {
                warn!(
                    holder = %self.holder,
                    current = %lock.holder_attempt_id,
                    "Execution lock was reclaimed by another attempt, leaving it in place"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.release_inner() {
            warn!(holder = %self.holder, error = %e, "Failed to release execution lock");
        }
    }
}
