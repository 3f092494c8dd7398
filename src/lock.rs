//! Repository lock files
//!
//! A lock is a small JSON record under `locks/` in the repository. Shared
//! (read) locks coexist with each other; an exclusive lock conflicts with
//! every other lock. Locks older than [`STALE_LOCK_MINUTES`] are treated as left
//! over from a crashed process and ignored.
//!
//! [`RepositoryLock`] is a guard: the lock file is removed when it is dropped,
//! so every exit path of an operation releases the repository. While held, a
//! background thread rewrites the record every [`REFRESH_INTERVAL`] so a long
//! running operation never looks stale to other processes.

use crate::error::{Result, RestoreError};
use crate::utils::atomic_write;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};
use uuid::Uuid;

/// Age in minutes after which a lock record is considered stale
pub const STALE_LOCK_MINUTES: i64 = 30;

/// How often a held lock rewrites its record
pub const REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    /// Read access, compatible with other shared locks
    Shared,
    /// Write access, incompatible with any other lock
    Exclusive,
}

/// Contents of a lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    /// Lock mode
    pub kind: LockKind,
    /// When the holder last refreshed the lock
    pub time: DateTime<Utc>,
    /// Host holding the lock
    pub hostname: String,
    /// Process holding the lock
    pub pid: u32,
}

impl LockRecord {
    fn new(kind: LockKind) -> Self {
        Self {
            kind,
            time: Utc::now(),
            hostname: hostname::get()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
        }
    }

    /// Whether the record is old enough to ignore
    pub fn is_stale(&self) -> bool {
        Utc::now() - self.time > Duration::minutes(STALE_LOCK_MINUTES)
    }

    fn conflicts_with(&self, kind: LockKind) -> bool {
        self.kind == LockKind::Exclusive || kind == LockKind::Exclusive
    }
}

impl std::fmt::Display for LockRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PID {} on {} ({} lock, refreshed {})",
            self.pid,
            self.hostname,
            match self.kind {
                LockKind::Shared => "shared",
                LockKind::Exclusive => "exclusive",
            },
            self.time.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// A held repository lock, released on drop
#[derive(Debug)]
pub struct RepositoryLock {
    path: PathBuf,
    kind: LockKind,
    refresher: Option<Refresher>,
}

/// Background thread keeping a lock record fresh
#[derive(Debug)]
struct Refresher {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Refresher {
    fn spawn(path: PathBuf, mut record: LockRecord, interval: std::time::Duration) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("lock-refresh".to_string())
            .spawn(move || {
                // Any message or a dropped sender ends the loop
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    record.time = Utc::now();
                    match write_record(&path, &record) {
                        Ok(()) => debug!("Refreshed lock {:?}", path),
                        Err(e) => warn!("Failed to refresh lock {:?}: {}", path, e),
                    }
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("Lock refresh thread panicked");
        }
    }
}

impl RepositoryLock {
    /// Acquire a lock of `kind` in `locks_dir`
    pub fn acquire(locks_dir: &Path, kind: LockKind) -> Result<Self> {
        Self::acquire_with_refresh(locks_dir, kind, REFRESH_INTERVAL)
    }

    /// Acquire a lock whose record is rewritten every `interval`
    pub fn acquire_with_refresh(locks_dir: &Path, kind: LockKind, interval: std::time::Duration) -> Result<Self> {
        fs::create_dir_all(locks_dir)?;

        for (path, record) in existing_locks(locks_dir)? {
            if record.is_stale() {
                warn!("Ignoring stale lock {:?} held by {}", path, record);
                continue;
            }
            if record.conflicts_with(kind) {
                return Err(RestoreError::Locked(record.to_string()));
            }
        }

        let path = locks_dir.join(format!("{}.json", Uuid::new_v4()));
        let record = LockRecord::new(kind);
        write_record(&path, &record)?;
        debug!("Acquired {:?} lock {:?}", kind, path);

        let mut lock = Self {
            path,
            kind,
            refresher: None,
        };
        // On spawn failure the guard drops and removes the record
        lock.refresher = Some(Refresher::spawn(lock.path.clone(), record, interval)?);
        Ok(lock)
    }

    /// Rewrite the record with the current time
    pub fn refresh(&self) -> Result<()> {
        write_record(&self.path, &LockRecord::new(self.kind))
    }

    /// Lock mode held
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepositoryLock {
    fn drop(&mut self) {
        // Stop refreshing first so the record is not written back after removal
        if let Some(refresher) = self.refresher.take() {
            refresher.stop();
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Released lock {:?}", self.path),
            Err(e) => warn!("Failed to remove lock file {:?}: {}", self.path, e),
        }
    }
}

fn write_record(path: &Path, record: &LockRecord) -> Result<()> {
    atomic_write(path, serde_json::to_string_pretty(record)?.as_bytes())
}

/// Read every parseable lock record in `locks_dir`
pub fn existing_locks(locks_dir: &Path) -> Result<Vec<(PathBuf, LockRecord)>> {
    let mut locks = Vec::new();
    if !locks_dir.exists() {
        return Ok(locks);
    }

    for entry in fs::read_dir(locks_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match fs::read_to_string(&path)
            .map_err(RestoreError::from)
            .and_then(|s| serde_json::from_str::<LockRecord>(&s).map_err(RestoreError::from))
        {
            Ok(record) => locks.push((path, record)),
            // The file may have been removed by its holder since read_dir
            Err(e) => debug!("Skipping unreadable lock {:?}: {}", path, e),
        }
    }
    Ok(locks)
}
