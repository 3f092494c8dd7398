//! Snapshot records and snapshot resolution
//!
//! A snapshot is a JSON record naming the root tree of a backup plus some
//! descriptive metadata. Its id is the SHA-256 of the stored record.
//!
//! Snapshots are addressed on the command line as `<id>[:<subfolder>]`:
//!
//! - `<id>` is a full id, a unique id prefix, or the token `latest`
//! - `<subfolder>` optionally narrows the restore to a directory inside the
//!   snapshot
//!
//! `latest` picks the newest snapshot accepted by a [`SnapshotFilter`].
//! An explicit id ignores the filter.

use crate::error::{Result, RestoreError};
use crate::repository::Repository;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Token selecting the newest matching snapshot
pub const LATEST: &str = "latest";

/// A stored snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    /// Snapshot id, filled in when loaded
    #[serde(skip)]
    pub id: String,
    /// Creation time
    pub time: DateTime<Utc>,
    /// Root tree id
    pub tree: String,
    /// Source paths that were backed up
    pub paths: Vec<String>,
    /// Host that created the snapshot
    pub hostname: String,
    /// User that created the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Free-form tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Program version that created the snapshot
    pub program_version: String,
}

impl Snapshot {
    /// Create a snapshot record for `tree` on the current host
    pub fn new(tree: impl Into<String>, paths: Vec<String>) -> Self {
        Self {
            id: String::new(),
            time: Utc::now(),
            tree: tree.into(),
            paths,
            hostname: hostname::get()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            username: std::env::var("USER").or_else(|_| std::env::var("USERNAME")).ok(),
            tags: Vec::new(),
            program_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// First eight characters of the id
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }

    /// Whether every tag in `required` is present
    pub fn has_tags(&self, required: &[String]) -> bool {
        required.iter().all(|tag| self.tags.contains(tag))
    }

    /// Whether every path in `required` is present
    pub fn has_paths(&self, required: &[String]) -> bool {
        required.iter().all(|path| self.paths.contains(path))
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "snapshot {} of [{}] at {}",
            self.short_id(),
            self.paths.join(" "),
            self.time.format("%Y-%m-%d %H:%M:%S")
        )?;
        match &self.username {
            Some(user) => write!(f, " by {}@{}", user, self.hostname),
            None => write!(f, " by {}", self.hostname),
        }
    }
}

/// Restricts which snapshots `latest` may resolve to
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    /// Accept snapshots from any of these hosts
    pub hosts: Vec<String>,
    /// Require all of these source paths
    pub paths: Vec<String>,
    /// Tag lists; each entry is comma separated and all its tags must be
    /// present, any entry may match
    pub tags: Vec<String>,
}

impl SnapshotFilter {
    /// Whether no restriction is set
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.paths.is_empty() && self.tags.is_empty()
    }

    /// Check whether `snapshot` passes the filter
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        if !self.hosts.is_empty() && !self.hosts.contains(&snapshot.hostname) {
            return false;
        }
        if !snapshot.has_paths(&self.paths) {
            return false;
        }
        if self.tags.is_empty() {
            return true;
        }
        self.tags.iter().any(|list| {
            let required: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
            snapshot.has_tags(&required)
        })
    }

    /// Resolve `spec` (`<id>|latest[:<subfolder>]`) to a snapshot and subfolder
    #[instrument(skip(self, repo))]
    pub fn find_latest(&self, repo: &Repository, spec: &str) -> Result<(Snapshot, String)> {
        let (id, subfolder) = split_snapshot_spec(spec);

        let snapshot = if id == LATEST {
            repo.list_snapshots()?
                .into_iter()
                .filter(|sn| self.matches(sn))
                .max_by(|a, b| a.time.cmp(&b.time))
                .ok_or_else(|| RestoreError::SnapshotNotFound(LATEST.to_string()))?
        } else {
            find_by_prefix(repo, id)?
        };

        debug!("Resolved {:?} to snapshot {}", spec, snapshot.short_id());
        Ok((snapshot, subfolder.to_string()))
    }
}

/// Split `<id>:<subfolder>` into its parts; the subfolder may be empty
pub fn split_snapshot_spec(spec: &str) -> (&str, &str) {
    match spec.split_once(':') {
        Some((id, subfolder)) => (id, subfolder),
        None => (spec, ""),
    }
}

/// Find the single snapshot whose id starts with `prefix`
pub fn find_by_prefix(repo: &Repository, prefix: &str) -> Result<Snapshot> {
    if prefix.is_empty() {
        return Err(RestoreError::SnapshotNotFound(prefix.to_string()));
    }

    let mut matches = repo
        .list_snapshot_ids()?
        .into_iter()
        .filter(|id| id.starts_with(prefix));

    match (matches.next(), matches.next()) {
        (Some(id), None) => repo.load_snapshot(&id),
        (Some(_), Some(_)) => Err(RestoreError::AmbiguousSnapshotId(prefix.to_string())),
        (None, _) => Err(RestoreError::SnapshotNotFound(prefix.to_string())),
    }
}
