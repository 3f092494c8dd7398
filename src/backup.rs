//! Archiving a directory into a snapshot
//!
//! The archiver walks a source directory bottom-up: every file is cut into
//! fixed-size chunks stored as objects, every directory becomes a tree
//! object listing its children, and the root tree is recorded in a new
//! snapshot. Identical chunks and trees are stored once.
//!
//! Files of one directory are chunked in parallel on a `rayon` pool.
//! Entries that are neither files, directories nor symlinks are skipped
//! with a warning.

use crate::error::{Result, RestoreError};
use crate::lock::LockKind;
use crate::repository::Repository;
use crate::snapshot::Snapshot;
use crate::types::{Node, Tree};
use crate::utils::permissions_of;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Counts from one archive run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupStats {
    /// Files archived
    pub files: u64,
    /// Directories archived
    pub dirs: u64,
    /// Bytes read from the source
    pub bytes_read: u64,
    /// Chunks that were not yet stored
    pub new_chunks: u64,
}

#[derive(Default)]
struct Counters {
    files: AtomicU64,
    dirs: AtomicU64,
    bytes_read: AtomicU64,
    new_chunks: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BackupStats {
        BackupStats {
            files: self.files.load(Ordering::Relaxed),
            dirs: self.dirs.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            new_chunks: self.new_chunks.load(Ordering::Relaxed),
        }
    }
}

/// Stores a directory as a new snapshot
pub struct Archiver<'a> {
    repo: &'a Repository,
    source: PathBuf,
    hostname: Option<String>,
    tags: Vec<String>,
    chunk_size: usize,
    counters: Counters,
}

impl<'a> Archiver<'a> {
    /// Create an archiver for `source`
    pub fn new(repo: &'a Repository, source: impl Into<PathBuf>) -> Self {
        Self {
            repo,
            source: source.into(),
            hostname: None,
            tags: Vec::new(),
            chunk_size: repo.config().chunk_size.max(1),
            counters: Counters::default(),
        }
    }

    /// Record `hostname` instead of the local host name
    pub fn with_hostname(mut self, hostname: Option<String>) -> Self {
        self.hostname = hostname;
        self
    }

    /// Attach tags to the snapshot
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Override the chunk size from the repository config
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Archive the source and save the snapshot
    ///
    /// Returns the snapshot id and the run's counters.
    #[instrument(skip(self), fields(source = %self.source.display()))]
    pub fn run(&self) -> Result<(String, BackupStats)> {
        let _lock = self.repo.lock(LockKind::Exclusive)?;

        let metadata = fs::metadata(&self.source)?;
        if !metadata.is_dir() {
            return Err(RestoreError::NotADirectory(self.source.display().to_string()));
        }

        let tree = self.archive_dir(&self.source)?;

        let source = fs::canonicalize(&self.source).unwrap_or_else(|_| self.source.clone());
        let mut snapshot = Snapshot::new(tree, vec![source.display().to_string()]);
        if let Some(hostname) = &self.hostname {
            snapshot.hostname = hostname.clone();
        }
        snapshot.tags = self.tags.clone();
        let id = self.repo.save_snapshot(&snapshot)?;

        let stats = self.counters.snapshot();
        info!(
            "Saved snapshot {} ({} files, {} dirs, {} new chunks)",
            &id[..8],
            stats.files,
            stats.dirs,
            stats.new_chunks
        );
        Ok((id, stats))
    }

    fn archive_dir(&self, dir: &Path) -> Result<String> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            entries.push(entry?);
        }

        let nodes: Vec<Result<Option<Node>>> = entries
            .par_iter()
            .map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let metadata = entry.path().symlink_metadata()?;
                let file_type = metadata.file_type();

                let mut node = if file_type.is_dir() {
                    Node::directory(name, self.archive_dir(entry.path())?)
                } else if file_type.is_file() {
                    let (size, content) = self.archive_file(entry.path())?;
                    Node::file(name, size, content)
                } else if file_type.is_symlink() {
                    let target = fs::read_link(entry.path())?;
                    Node::symlink(name, target.to_string_lossy().to_string())
                } else {
                    warn!("Skipping unsupported entry {:?}", entry.path());
                    return Ok(None);
                };

                node.mode = permissions_of(&metadata);
                if let Ok(modified) = metadata.modified() {
                    node.mtime = DateTime::<Utc>::from(modified);
                }
                Ok(Some(node))
            })
            .collect();

        let mut children = Vec::with_capacity(nodes.len());
        for node in nodes {
            if let Some(node) = node? {
                children.push(node);
            }
        }

        self.counters.dirs.fetch_add(1, Ordering::Relaxed);
        let id = self.repo.store_tree(&Tree::new(children))?;
        debug!("Archived {:?} as tree {}", dir, &id[..8]);
        Ok(id)
    }

    fn archive_file(&self, path: &Path) -> Result<(u64, Vec<String>)> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut content = Vec::new();
        let mut size = 0u64;

        loop {
            let n = read_full(&mut file, &mut buf)?;
            if n == 0 {
                break;
            }
            let (id, created) = self.repo.store_object(&buf[..n])?;
            if created {
                self.counters.new_chunks.fetch_add(1, Ordering::Relaxed);
            }
            content.push(id);
            size += n as u64;
            if n < buf.len() {
                break;
            }
        }

        self.counters.files.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_read.fetch_add(size, Ordering::Relaxed);
        Ok((size, content))
    }
}

/// Fill `buf` as far as the reader allows
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RepositoryConfig;
    use tempfile::TempDir;

    fn setup() -> (Repository, TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Repository::init(temp_dir.path().join("repo"), RepositoryConfig::default()).unwrap();
        let source = temp_dir.path().join("source");
        fs::create_dir_all(source.join("sub/deeper")).unwrap();
        fs::write(source.join("a.txt"), b"alpha").unwrap();
        fs::write(source.join("sub/b.txt"), b"beta").unwrap();
        fs::write(source.join("sub/deeper/c.bin"), vec![7u8; 10_000]).unwrap();
        (repo, temp_dir, source)
    }

    #[test]
    fn test_archive_directory() {
        let (repo, _temp_dir, source) = setup();
        let (id, stats) = Archiver::new(&repo, &source)
            .with_hostname(Some("builder".into()))
            .with_tags(vec!["nightly".into()])
            .with_chunk_size(4096)
            .run()
            .unwrap();

        assert_eq!(stats.files, 3);
        assert_eq!(stats.dirs, 3);
        assert_eq!(stats.bytes_read, 5 + 4 + 10_000);

        let snapshot = repo.load_snapshot(&id).unwrap();
        assert_eq!(snapshot.hostname, "builder");
        assert_eq!(snapshot.tags, vec!["nightly".to_string()]);

        let deeper = repo.find_tree_directory(&snapshot.tree, "/sub/deeper").unwrap();
        let tree = repo.load_tree(&deeper).unwrap();
        let node = tree.find("c.bin").unwrap();
        assert!(node.is_file());
        assert_eq!(node.size, 10_000);
        assert_eq!(node.content.len(), 3);
    }

    #[test]
    fn test_identical_chunks_stored_once() {
        let (repo, _temp_dir, source) = setup();
        let (_, stats) = Archiver::new(&repo, &source).with_chunk_size(1000).run().unwrap();
        // c.bin is ten identical chunks
        assert_eq!(stats.new_chunks, 3);

        let (_, again) = Archiver::new(&repo, &source).with_chunk_size(1000).run().unwrap();
        assert_eq!(again.new_chunks, 0);
        assert_eq!(repo.list_snapshot_ids().unwrap().len(), 2);
    }

    #[test]
    fn test_source_must_be_directory() {
        let (repo, _temp_dir, source) = setup();
        let err = Archiver::new(&repo, source.join("a.txt")).run().unwrap_err();
        assert!(matches!(err, RestoreError::NotADirectory(_)));
    }

    #[test]
    fn test_exclusive_lock_released() {
        let (repo, _temp_dir, source) = setup();
        Archiver::new(&repo, &source).run().unwrap();
        assert!(crate::lock::existing_locks(&repo.root().join("locks")).unwrap().is_empty());
    }
}
