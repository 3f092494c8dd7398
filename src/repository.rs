//! Content-addressed repository backing snapshots
//!
//! ## Architecture
//!
//! ```text
//! repository/
//! ├── config.json           # Repository configuration
//! ├── snapshots/            # One JSON record per snapshot
//! │   └── <snapshot_id>.json
//! ├── objects/              # Content-addressed objects (sharded)
//! │   └── <prefix>/         # First 2 chars of the id
//! │       └── <suffix>      # Remaining id chars
//! └── locks/                # Active lock records
//! ```
//!
//! Objects are file chunks and encoded trees. Their id is the SHA-256 of the
//! uncompressed payload, and every load re-hashes the payload so corruption
//! surfaces as [`RestoreError::HashMismatch`].
//!
//! ## Index
//!
//! [`Repository::load_index`] scans `objects/` once into an in-memory
//! `DashMap`. While an index is loaded, lookups for unknown ids fail without
//! touching the filesystem.
//!
//! ## Thread Safety
//!
//! `Repository` is `Sync`: the index is a `DashMap` and the compression
//! engine keeps atomic counters, so backup and restore workers store and read
//! objects from many threads at once.

use crate::compression::{CompressionEngine, CompressionStrategy};
use crate::error::{Result, RestoreError};
use crate::lock::{LockKind, RepositoryLock};
use crate::snapshot::Snapshot;
use crate::types::{RepositoryConfig, Tree};
use crate::utils::{atomic_write, hash_data};
use dashmap::DashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, trace};

const CONFIG_FILE: &str = "config.json";
const SNAPSHOTS_DIR: &str = "snapshots";
const OBJECTS_DIR: &str = "objects";
const LOCKS_DIR: &str = "locks";

/// Index entry for one stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Size of the object on disk, header included
    pub stored_size: u64,
}

/// A snapshot repository on the local filesystem
pub struct Repository {
    root: PathBuf,
    config: RepositoryConfig,
    compression: CompressionEngine,
    index: Arc<DashMap<String, IndexEntry>>,
    index_loaded: AtomicBool,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("indexed_objects", &self.index.len())
            .finish()
    }
}

impl Repository {
    /// Create a new repository at `root`
    ///
    /// Fails with [`RestoreError::RepositoryAlreadyExists`] if a repository
    /// config is already present.
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub fn init(root: impl AsRef<Path>, config: RepositoryConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if root.join(CONFIG_FILE).exists() {
            return Err(RestoreError::RepositoryAlreadyExists(root));
        }

        let strategy: CompressionStrategy = config.compression.parse()?;
        if config.chunk_size == 0 {
            return Err(RestoreError::InvalidConfiguration("chunk size must be positive".into()));
        }

        fs::create_dir_all(root.join(SNAPSHOTS_DIR))?;
        fs::create_dir_all(root.join(OBJECTS_DIR))?;
        fs::create_dir_all(root.join(LOCKS_DIR))?;
        atomic_write(
            &root.join(CONFIG_FILE),
            serde_json::to_string_pretty(&config)?.as_bytes(),
        )?;

        info!("Initialized repository at {:?}", root);

        Ok(Self {
            root,
            config,
            compression: CompressionEngine::new(strategy),
            index: Arc::new(DashMap::new()),
            index_loaded: AtomicBool::new(false),
        })
    }

    /// Open an existing repository
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(RestoreError::RepositoryNotInitialized(root));
        }

        let config: RepositoryConfig = serde_json::from_str(&fs::read_to_string(&config_path)?)?;
        let strategy: CompressionStrategy = config.compression.parse()?;

        debug!("Opened repository at {:?} (format {})", root, config.format_version);

        Ok(Self {
            root,
            config,
            compression: CompressionEngine::new(strategy),
            index: Arc::new(DashMap::new()),
            index_loaded: AtomicBool::new(false),
        })
    }

    /// Repository root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Repository configuration
    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Acquire a lock on the repository
    pub fn lock(&self, kind: LockKind) -> Result<RepositoryLock> {
        RepositoryLock::acquire(&self.root.join(LOCKS_DIR), kind)
    }

    /// Acquire a shared lock for reading
    pub fn read_lock(&self) -> Result<RepositoryLock> {
        self.lock(LockKind::Shared)
    }

    fn object_path(&self, id: &str) -> Result<PathBuf> {
        if id.len() < 3 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RestoreError::ObjectNotFound(id.to_string()));
        }
        let (prefix, suffix) = id.split_at(2);
        Ok(self.root.join(OBJECTS_DIR).join(prefix).join(suffix))
    }

    /// Store a payload, returning its id and whether it was newly written
    pub fn store_object(&self, content: &[u8]) -> Result<(String, bool)> {
        let id = hash_data(content);
        if self.object_exists(&id)? {
            trace!("Object {} already stored", &id[..8]);
            return Ok((id, false));
        }

        let encoded = self.compression.compress(content)?;
        let path = self.object_path(&id)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        atomic_write(&path, &encoded)?;

        self.index.insert(
            id.clone(),
            IndexEntry {
                stored_size: encoded.len() as u64,
            },
        );
        trace!("Stored object {} ({} bytes)", &id[..8], encoded.len());
        Ok((id, true))
    }

    /// Load and verify a payload by id
    pub fn load_object(&self, id: &str) -> Result<Vec<u8>> {
        if self.index_loaded.load(Ordering::Acquire) && !self.index.contains_key(id) {
            return Err(RestoreError::ObjectNotFound(id.to_string()));
        }

        let path = self.object_path(id)?;
        let encoded = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RestoreError::ObjectNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let content = self.compression.decompress(&encoded)?;
        let actual = hash_data(&content);
        if actual != id {
            return Err(RestoreError::HashMismatch {
                expected: id.to_string(),
                actual,
            });
        }
        Ok(content)
    }

    /// Check whether an object exists
    pub fn object_exists(&self, id: &str) -> Result<bool> {
        if self.index.contains_key(id) {
            return Ok(true);
        }
        Ok(self.object_path(id)?.exists())
    }

    /// Encode and store a tree, returning its id
    pub fn store_tree(&self, tree: &Tree) -> Result<String> {
        let bytes = bincode::serde::encode_to_vec(tree, bincode::config::standard())?;
        Ok(self.store_object(&bytes)?.0)
    }

    /// Load a tree by id
    pub fn load_tree(&self, id: &str) -> Result<Tree> {
        let bytes = self.load_object(id)?;
        let (tree, _) = bincode::serde::decode_from_slice::<Tree, _>(&bytes, bincode::config::standard())?;
        Ok(tree)
    }

    /// Persist a snapshot record, returning its id
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<String> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        let id = hash_data(&json);
        atomic_write(&self.root.join(SNAPSHOTS_DIR).join(format!("{}.json", id)), &json)?;
        info!("Saved snapshot {}", &id[..8]);
        Ok(id)
    }

    /// Load a snapshot record by full id
    pub fn load_snapshot(&self, id: &str) -> Result<Snapshot> {
        let path = self.root.join(SNAPSHOTS_DIR).join(format!("{}.json", id));
        let json = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RestoreError::SnapshotNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut snapshot: Snapshot = serde_json::from_slice(&json)?;
        snapshot.id = id.to_string();
        Ok(snapshot)
    }

    /// List ids of all stored snapshots
    pub fn list_snapshot_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join(SNAPSHOTS_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load every snapshot, oldest first
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = self
            .list_snapshot_ids()?
            .iter()
            .map(|id| self.load_snapshot(id))
            .collect::<Result<Vec<_>>>()?;
        snapshots.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));
        Ok(snapshots)
    }

    /// Scan stored objects into the in-memory index
    ///
    /// `progress` is called with `(done, total)` after each shard directory.
    /// Returns the number of indexed objects.
    #[instrument(skip(self, progress))]
    pub fn load_index<F>(&self, progress: F) -> Result<usize>
    where
        F: Fn(u64, u64),
    {
        let objects_dir = self.root.join(OBJECTS_DIR);
        let mut shards = fs::read_dir(&objects_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect::<Vec<_>>();
        shards.sort();

        let total = shards.len() as u64;
        progress(0, total);

        for (done, shard) in shards.iter().enumerate() {
            let prefix = shard
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            for entry in walkdir::WalkDir::new(shard).min_depth(1).max_depth(1) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                // Skip temp files from interrupted writes
                if name.starts_with('.') {
                    continue;
                }
                self.index.insert(
                    format!("{}{}", prefix, name),
                    IndexEntry {
                        stored_size: entry.metadata()?.len(),
                    },
                );
            }
            progress(done as u64 + 1, total);
        }

        self.index_loaded.store(true, Ordering::Release);
        info!("Loaded index with {} objects", self.index.len());
        Ok(self.index.len())
    }

    /// Whether [`load_index`](Self::load_index) has completed
    pub fn is_index_loaded(&self) -> bool {
        self.index_loaded.load(Ordering::Acquire)
    }

    /// Resolve `subfolder` inside the tree `tree_id` to the id of its tree
    ///
    /// An empty subfolder or `/` resolves to `tree_id` itself.
    #[instrument(skip(self))]
    pub fn find_tree_directory(&self, tree_id: &str, subfolder: &str) -> Result<String> {
        let mut current = tree_id.to_string();
        for component in subfolder.split('/').filter(|c| !c.is_empty() && *c != ".") {
            let tree = self.load_tree(&current)?;
            let node = tree
                .find(component)
                .ok_or_else(|| RestoreError::PathNotFound(subfolder.to_string()))?;
            if !node.is_dir() {
                return Err(RestoreError::NotADirectory(subfolder.to_string()));
            }
            current = node
                .subtree
                .clone()
                .ok_or_else(|| RestoreError::internal(format!("directory {:?} has no subtree", component)))?;
        }
        debug!("Resolved subfolder {:?} to tree {}", subfolder, &current[..current.len().min(8)]);
        Ok(current)
    }
}
