//! # snaprestore - Restore files from content-addressed snapshots
//!
//! A repository holds snapshots of directory trees. Each snapshot names a
//! root tree; trees list nodes (directories, files, symlinks) and files are
//! sequences of content-addressed chunks. `snaprestore` materializes all or
//! part of a snapshot into a target directory and can verify the result.
//!
//! ## Overview
//!
//! A restore run goes through these stages:
//!
//! 1. Validate the invocation: exactly one snapshot id, a target directory,
//!    and at most one of exclude or include patterns
//! 2. Resolve the snapshot (`latest`, a full id or a unique prefix), with an
//!    optional `:subfolder` suffix
//! 3. Load the repository index and locate the subfolder's tree
//! 4. Build a node selector from the patterns
//! 5. Restore, counting per-item failures instead of aborting
//! 6. Fail with `There were N errors` if anything failed, otherwise
//!    optionally verify and gate on errors once more
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use snaprestore::{
//!     restore_from_repository, GlobalOptions, RestoreOptions, TextProgress,
//! };
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let gopts = GlobalOptions {
//!     repo: Some(PathBuf::from("/srv/backups")),
//!     ..Default::default()
//! };
//! let mut opts = RestoreOptions {
//!     target: PathBuf::from("/tmp/restore"),
//!     verify: true,
//!     ..Default::default()
//! };
//! opts.include.includes = vec!["/home/*/Documents".to_string()];
//!
//! let outcome = restore_from_repository(
//!     &opts,
//!     &gopts,
//!     &["latest".to_string()],
//!     Arc::new(TextProgress::new(true)),
//!     &CancellationToken::new(),
//! )?;
//! println!("Restored {} files", outcome.stats.files_restored);
//! # Ok(())
//! # }
//! ```
//!
//! ## Selection
//!
//! Exclude patterns reject a path and everything below it. Include patterns
//! select a path and everything below it, and keep the walk descending into
//! directories that could still contain a match. See [`selection`] for the
//! exact composition rules.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, RestoreError>`. Per-item failures during
//! restore and verify go to an [`ItemErrorSink`] instead; the
//! [`ErrorAggregator`] counts them and the orchestrator turns a non-zero
//! count into [`RestoreError::TooManyErrors`].
//!
//! ## Module Organization
//!
//! - [`orchestrator`]: The restore command state machine
//! - [`selection`]: Node selectors built from patterns
//! - [`pattern`]: Pattern sources and glob matching
//! - [`aggregator`]: Per-item error counting
//! - [`restorer`]: Restore and verify engine
//! - [`progress`]: Text and JSON progress printers
//! - [`repository`]: Content-addressed object and snapshot store
//! - [`snapshot`]: Snapshot records and resolution
//! - [`backup`]: Archiving a directory into a snapshot
//! - [`lock`]: Repository lock files
//! - [`compression`]: Object compression
//! - [`types`]: Common types and data structures
//! - [`utils`]: Hashing and filesystem helpers
//! - [`error`]: Error types and handling

// Public API modules
pub mod aggregator;
pub mod backup;
pub mod compression;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod pattern;
pub mod progress;
pub mod repository;
pub mod restorer;
pub mod selection;
pub mod snapshot;
pub mod types;
pub mod utils;

/// Default size of file chunks written by [`backup::Archiver`]
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

// Re-export main types for convenience
pub use aggregator::{ErrorAggregator, ItemErrorSink};
pub use backup::{Archiver, BackupStats};
pub use compression::{CompressionEngine, CompressionStrategy};
pub use error::{RestoreError, Result};
pub use lock::{LockKind, RepositoryLock};
pub use orchestrator::{
    check_errors, restore_from_repository, run_restore, validate_args, EngineConfig, ErrorCheckpoint,
    GlobalOptions, Phase, RestoreBackend, RestoreOptions, RestoreOutcome,
};
pub use pattern::{ExcludePatternOptions, IncludePatternOptions, PatternSet};
pub use progress::{JsonProgress, Progress, ProgressPrinter, ProgressState, TextProgress};
pub use repository::Repository;
pub use restorer::{RestoreEngine, RestoreStats, Restorer};
pub use selection::{CompositionPolicy, FilterMode, NodeSelector};
pub use snapshot::{Snapshot, SnapshotFilter};
pub use types::*;
pub use utils::format_bytes;
