//! Error types for snaprestore
//!
//! Every fallible operation in the crate returns [`Result<T>`], whose error is
//! a [`RestoreError`]. Errors fall into four families:
//!
//! - **Validation** errors describe a malformed invocation and are raised
//!   before the repository is touched.
//! - **Resolution** errors occur while locating a snapshot or a subtree.
//! - **Item** errors (I/O failures, content mismatches) are raised for a
//!   single file or directory during restore or verify. The restore engine
//!   hands those to an error sink instead of aborting the walk.
//! - **Cancellation** is its own kind so callers can tell an interrupted run
//!   from a failed one.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in snaprestore
pub type Result<T> = std::result::Result<T, RestoreError>;

/// Main error type for all snaprestore operations
#[derive(Debug, Error)]
pub enum RestoreError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// No snapshot identifier was given
    #[error("no snapshot ID specified")]
    NoSnapshotId,

    /// More than one snapshot identifier was given
    #[error("more than one snapshot ID specified: [{}]", .0.join(" "))]
    MultipleSnapshotIds(Vec<String>),

    /// Restore target is empty
    #[error("please specify a directory to restore to (--target)")]
    MissingTarget,

    /// Both exclude and include patterns were supplied
    #[error("exclude and include patterns are mutually exclusive")]
    ConflictingFilters,

    /// A pattern failed to compile
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// The offending pattern text
        pattern: String,
        /// Compiler message
        reason: String,
    },

    /// A pattern file could not be read
    #[error("failed to read pattern file {path:?}: {source}")]
    PatternFile {
        /// Path of the pattern file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// No snapshot matched the identifier and filter
    #[error("no matching snapshot found for {0:?}")]
    SnapshotNotFound(String),

    /// A snapshot ID prefix matched several snapshots
    #[error("snapshot ID prefix {0:?} is ambiguous")]
    AmbiguousSnapshotId(String),

    /// Snapshot resolution failed
    #[error("failed to find snapshot: {0}")]
    FindSnapshot(#[source] Box<RestoreError>),

    /// Object not found in the repository
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// A subfolder does not exist inside the snapshot tree
    #[error("path {0:?} not found in snapshot")]
    PathNotFound(String),

    /// A subfolder names something that is not a directory
    #[error("path {0:?} is not a directory in snapshot")]
    NotADirectory(String),

    /// No repository location was configured
    #[error("please specify a repository with --repo or SNAPRESTORE_REPOSITORY")]
    MissingRepository,

    /// Repository does not exist
    #[error("Repository not initialized at path: {0:?}")]
    RepositoryNotInitialized(PathBuf),

    /// Repository already exists
    #[error("Repository already exists at path: {0:?}")]
    RepositoryAlreadyExists(PathBuf),

    /// Repository is held by a conflicting lock
    #[error("repository is already locked by {0}")]
    Locked(String),

    /// Hash mismatch while reading an object
    #[error("Hash mismatch - expected: {expected}, actual: {actual}")]
    HashMismatch {
        /// Expected hash value
        expected: String,
        /// Actual computed hash value
        actual: String,
    },

    /// Decompression errors
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Restored content differs from the snapshot
    #[error("content mismatch: {0}")]
    ContentMismatch(String),

    /// Node type that cannot be restored
    #[error("Unsupported node type for {0:?}")]
    UnsupportedNode(String),

    /// Per-item errors were recorded during restore or verify
    #[error("There were {count} errors")]
    TooManyErrors {
        /// Number of recorded item errors
        count: usize,
    },

    /// Operation interrupted by a cancellation request
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for RestoreError {
    fn from(err: bincode::error::DecodeError) -> Self {
        RestoreError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for RestoreError {
    fn from(err: bincode::error::EncodeError) -> Self {
        RestoreError::Bincode(err.to_string())
    }
}

impl RestoreError {
    /// Create a decompression error with a custom message
    pub fn decompression(msg: impl Into<String>) -> Self {
        RestoreError::Decompression(msg.into())
    }

    /// Create a content mismatch error with a custom message
    pub fn mismatch(msg: impl Into<String>) -> Self {
        RestoreError::ContentMismatch(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        RestoreError::Internal(msg.into())
    }

    /// Check if this error rejects the invocation itself
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RestoreError::NoSnapshotId
                | RestoreError::MultipleSnapshotIds(_)
                | RestoreError::MissingTarget
                | RestoreError::ConflictingFilters
                | RestoreError::InvalidPattern { .. }
                | RestoreError::PatternFile { .. }
        )
    }

    /// Check if this error was caused by cancellation
    pub fn is_cancellation(&self) -> bool {
        match self {
            RestoreError::Cancelled => true,
            RestoreError::FindSnapshot(inner) => inner.is_cancellation(),
            _ => false,
        }
    }

    /// Check if this error is the aggregated item-error summary
    pub fn is_fatal_summary(&self) -> bool {
        matches!(self, RestoreError::TooManyErrors { .. })
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            RestoreError::RepositoryNotInitialized(path) => {
                format!("Repository not initialized at {:?}. Run 'snaprestore init' first.", path)
            }
            RestoreError::Locked(holder) => {
                format!(
                    "Repository is locked by {}. Wait for the other operation to finish or use --no-lock.",
                    holder
                )
            }
            RestoreError::AmbiguousSnapshotId(prefix) => {
                format!("Snapshot ID prefix '{}' is ambiguous. Use a longer prefix.", prefix)
            }
            _ => self.to_string(),
        }
    }
}
