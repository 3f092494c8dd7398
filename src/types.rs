//! Core data types shared across snaprestore
//!
//! ## Overview
//!
//! - **Snapshot trees**: [`Tree`] and [`Node`] describe the directory
//!   hierarchy captured by a snapshot. Trees are stored as content-addressed
//!   objects; directory nodes point at their child tree by id.
//! - **Selection**: [`SelectionDecision`] is the per-node verdict returned by
//!   a node selector during the restore walk.
//! - **Repository**: [`RepositoryConfig`] is persisted as `config.json` at
//!   the repository root.
//!
//! ## Examples
//!
//! ```rust
//! use snaprestore::types::{Node, NodeType, SelectionDecision};
//!
//! let dir = Node::directory("src", "0".repeat(64));
//! assert!(dir.is_dir());
//! assert_eq!(dir.node_type, NodeType::Dir);
//!
//! let verdict = SelectionDecision::default();
//! assert!(!verdict.selected_for_restore && !verdict.child_may_be_selected);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of entry in a snapshot tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Directory with a child tree
    Dir,
    /// Regular file made of content chunks
    File,
    /// Symbolic link
    Symlink,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Dir => write!(f, "dir"),
            NodeType::File => write!(f, "file"),
            NodeType::Symlink => write!(f, "symlink"),
        }
    }
}

/// A single entry in a snapshot tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    /// Entry name (one path component)
    pub name: String,
    /// Entry kind
    pub node_type: NodeType,
    /// Unix permission bits
    pub mode: u32,
    /// Last modification time
    pub mtime: DateTime<Utc>,
    /// Size in bytes (files only)
    pub size: u64,
    /// Ordered chunk ids making up the file content
    pub content: Vec<String>,
    /// Child tree id (directories only)
    pub subtree: Option<String>,
    /// Link target (symlinks only)
    pub link_target: Option<String>,
}

impl Node {
    /// Create a directory node pointing at `subtree`
    pub fn directory(name: impl Into<String>, subtree: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_type: NodeType::Dir,
            mode: 0o755,
            mtime: Utc::now(),
            size: 0,
            content: Vec::new(),
            subtree: Some(subtree.into()),
            link_target: None,
        }
    }

    /// Create a file node from its chunk ids
    pub fn file(name: impl Into<String>, size: u64, content: Vec<String>) -> Self {
        Self {
            name: name.into(),
            node_type: NodeType::File,
            mode: 0o644,
            mtime: Utc::now(),
            size,
            content,
            subtree: None,
            link_target: None,
        }
    }

    /// Create a symlink node
    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_type: NodeType::Symlink,
            mode: 0o777,
            mtime: Utc::now(),
            size: 0,
            content: Vec::new(),
            subtree: None,
            link_target: Some(target.into()),
        }
    }

    /// Whether this node is a directory
    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Dir
    }

    /// Whether this node is a regular file
    pub fn is_file(&self) -> bool {
        self.node_type == NodeType::File
    }
}

/// A directory listing in a snapshot, sorted by name
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tree {
    /// Entries of this directory
    pub nodes: Vec<Node>,
}

impl Tree {
    /// Build a tree, sorting entries by name
    pub fn new(mut nodes: Vec<Node>) -> Self {
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Self { nodes }
    }

    /// Look up an entry by name
    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes
            .binary_search_by(|n| n.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.nodes[idx])
    }
}

/// Verdict of a node selector for one tree entry
///
/// The zero value (`Default`) selects nothing and prunes traversal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionDecision {
    /// Materialize this node in the target
    pub selected_for_restore: bool,
    /// Keep walking into this node's children even if it is not selected
    pub child_may_be_selected: bool,
}

impl SelectionDecision {
    /// Decision used when no filtering is active
    pub const RESTORE_ALL: SelectionDecision = SelectionDecision {
        selected_for_restore: true,
        child_may_be_selected: true,
    };

    /// Construct a decision
    pub fn new(selected_for_restore: bool, child_may_be_selected: bool) -> Self {
        Self {
            selected_for_restore,
            child_may_be_selected,
        }
    }
}

/// Repository configuration persisted as `config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// On-disk format version
    pub format_version: u32,
    /// Program version that created the repository
    pub program_version: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Compression strategy name ("none" or "fast")
    pub compression: String,
    /// Chunk size used when archiving files
    pub chunk_size: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            format_version: 1,
            program_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
            compression: "fast".to_string(),
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
        }
    }
}
