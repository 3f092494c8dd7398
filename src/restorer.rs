//! Restore and verify engine
//!
//! The engine walks a snapshot tree, asks the node selector about every
//! entry, and materializes the selected ones below a target directory.
//!
//! ## Phases of a restore
//!
//! 1. **Plan**: walk the tree depth-first, collecting directories, symlinks
//!    and files to restore. Unselected directories are still entered when
//!    the selector says a child may be selected.
//! 2. **Directories and symlinks** are created in walk order.
//! 3. **Files** are written in parallel on a `rayon` pool. With sparse mode,
//!    all-zero chunks are skipped with a seek and the file is extended to its
//!    full size at the end.
//! 4. **Directory metadata** is applied deepest first, after every file
//!    below it has been written.
//!
//! Failures of a single entry are reported to the [`ItemErrorSink`] and the
//! walk continues.
//! Cancellation is checked between entries and surfaces as
//! [`RestoreError::Cancelled`].

use crate::aggregator::ItemErrorSink;
use crate::error::{Result, RestoreError};
use crate::progress::Progress;
use crate::repository::Repository;
use crate::selection::{restore_everything, NodeSelector};
use crate::types::{Node, NodeType};
use crate::utils::{self, is_zero, join_tree_path};
use filetime::FileTime;
use rayon::prelude::*;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

/// Operations the orchestrator needs from a restore engine
pub trait RestoreEngine {
    /// Restore the selected entries below `target`
    fn restore_to(&self, target: &Path) -> Result<RestoreStats>;

    /// Verify restored files against the snapshot, returning how many were checked
    fn verify_files(&self, target: &Path) -> Result<usize>;
}

/// Counts from one restore run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreStats {
    /// Files written, including those that failed midway
    pub files_restored: usize,
    /// Directories created
    pub dirs_restored: usize,
    /// Symlinks created
    pub symlinks_restored: usize,
    /// Bytes of file content handled
    pub bytes_written: u64,
}

#[derive(Debug, Clone)]
struct PlannedItem {
    node: Node,
    location: String,
    dest: PathBuf,
}

#[derive(Debug, Default)]
struct Plan {
    dirs: Vec<PlannedItem>,
    symlinks: Vec<PlannedItem>,
    files: Vec<PlannedItem>,
}

/// Restores one snapshot tree from a repository
pub struct Restorer<'a> {
    repo: &'a Repository,
    tree: String,
    sparse: bool,
    workers: usize,
    selector: NodeSelector,
    sink: Arc<dyn ItemErrorSink>,
    progress: Option<Arc<Progress>>,
    cancel: CancellationToken,
}

impl<'a> Restorer<'a> {
    /// Create an engine restoring `tree` from `repo`
    ///
    /// Without a selector every node is restored.
    pub fn new(repo: &'a Repository, tree: impl Into<String>, sink: Arc<dyn ItemErrorSink>) -> Self {
        Self {
            repo,
            tree: tree.into(),
            sparse: false,
            workers: num_cpus::get(),
            selector: restore_everything(),
            sink,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Write all-zero chunks as holes
    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    /// Number of parallel file writers
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Restrict the restore to entries accepted by `selector`
    pub fn selector(mut self, selector: Option<NodeSelector>) -> Self {
        self.selector = selector.unwrap_or_else(restore_everything);
        self
    }

    /// Report file and byte counts to `progress`
    pub fn progress(mut self, progress: Arc<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Stop early when `cancel` fires
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RestoreError::Cancelled);
        }
        Ok(())
    }

    /// Hand an item failure to the sink; only cancellation stops the walk
    fn report(&self, location: &str, err: RestoreError) -> Result<()> {
        if err.is_cancellation() {
            return Err(err);
        }
        self.sink.error(location, &err);
        Ok(())
    }

    fn plan(&self, target: &Path) -> Result<Plan> {
        let mut plan = Plan::default();
        self.plan_tree(&self.tree, "/", target, &mut plan)?;
        debug!(
            "Planned {} dirs, {} files, {} symlinks",
            plan.dirs.len(),
            plan.files.len(),
            plan.symlinks.len()
        );
        Ok(plan)
    }

    fn plan_tree(&self, tree_id: &str, parent: &str, dest_dir: &Path, plan: &mut Plan) -> Result<()> {
        let tree = match self.repo.load_tree(tree_id) {
            Ok(tree) => tree,
            Err(e) => return self.report(parent, e),
        };

        for node in tree.nodes {
            self.check_cancelled()?;

            let location = join_tree_path(parent, &node.name);
            if !is_valid_name(&node.name) {
                self.report(&location, RestoreError::internal(format!("invalid node name {:?}", node.name)))?;
                continue;
            }

            let decision = (self.selector)(&node, &location);
            trace!(?decision, "{}", location);
            let dest = dest_dir.join(&node.name);

            match node.node_type {
                NodeType::Dir => {
                    let subtree = node.subtree.clone();
                    if decision.selected_for_restore {
                        plan.dirs.push(PlannedItem {
                            node,
                            location: location.clone(),
                            dest: dest.clone(),
                        });
                    }
                    if decision.selected_for_restore || decision.child_may_be_selected {
                        match subtree {
                            Some(subtree) => self.plan_tree(&subtree, &location, &dest, plan)?,
                            None => self.report(
                                &location,
                                RestoreError::internal("directory node without subtree"),
                            )?,
                        }
                    }
                }
                NodeType::File if decision.selected_for_restore => {
                    plan.files.push(PlannedItem { node, location, dest });
                }
                NodeType::Symlink if decision.selected_for_restore => {
                    plan.symlinks.push(PlannedItem { node, location, dest });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn restore_file(&self, item: &PlannedItem) -> Result<u64> {
        if let Some(parent) = item.dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&item.dest)?;

        let mut written = 0u64;
        for (idx, chunk_id) in item.node.content.iter().enumerate() {
            self.check_cancelled()?;
            let chunk = self.repo.load_object(chunk_id)?;
            if self.sparse && is_zero(&chunk) {
                file.seek(SeekFrom::Current(chunk.len() as i64))?;
            } else {
                file.write_all(&chunk)?;
            }
            written += chunk.len() as u64;
            if let Some(progress) = &self.progress {
                progress.add_progress(chunk.len() as u64, idx + 1 == item.node.content.len());
            }
        }
        if item.node.content.is_empty() {
            if let Some(progress) = &self.progress {
                progress.add_progress(0, true);
            }
        }

        if written != item.node.size {
            return Err(RestoreError::mismatch(format!(
                "wrote {} bytes, snapshot records {}",
                written, item.node.size
            )));
        }
        // Materializes trailing holes left by sparse writes
        file.set_len(written)?;
        file.flush()?;
        drop(file);

        utils::set_permissions(&item.dest, item.node.mode)?;
        filetime::set_file_mtime(&item.dest, to_file_time(&item.node))?;
        trace!("Restored {} ({} bytes)", item.location, written);
        Ok(written)
    }

    fn restore_symlink(&self, item: &PlannedItem) -> Result<()> {
        let target = item
            .node
            .link_target
            .as_deref()
            .ok_or_else(|| RestoreError::UnsupportedNode(item.location.clone()))?;
        if let Some(parent) = item.dest.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(&item.dest) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        utils::create_symlink(Path::new(target), &item.dest)
    }

    fn verify_file(&self, item: &PlannedItem) -> Result<()> {
        let metadata = fs::symlink_metadata(&item.dest)?;
        if !metadata.is_file() {
            return Err(RestoreError::mismatch("not a regular file"));
        }
        if metadata.len() != item.node.size {
            return Err(RestoreError::mismatch(format!(
                "size {} does not match snapshot size {}",
                metadata.len(),
                item.node.size
            )));
        }

        let mut file = File::open(&item.dest)?;
        let mut offset = 0u64;
        let mut buf = Vec::new();
        for chunk_id in &item.node.content {
            self.check_cancelled()?;
            let expected = self.repo.load_object(chunk_id)?;
            buf.resize(expected.len(), 0);
            file.read_exact(&mut buf)?;
            if buf != expected {
                return Err(RestoreError::mismatch(format!(
                    "content differs in chunk at offset {}",
                    offset
                )));
            }
            offset += expected.len() as u64;
        }
        Ok(())
    }

    fn pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| RestoreError::internal(format!("failed to build worker pool: {}", e)))
    }
}

impl RestoreEngine for Restorer<'_> {
    #[instrument(skip(self), fields(tree = %&self.tree[..self.tree.len().min(8)]))]
    fn restore_to(&self, target: &Path) -> Result<RestoreStats> {
        fs::create_dir_all(target)?;
        let plan = self.plan(target)?;
        let mut stats = RestoreStats::default();

        for item in &plan.dirs {
            self.check_cancelled()?;
            match fs::create_dir_all(&item.dest) {
                Ok(()) => stats.dirs_restored += 1,
                Err(e) => self.report(&item.location, e.into())?,
            }
        }

        for item in &plan.symlinks {
            self.check_cancelled()?;
            match self.restore_symlink(item) {
                Ok(()) => stats.symlinks_restored += 1,
                Err(e) => self.report(&item.location, e)?,
            }
        }

        if let Some(progress) = &self.progress {
            for item in &plan.files {
                progress.add_file(item.node.size);
            }
        }

        let results: Vec<Result<u64>> = self.pool()?.install(|| {
            plan.files
                .par_iter()
                .map(|item| -> Result<u64> {
                    self.check_cancelled()?;
                    match self.restore_file(item) {
                        Ok(bytes) => Ok(bytes),
                        Err(e) => self.report(&item.location, e).map(|_| 0),
                    }
                })
                .collect()
        });
        for result in results {
            stats.bytes_written += result?;
            stats.files_restored += 1;
        }

        // Deepest first so read-only modes never block writes below them
        let mut dirs: Vec<&PlannedItem> = plan.dirs.iter().collect();
        dirs.sort_by(|a, b| b.dest.components().count().cmp(&a.dest.components().count()));
        for item in dirs {
            let applied = utils::set_permissions(&item.dest, item.node.mode)
                .and_then(|_| Ok(filetime::set_file_mtime(&item.dest, to_file_time(&item.node))?));
            if let Err(e) = applied {
                self.report(&item.location, e)?;
            }
        }

        self.check_cancelled()?;
        info!(
            "Restored {} files, {} directories, {} symlinks to {:?}",
            stats.files_restored, stats.dirs_restored, stats.symlinks_restored, target
        );
        Ok(stats)
    }

    #[instrument(skip(self), fields(tree = %&self.tree[..self.tree.len().min(8)]))]
    fn verify_files(&self, target: &Path) -> Result<usize> {
        let plan = self.plan(target)?;

        let results: Vec<Result<()>> = self.pool()?.install(|| {
            plan.files
                .par_iter()
                .map(|item| -> Result<()> {
                    self.check_cancelled()?;
                    match self.verify_file(item) {
                        Ok(()) => Ok(()),
                        Err(e) => self.report(&item.location, e),
                    }
                })
                .collect()
        });
        for result in results {
            result?;
        }

        info!("Verified {} files in {:?}", plan.files.len(), target);
        Ok(plan.files.len())
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\\')
}

fn to_file_time(node: &Node) -> FileTime {
    FileTime::from_unix_time(node.mtime.timestamp(), node.mtime.timestamp_subsec_nanos())
}
