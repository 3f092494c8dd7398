//! The restore command as a single-pass state machine
//!
//! ```text
//! Validate → ResolveSnapshot → LoadIndex → LocateSubtree → BuildSelector
//!          → Restore → CheckErrors(after restore)
//!          → [Verify → CheckErrors(after verify)] → Report
//! ```
//!
//! Validation runs before the repository is opened. Every later failure is
//! fatal and immediate, except per-item failures during restore and verify:
//! those are counted by an [`ErrorAggregator`] and only escalate at the two
//! error checkpoints, where a non-zero count fails the command with
//! `There were N errors`. Verification is only attempted after a restore
//! that recorded no errors.
//!
//! The repository read lock is a guard held for the whole run, so it is
//! released on every exit path.
//!
//! The orchestrator talks to the repository through [`RestoreBackend`] and
//! to the engine through [`RestoreEngine`], so the sequencing can be driven
//! by test doubles.

use crate::aggregator::{ErrorAggregator, ItemErrorSink};
use crate::error::{Result, RestoreError};
use crate::lock::RepositoryLock;
use crate::pattern::{ExcludePatternOptions, IncludePatternOptions};
use crate::progress::{calculate_progress_interval, Progress, ProgressPrinter};
use crate::repository::Repository;
use crate::restorer::{RestoreEngine, RestoreStats, Restorer};
use crate::selection::{FilterMode, NodeSelector};
use crate::snapshot::{Snapshot, SnapshotFilter};
use humantime::format_duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Options shared by every command
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    /// Repository location, checked only when the repository is opened
    pub repo: Option<PathBuf>,
    /// Emit JSON lines instead of text
    pub json: bool,
    /// Suppress progress updates
    pub quiet: bool,
    /// Verbosity level
    pub verbose: u8,
    /// Skip repository locking
    pub no_lock: bool,
    /// Parallel file workers
    pub workers: usize,
}

impl GlobalOptions {
    /// Configured repository location
    pub fn repository(&self) -> Result<&Path> {
        self.repo.as_deref().ok_or(RestoreError::MissingRepository)
    }
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            repo: None,
            json: false,
            quiet: false,
            verbose: 0,
            no_lock: false,
            workers: num_cpus::get(),
        }
    }
}

/// Options of the restore command
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Exclude pattern sources
    pub exclude: ExcludePatternOptions,
    /// Include pattern sources
    pub include: IncludePatternOptions,
    /// Directory to restore into
    pub target: PathBuf,
    /// Restricts which snapshot `latest` resolves to
    pub filter: SnapshotFilter,
    /// Write all-zero chunks as holes
    pub sparse: bool,
    /// Verify file contents after restoring
    pub verify: bool,
}

/// Stage of a restore run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Checking the invocation
    Validate,
    /// Finding the snapshot
    ResolveSnapshot,
    /// Loading the repository index
    LoadIndex,
    /// Resolving the subfolder inside the snapshot
    LocateSubtree,
    /// Building the node selector
    BuildSelector,
    /// Writing files
    Restore,
    /// Gating on recorded item errors
    CheckErrors(ErrorCheckpoint),
    /// Comparing restored files with the snapshot
    Verify,
    /// Reporting the outcome
    Report,
}

/// Where the item-error gate runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCheckpoint {
    /// After the restore walk
    AfterRestore,
    /// After verification
    AfterVerify,
}

/// Everything an engine needs for one run
#[derive(Clone)]
pub struct EngineConfig {
    /// Node selector, `None` restores everything
    pub selector: Option<NodeSelector>,
    /// Receives per-item failures
    pub sink: Arc<dyn ItemErrorSink>,
    /// Progress counters
    pub progress: Arc<Progress>,
    /// Sparse file mode
    pub sparse: bool,
    /// Parallel file workers
    pub workers: usize,
    /// Cancellation signal
    pub cancel: CancellationToken,
}

/// Repository operations the restore command depends on
pub trait RestoreBackend {
    /// Take a read lock, held until the guard is dropped
    fn read_lock(&self) -> Result<Option<RepositoryLock>>;

    /// Resolve `spec` to a snapshot and subfolder
    fn find_snapshot(&self, filter: &SnapshotFilter, spec: &str) -> Result<(Snapshot, String)>;

    /// Load the repository index
    fn load_index(&self, progress: &dyn Fn(u64, u64)) -> Result<()>;

    /// Resolve `subfolder` below `tree` to a tree id
    fn find_tree_directory(&self, tree: &str, subfolder: &str) -> Result<String>;

    /// Build an engine restoring `tree`
    fn engine<'s>(&'s self, tree: &str, config: EngineConfig) -> Box<dyn RestoreEngine + 's>;
}

impl RestoreBackend for Repository {
    fn read_lock(&self) -> Result<Option<RepositoryLock>> {
        Repository::read_lock(self).map(Some)
    }

    fn find_snapshot(&self, filter: &SnapshotFilter, spec: &str) -> Result<(Snapshot, String)> {
        filter.find_latest(self, spec)
    }

    fn load_index(&self, progress: &dyn Fn(u64, u64)) -> Result<()> {
        Repository::load_index(self, progress).map(|_| ())
    }

    fn find_tree_directory(&self, tree: &str, subfolder: &str) -> Result<String> {
        Repository::find_tree_directory(self, tree, subfolder)
    }

    fn engine<'s>(&'s self, tree: &str, config: EngineConfig) -> Box<dyn RestoreEngine + 's> {
        Box::new(
            Restorer::new(self, tree, config.sink)
                .selector(config.selector)
                .sparse(config.sparse)
                .workers(config.workers)
                .progress(config.progress)
                .cancellation(config.cancel),
        )
    }
}

/// Successful result of a restore run
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    /// Restored snapshot id
    pub snapshot_id: String,
    /// Subfolder that was restored, empty for the whole snapshot
    pub subfolder: String,
    /// Restore target
    pub target: PathBuf,
    /// Restore counts
    pub stats: RestoreStats,
    /// Files verified, when verification ran
    pub files_verified: Option<usize>,
    /// Time spent verifying
    pub verify_duration: Option<Duration>,
    /// Total run time
    pub duration: Duration,
}

/// Ephemeral state of one restore invocation
#[derive(Debug)]
struct RestoreSession {
    phase: Phase,
    started: Instant,
    target: PathBuf,
    spec: String,
    snapshot: Option<Snapshot>,
    subfolder: String,
    tree: Option<String>,
}

impl RestoreSession {
    fn new(target: &Path, spec: &str) -> Self {
        Self {
            phase: Phase::Validate,
            started: Instant::now(),
            target: target.to_path_buf(),
            spec: spec.to_string(),
            snapshot: None,
            subfolder: String::new(),
            tree: None,
        }
    }

    fn enter(&mut self, phase: Phase, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            warn!(?phase, "restore cancelled");
            return Err(RestoreError::Cancelled);
        }
        debug!(from = ?self.phase, to = ?phase, "restore phase");
        self.phase = phase;
        Ok(())
    }
}

/// Check the invocation, returning the single snapshot spec
pub fn validate_args(args: &[String], opts: &RestoreOptions) -> Result<String> {
    let spec = match args {
        [] => return Err(RestoreError::NoSnapshotId),
        [spec] => spec.clone(),
        _ => return Err(RestoreError::MultipleSnapshotIds(args.to_vec())),
    };

    if opts.target.as_os_str().is_empty() {
        return Err(RestoreError::MissingTarget);
    }

    if !opts.exclude.is_empty() && !opts.include.is_empty() {
        return Err(RestoreError::ConflictingFilters);
    }

    Ok(spec)
}

/// Fail if any item errors were recorded
pub fn check_errors(aggregator: &ErrorAggregator, checkpoint: ErrorCheckpoint) -> Result<()> {
    let count = aggregator.count();
    if count > 0 {
        warn!(?checkpoint, count, "item errors recorded");
        return Err(RestoreError::TooManyErrors { count });
    }
    Ok(())
}

/// Run the restore command
///
/// `open` is only called after validation succeeded.
#[instrument(skip_all, fields(target = %opts.target.display()))]
pub fn run_restore<B, F>(
    opts: &RestoreOptions,
    gopts: &GlobalOptions,
    args: &[String],
    printer: Arc<dyn ProgressPrinter>,
    cancel: &CancellationToken,
    open: F,
) -> Result<RestoreOutcome>
where
    B: RestoreBackend,
    F: FnOnce(&GlobalOptions) -> Result<B>,
{
    let spec = validate_args(args, opts)?;
    let mode = FilterMode::from_options(&opts.exclude, &opts.include)?;
    let mut session = RestoreSession::new(&opts.target, &spec);
    debug!("restore {} to {:?}", session.spec, session.target);

    let backend = open(gopts)?;
    let _lock = if gopts.no_lock { None } else { backend.read_lock()? };

    session.enter(Phase::ResolveSnapshot, cancel)?;
    let (snapshot, subfolder) = backend.find_snapshot(&opts.filter, &spec).map_err(|e| {
        if e.is_cancellation() {
            e
        } else {
            RestoreError::FindSnapshot(Box::new(e))
        }
    })?;
    session.subfolder = subfolder;

    session.enter(Phase::LoadIndex, cancel)?;
    backend.load_index(&|done, total| printer.index_progress(done, total))?;

    session.enter(Phase::LocateSubtree, cancel)?;
    let tree = backend.find_tree_directory(&snapshot.tree, &session.subfolder)?;
    session.tree = Some(tree.clone());

    session.enter(Phase::BuildSelector, cancel)?;
    let selector = mode.selector();
    debug!(?mode, policy = ?mode.policy(), "selector built");

    session.enter(Phase::Restore, cancel)?;
    let aggregator = Arc::new(ErrorAggregator::new(printer.clone()));
    let progress = Arc::new(Progress::new(
        printer.clone(),
        calculate_progress_interval(!gopts.quiet, gopts.json),
    ));
    let engine = backend.engine(
        &tree,
        EngineConfig {
            selector,
            sink: aggregator.clone(),
            progress: progress.clone(),
            sparse: opts.sparse,
            workers: gopts.workers.max(1),
            cancel: cancel.clone(),
        },
    );

    printer.message(&format!("restoring {} to {}", snapshot, opts.target.display()));
    let stats = engine.restore_to(&opts.target)?;
    progress.finish();
    session.snapshot = Some(snapshot);

    session.enter(Phase::CheckErrors(ErrorCheckpoint::AfterRestore), cancel)?;
    check_errors(&aggregator, ErrorCheckpoint::AfterRestore)?;

    let mut files_verified = None;
    let mut verify_duration = None;
    if opts.verify {
        session.enter(Phase::Verify, cancel)?;
        printer.message(&format!("verifying files in {}", opts.target.display()));
        let t0 = Instant::now();
        let count = engine.verify_files(&opts.target)?;

        session.enter(Phase::CheckErrors(ErrorCheckpoint::AfterVerify), cancel)?;
        check_errors(&aggregator, ErrorCheckpoint::AfterVerify)?;

        let took = Duration::from_millis(t0.elapsed().as_millis() as u64);
        printer.message(&format!(
            "finished verifying {} files in {} (took {})",
            count,
            opts.target.display(),
            format_duration(took)
        ));
        files_verified = Some(count);
        verify_duration = Some(took);
    }

    session.enter(Phase::Report, cancel)?;
    let snapshot_id = session.snapshot.as_ref().map(|s| s.id.clone()).unwrap_or_default();
    info!(
        snapshot = %&snapshot_id[..snapshot_id.len().min(8)],
        files = stats.files_restored,
        "restore finished"
    );

    Ok(RestoreOutcome {
        snapshot_id,
        subfolder: session.subfolder,
        target: session.target,
        stats,
        files_verified,
        verify_duration,
        duration: session.started.elapsed(),
    })
}

/// Run the restore command against the repository named in `gopts`
pub fn restore_from_repository(
    opts: &RestoreOptions,
    gopts: &GlobalOptions,
    args: &[String],
    printer: Arc<dyn ProgressPrinter>,
    cancel: &CancellationToken,
) -> Result<RestoreOutcome> {
    run_restore(opts, gopts, args, printer, cancel, |g| Repository::open(g.repository()?))
}
