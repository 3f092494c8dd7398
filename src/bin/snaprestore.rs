//! # snaprestore CLI
//!
//! Command-line front end for snapshot repositories.
//!
//! ## Usage
//! ```bash
//! # Create a repository
//! snaprestore -r /srv/backups init
//!
//! # Store a directory as a snapshot
//! snaprestore -r /srv/backups backup ~/projects --tag nightly
//!
//! # List snapshots
//! snaprestore -r /srv/backups snapshots
//!
//! # Restore part of the newest snapshot and verify it
//! snaprestore -r /srv/backups restore latest:/home/me --target /tmp/out \
//!     --include '/home/me/projects/*' --verify
//! ```
//!
//! Ctrl-C cancels the running command; the process then exits with
//! status 130.

use anyhow::anyhow;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use colored::*;
use serde::Serialize;
use snaprestore::{
    restore_from_repository, Archiver, CompressionStrategy, ExcludePatternOptions, GlobalOptions,
    IncludePatternOptions, JsonProgress, ProgressPrinter, Repository, RepositoryConfig, RestoreError,
    RestoreOptions, Result, SnapshotFilter, TextProgress,
};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Exit status after Ctrl-C
const EXIT_CANCELLED: i32 = 130;

/// Restore files from content-addressed snapshots
#[derive(Parser)]
#[command(name = "snaprestore")]
#[command(version)]
#[command(about = "Back up directories as snapshots and restore them")]
#[command(long_about = None)]
struct Cli {
    /// Repository location
    #[arg(short, long, global = true, env = "SNAPRESTORE_REPOSITORY")]
    repo: Option<PathBuf>,

    /// Print JSON lines instead of human readable output
    #[arg(long, global = true)]
    json: bool,

    /// Do not show progress
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Do not lock the repository
    #[arg(long, global = true)]
    no_lock: bool,

    /// Number of parallel file workers
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new repository
    Init {
        /// Compression for stored objects
        #[arg(long, value_enum, default_value = "fast")]
        compression: CompressionMode,

        /// Chunk size in bytes for archived files
        #[arg(long, default_value_t = snaprestore::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Store a directory as a new snapshot
    Backup {
        /// Directory to archive
        source: PathBuf,

        /// Host name to record instead of the local one
        #[arg(long)]
        host: Option<String>,

        /// Tag to attach (can be repeated)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// List snapshots
    Snapshots,

    /// Restore a snapshot into a directory
    Restore(RestoreArgs),
}

#[derive(clap::Args)]
struct RestoreArgs {
    /// Snapshot id, id prefix or `latest`, optionally followed by `:subfolder`
    snapshot: Vec<String>,

    /// Directory to restore to
    #[arg(short, long)]
    target: Option<PathBuf>,

    /// Exclude a pattern (can be repeated)
    #[arg(short, long = "exclude")]
    exclude: Vec<String>,

    /// Like --exclude but ignores case
    #[arg(long = "iexclude")]
    iexclude: Vec<String>,

    /// Read exclude patterns from a file (can be repeated)
    #[arg(long = "exclude-file")]
    exclude_file: Vec<PathBuf>,

    /// Like --exclude-file but ignores case
    #[arg(long = "iexclude-file")]
    iexclude_file: Vec<PathBuf>,

    /// Include a pattern (can be repeated)
    #[arg(short, long = "include")]
    include: Vec<String>,

    /// Like --include but ignores case
    #[arg(long = "iinclude")]
    iinclude: Vec<String>,

    /// Read include patterns from a file (can be repeated)
    #[arg(long = "include-file")]
    include_file: Vec<PathBuf>,

    /// Like --include-file but ignores case
    #[arg(long = "iinclude-file")]
    iinclude_file: Vec<PathBuf>,

    /// Only consider snapshots from this host for `latest` (can be repeated)
    #[arg(short = 'H', long = "host")]
    hosts: Vec<String>,

    /// Only consider snapshots including this path for `latest` (can be repeated)
    #[arg(long = "path")]
    paths: Vec<String>,

    /// Only consider snapshots with these comma separated tags for `latest` (can be repeated)
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Restore files as sparse files
    #[arg(long)]
    sparse: bool,

    /// Verify restored files
    #[arg(long)]
    verify: bool,
}

/// Compression modes offered on the command line
#[derive(Clone, Copy, ValueEnum)]
enum CompressionMode {
    None,
    Fast,
}

impl From<CompressionMode> for CompressionStrategy {
    fn from(mode: CompressionMode) -> Self {
        match mode {
            CompressionMode::None => CompressionStrategy::None,
            CompressionMode::Fast => CompressionStrategy::Fast,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() || cli.json {
        colored::control::set_override(false);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}: failed to start runtime: {}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(cli));
    std::process::exit(code);
}

/// Log to stderr; `RUST_LOG` overrides the verbosity flags
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Run the command on a blocking thread while watching for Ctrl-C
async fn run(cli: Cli) -> i32 {
    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            watcher.cancel();
        }
    });

    let token = cancel.clone();
    let result = tokio::task::spawn_blocking(move || dispatch(cli, &token))
        .await
        .map_err(|e| anyhow!("command panicked: {}", e))
        .and_then(|r| r);

    match result {
        Ok(()) => 0,
        Err(e) => {
            let cancelled = cancel.is_cancelled()
                || e.downcast_ref::<RestoreError>().is_some_and(RestoreError::is_cancellation);
            if cancelled {
                eprintln!("{}", "cancelled".yellow());
                return EXIT_CANCELLED;
            }
            let message = match e.downcast_ref::<RestoreError>() {
                Some(err) => err.user_message(),
                None => e.to_string(),
            };
            eprintln!("{}: {}", "Error".red().bold(), message);
            1
        }
    }
}

/// Main command runner
fn dispatch(cli: Cli, cancel: &CancellationToken) -> anyhow::Result<()> {
    let gopts = GlobalOptions {
        repo: cli.repo,
        json: cli.json,
        quiet: cli.quiet,
        verbose: cli.verbose,
        no_lock: cli.no_lock,
        workers: cli.workers.unwrap_or_else(num_cpus::get),
    };

    match cli.command {
        Commands::Init {
            compression,
            chunk_size,
        } => cmd_init(&gopts, compression, chunk_size)?,
        Commands::Backup { source, host, tags } => cmd_backup(&gopts, source, host, tags)?,
        Commands::Snapshots => cmd_snapshots(&gopts)?,
        Commands::Restore(args) => cmd_restore(&gopts, args, cancel)?,
    }
    Ok(())
}

/// Create a repository
fn cmd_init(gopts: &GlobalOptions, compression: CompressionMode, chunk_size: usize) -> Result<()> {
    let config = RepositoryConfig {
        compression: CompressionStrategy::from(compression).as_str().to_string(),
        chunk_size,
        ..Default::default()
    };
    let repo = Repository::init(gopts.repository()?, config)?;

    if !gopts.json {
        println!("{} Created repository at {}", "✓".green().bold(), repo.root().display().to_string().cyan());
    }
    Ok(())
}

/// Archive a directory
fn cmd_backup(gopts: &GlobalOptions, source: PathBuf, host: Option<String>, tags: Vec<String>) -> Result<()> {
    let repo = Repository::open(gopts.repository()?)?;
    let start = Instant::now();

    let (id, stats) = Archiver::new(&repo, &source).with_hostname(host).with_tags(tags).run()?;

    if gopts.json {
        #[derive(Serialize)]
        struct BackupSummary<'a> {
            message_type: &'static str,
            snapshot_id: &'a str,
            files: u64,
            dirs: u64,
            bytes_read: u64,
            new_chunks: u64,
        }
        let summary = BackupSummary {
            message_type: "summary",
            snapshot_id: &id,
            files: stats.files,
            dirs: stats.dirs,
            bytes_read: stats.bytes_read,
            new_chunks: stats.new_chunks,
        };
        println!("{}", serde_json::to_string(&summary)?);
    } else if !gopts.quiet {
        println!(
            "{} snapshot {} saved: {} files, {} in {}",
            "✓".green().bold(),
            id[..8].yellow().bold(),
            stats.files,
            snaprestore::format_bytes(stats.bytes_read),
            humantime::format_duration(std::time::Duration::from_millis(start.elapsed().as_millis() as u64))
        );
    }
    Ok(())
}

/// List snapshots oldest first
fn cmd_snapshots(gopts: &GlobalOptions) -> Result<()> {
    let repo = Repository::open(gopts.repository()?)?;
    let _lock = if gopts.no_lock { None } else { Some(repo.read_lock()?) };
    let snapshots = repo.list_snapshots()?;

    if gopts.json {
        #[derive(Serialize)]
        struct Entry<'a> {
            id: &'a str,
            short_id: &'a str,
            #[serde(flatten)]
            snapshot: &'a snaprestore::Snapshot,
        }
        let entries: Vec<Entry> = snapshots
            .iter()
            .map(|s| Entry {
                id: &s.id,
                short_id: s.short_id(),
                snapshot: s,
            })
            .collect();
        println!("{}", serde_json::to_string(&entries)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!("{}", "No snapshots found.".yellow());
        return Ok(());
    }

    for snapshot in &snapshots {
        print!("{} ", snapshot.short_id().yellow().bold());
        print!("{} ", snapshot.time.format("%Y-%m-%d %H:%M:%S").to_string().dimmed());
        print!("{} ", snapshot.hostname.cyan());
        if !snapshot.tags.is_empty() {
            print!("[{}] ", snapshot.tags.join(","));
        }
        println!("{}", snapshot.paths.join(" "));
    }
    println!("\n{}", format!("{} snapshots", snapshots.len()).dimmed());
    Ok(())
}

/// Restore a snapshot
fn cmd_restore(gopts: &GlobalOptions, args: RestoreArgs, cancel: &CancellationToken) -> Result<()> {
    let opts = RestoreOptions {
        exclude: ExcludePatternOptions {
            excludes: args.exclude,
            insensitive_excludes: args.iexclude,
            exclude_files: args.exclude_file,
            insensitive_exclude_files: args.iexclude_file,
        },
        include: IncludePatternOptions {
            includes: args.include,
            insensitive_includes: args.iinclude,
            include_files: args.include_file,
            insensitive_include_files: args.iinclude_file,
        },
        target: args.target.unwrap_or_default(),
        filter: SnapshotFilter {
            hosts: args.hosts,
            paths: args.paths,
            tags: args.tags,
        },
        sparse: args.sparse,
        verify: args.verify,
    };

    let printer: Arc<dyn ProgressPrinter> = if gopts.json {
        Arc::new(JsonProgress::new())
    } else {
        Arc::new(TextProgress::new(!gopts.quiet && std::io::stderr().is_terminal()))
    };

    restore_from_repository(&opts, gopts, &args.snapshot, printer, cancel)?;
    Ok(())
}
