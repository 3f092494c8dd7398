//! Progress reporting and diagnostics
//!
//! [`Progress`] counts files and bytes as the restore engine works and
//! forwards throttled snapshots of those counters to a [`ProgressPrinter`].
//! Two printers ship with the crate:
//!
//! - [`TextProgress`] draws an `indicatif` bar and prints human readable
//!   lines, colored with `colored`
//! - [`JsonProgress`] emits one JSON object per line, tagged by
//!   `message_type` (`status`, `summary`, `error`, `warning`)
//!
//! Both printers take a lock around every line they write so concurrent
//! workers never interleave output mid-line.

use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::utils::format_bytes;

/// Environment variable overriding the text refresh rate (updates per second)
pub const PROGRESS_FPS_ENV: &str = "SNAPRESTORE_PROGRESS_FPS";

/// Point-in-time view of restore counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressState {
    /// Files completely written
    pub files_finished: u64,
    /// Files scheduled for restore
    pub files_total: u64,
    /// Bytes written so far
    pub bytes_written: u64,
    /// Bytes scheduled for restore
    pub bytes_total: u64,
}

impl ProgressState {
    /// Completion ratio in `0.0..=1.0`
    pub fn fraction_done(&self) -> f64 {
        if self.bytes_total == 0 {
            if self.files_total == 0 {
                return 1.0;
            }
            return self.files_finished as f64 / self.files_total as f64;
        }
        self.bytes_written as f64 / self.bytes_total as f64
    }
}

/// Renders progress, messages and diagnostics
pub trait ProgressPrinter: Send + Sync {
    /// Periodic status update
    fn update(&self, state: &ProgressState, elapsed: Duration);

    /// Final summary after the restore walk
    fn finish(&self, state: &ProgressState, elapsed: Duration);

    /// A per-item failure that the walk ignored
    fn error(&self, location: &str, cause: &str);

    /// A non-fatal warning
    fn warning(&self, message: &str);

    /// An informational line for humans
    fn message(&self, text: &str);

    /// Index loading progress, `done` out of `total` steps
    fn index_progress(&self, _done: u64, _total: u64) {}
}

type Sink = Mutex<Box<dyn Write + Send>>;

/// Human-readable progress on the terminal
pub struct TextProgress {
    out: Sink,
    err: Sink,
    bar: ProgressBar,
    index_bar: ProgressBar,
}

impl TextProgress {
    /// Printer writing to stdout and stderr
    pub fn new(show_bars: bool) -> Self {
        let target = || {
            if show_bars {
                ProgressDrawTarget::stderr()
            } else {
                ProgressDrawTarget::hidden()
            }
        };
        let bar = ProgressBar::with_draw_target(Some(0), target());
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] {bar:30.cyan/blue} {bytes}/{total_bytes} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        let index_bar = ProgressBar::with_draw_target(Some(0), target());
        index_bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} loading index {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        Self {
            out: Mutex::new(Box::new(std::io::stdout())),
            err: Mutex::new(Box::new(std::io::stderr())),
            bar,
            index_bar,
        }
    }

    /// Printer writing to the given sinks, without progress bars
    pub fn with_writers(out: Box<dyn Write + Send>, err: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            err: Mutex::new(err),
            bar: ProgressBar::hidden(),
            index_bar: ProgressBar::hidden(),
        }
    }

    fn write_line(&self, sink: &Sink, line: &str) {
        self.bar.suspend(|| {
            let mut w = sink.lock();
            if let Err(e) = writeln!(w, "{}", line).and_then(|_| w.flush()) {
                warn!("Failed to write output: {}", e);
            }
        });
    }
}

impl ProgressPrinter for TextProgress {
    fn update(&self, state: &ProgressState, _elapsed: Duration) {
        self.bar.set_length(state.bytes_total);
        self.bar.set_position(state.bytes_written);
        self.bar
            .set_message(format!("{} / {} files", state.files_finished, state.files_total));
    }

    fn finish(&self, state: &ProgressState, elapsed: Duration) {
        self.bar.finish_and_clear();
        let elapsed = Duration::from_secs(elapsed.as_secs());
        self.write_line(
            &self.out,
            &format!(
                "Summary: Restored {} / {} files ({} / {}) in {}",
                state.files_finished,
                state.files_total,
                format_bytes(state.bytes_written),
                format_bytes(state.bytes_total),
                format_duration(elapsed)
            ),
        );
    }

    fn error(&self, location: &str, cause: &str) {
        self.write_line(
            &self.err,
            &format!("{} {}: {}", "ignoring error for".red(), location, cause),
        );
    }

    fn warning(&self, message: &str) {
        self.write_line(&self.err, &format!("{}: {}", "Warning".yellow(), message));
    }

    fn message(&self, text: &str) {
        self.write_line(&self.out, text);
    }

    fn index_progress(&self, done: u64, total: u64) {
        self.index_bar.set_length(total);
        self.index_bar.set_position(done);
        if done >= total {
            self.index_bar.finish_and_clear();
        }
    }
}

#[derive(Serialize)]
struct StatusLine {
    message_type: &'static str,
    seconds_elapsed: u64,
    percent_done: f64,
    total_files: u64,
    files_restored: u64,
    total_bytes: u64,
    bytes_restored: u64,
}

#[derive(Serialize)]
struct ErrorLine<'a> {
    message_type: &'static str,
    item: &'a str,
    error: ErrorMessage<'a>,
}

#[derive(Serialize)]
struct ErrorMessage<'a> {
    message: &'a str,
}

#[derive(Serialize)]
struct WarningLine<'a> {
    message_type: &'static str,
    message: &'a str,
}

/// Machine-readable progress as JSON lines
///
/// Informational messages meant for humans are not emitted.
pub struct JsonProgress {
    out: Sink,
    err: Sink,
}

impl Default for JsonProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonProgress {
    /// Printer writing to stdout and stderr
    pub fn new() -> Self {
        Self::with_writers(Box::new(std::io::stdout()), Box::new(std::io::stderr()))
    }

    /// Printer writing to the given sinks
    pub fn with_writers(out: Box<dyn Write + Send>, err: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            err: Mutex::new(err),
        }
    }

    fn emit<T: Serialize>(sink: &Sink, value: &T) {
        let line = match serde_json::to_string(value) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode progress line: {}", e);
                return;
            }
        };
        let mut w = sink.lock();
        if let Err(e) = writeln!(w, "{}", line).and_then(|_| w.flush()) {
            warn!("Failed to write output: {}", e);
        }
    }

    fn status(message_type: &'static str, state: &ProgressState, elapsed: Duration) -> StatusLine {
        StatusLine {
            message_type,
            seconds_elapsed: elapsed.as_secs(),
            percent_done: state.fraction_done(),
            total_files: state.files_total,
            files_restored: state.files_finished,
            total_bytes: state.bytes_total,
            bytes_restored: state.bytes_written,
        }
    }
}

impl ProgressPrinter for JsonProgress {
    fn update(&self, state: &ProgressState, elapsed: Duration) {
        Self::emit(&self.out, &Self::status("status", state, elapsed));
    }

    fn finish(&self, state: &ProgressState, elapsed: Duration) {
        Self::emit(&self.out, &Self::status("summary", state, elapsed));
    }

    fn error(&self, location: &str, cause: &str) {
        Self::emit(
            &self.err,
            &ErrorLine {
                message_type: "error",
                item: location,
                error: ErrorMessage { message: cause },
            },
        );
    }

    fn warning(&self, message: &str) {
        Self::emit(
            &self.err,
            &WarningLine {
                message_type: "warning",
                message,
            },
        );
    }

    fn message(&self, _text: &str) {}
}

/// How often status updates are forwarded to the printer
///
/// `None` disables updates entirely (quiet mode). JSON output is limited to
/// one update per second; text output refreshes ten times per second unless
/// overridden by [`PROGRESS_FPS_ENV`].
pub fn calculate_progress_interval(show: bool, json: bool) -> Option<Duration> {
    if !show {
        return None;
    }
    let mut interval = Duration::from_millis(100);
    if let Some(fps) = std::env::var(PROGRESS_FPS_ENV)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|fps| *fps > 0.0)
    {
        interval = Duration::from_secs_f64(1.0 / fps.min(60.0));
    }
    if json {
        interval = interval.max(Duration::from_secs(1));
    }
    Some(interval)
}

/// Shared restore counters with throttled reporting
pub struct Progress {
    printer: Arc<dyn ProgressPrinter>,
    interval: Option<Duration>,
    start: Instant,
    last_update: Mutex<Option<Instant>>,
    files_total: AtomicU64,
    files_finished: AtomicU64,
    bytes_total: AtomicU64,
    bytes_written: AtomicU64,
}

impl Progress {
    /// Create counters reporting to `printer` at most once per `interval`
    pub fn new(printer: Arc<dyn ProgressPrinter>, interval: Option<Duration>) -> Self {
        Self {
            printer,
            interval,
            start: Instant::now(),
            last_update: Mutex::new(None),
            files_total: AtomicU64::new(0),
            files_finished: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// The printer behind these counters
    pub fn printer(&self) -> &Arc<dyn ProgressPrinter> {
        &self.printer
    }

    /// Register a file that will be restored
    pub fn add_file(&self, size: u64) {
        self.files_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_total.fetch_add(size, Ordering::Relaxed);
    }

    /// Record bytes written; `finished` marks the file complete
    pub fn add_progress(&self, bytes: u64, finished: bool) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        if finished {
            self.files_finished.fetch_add(1, Ordering::Relaxed);
        }
        self.maybe_update();
    }

    /// Current counter values
    pub fn state(&self) -> ProgressState {
        ProgressState {
            files_finished: self.files_finished.load(Ordering::Relaxed),
            files_total: self.files_total.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
        }
    }

    fn maybe_update(&self) {
        let Some(interval) = self.interval else {
            return;
        };
        let now = Instant::now();
        {
            let mut last = self.last_update.lock();
            if matches!(*last, Some(t) if now.duration_since(t) < interval) {
                return;
            }
            *last = Some(now);
        }
        self.printer.update(&self.state(), self.start.elapsed());
    }

    /// Report the final summary
    pub fn finish(&self) {
        self.printer.finish(&self.state(), self.start.elapsed());
    }
}
