//! Shared sink for per-item restore and verify failures
//!
//! The restore engine never aborts on a single unreadable chunk or an
//! unwritable file. It hands the failure to an [`ItemErrorSink`] and moves
//! on. [`ErrorAggregator`] counts the failure and emits a diagnostic line
//! immediately.
//!
//! The count is read back by the orchestrator at its two checkpoints
//! (after restore, after verify). Count update and line emission happen
//! under one lock, so concurrent workers never lose an increment and
//! diagnostic lines never interleave.

use crate::error::RestoreError;
use crate::progress::ProgressPrinter;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives per-item failures and warnings from the engine
pub trait ItemErrorSink: Send + Sync {
    /// Report a failure at `location`
    fn error(&self, location: &str, cause: &RestoreError);

    /// Report a warning
    fn warn(&self, message: &str);
}

/// Counts item failures and forwards them to a printer
pub struct ErrorAggregator {
    count: AtomicUsize,
    printer: Mutex<Arc<dyn ProgressPrinter>>,
}

impl ErrorAggregator {
    /// Create an aggregator emitting to `printer`
    pub fn new(printer: Arc<dyn ProgressPrinter>) -> Self {
        Self {
            count: AtomicUsize::new(0),
            printer: Mutex::new(printer),
        }
    }

    /// Number of failures recorded so far
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl ItemErrorSink for ErrorAggregator {
    fn error(&self, location: &str, cause: &RestoreError) {
        let printer = self.printer.lock();
        let total = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        printer.error(location, &cause.to_string());
        debug!(location, error = %cause, total, "ignoring item error");
    }

    fn warn(&self, message: &str) {
        let printer = self.printer.lock();
        printer.warning(message);
        warn!("{}", message);
    }
}
