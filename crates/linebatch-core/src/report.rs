//! Run statistics, progress callbacks and the final summary.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

/// Live counters of one run. Each counter only ever increases.
#[derive(Debug, Default)]
pub struct RunStats {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped_complete: AtomicU64,
    skipped_empty: AtomicU64,
    input_errors: AtomicU64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempted(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_complete(&self) {
        self.skipped_complete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_empty(&self) {
        self.skipped_empty.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_input_error(&self) {
        self.input_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped_complete: self.skipped_complete.load(Ordering::Relaxed),
            skipped_empty: self.skipped_empty.load(Ordering::Relaxed),
            input_errors: self.input_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RunStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Records handed to the transform (retries not counted separately).
    pub attempted: u64,
    pub succeeded: u64,
    /// Records written to the error log, including rejected identities.
    pub failed: u64,
    /// Records skipped because their identity was already in the output.
    pub skipped_complete: u64,
    /// Records the transform chose not to emit.
    pub skipped_empty: u64,
    /// Input lines that were not JSON objects.
    pub input_errors: u64,
}

impl StatsSnapshot {
    /// Records that reached a final outcome this run.
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.skipped_empty
    }
}

/// Callback receiving a snapshot after every finished record.
pub type ProgressFn = Arc<dyn Fn(&StatsSnapshot) + Send + Sync>;

/// Summary of a completed (or cancelled) run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
    /// The run stopped early on cancellation; unfinished records will be
    /// picked up by the next run.
    pub cancelled: bool,
    /// In-flight records cut off when the shutdown grace period ran out.
    pub aborted: u64,
}

impl RunSummary {
    /// Finished records per second of wall time.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.stats.finished() as f64 / secs
        } else {
            0.0
        }
    }

    /// Emit the summary as one structured log event.
    pub fn log(&self) {
        info!(
            attempted = self.stats.attempted,
            succeeded = self.stats.succeeded,
            failed = self.stats.failed,
            skipped_complete = self.stats.skipped_complete,
            skipped_empty = self.stats.skipped_empty,
            input_errors = self.stats.input_errors,
            elapsed_ms = self.elapsed.as_millis() as u64,
            throughput = self.throughput(),
            cancelled = self.cancelled,
            aborted = self.aborted,
            "run finished"
        );
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.stats;
        writeln!(f, "Attempted:        {}", s.attempted)?;
        writeln!(f, "Succeeded:        {}", s.succeeded)?;
        writeln!(f, "Failed:           {}", s.failed)?;
        writeln!(f, "Skipped (done):   {}", s.skipped_complete)?;
        writeln!(f, "Skipped (empty):  {}", s.skipped_empty)?;
        writeln!(f, "Input errors:     {}", s.input_errors)?;
        writeln!(f, "Elapsed:          {:.2}s", self.elapsed.as_secs_f64())?;
        write!(f, "Throughput:       {:.2} records/s", self.throughput())?;
        if self.cancelled {
            write!(f, "\n(cancelled before the input was exhausted)")?;
        }
        if self.aborted > 0 {
            write!(f, "\n({} in-flight records aborted, they run again next time)", self.aborted)?;
        }
        Ok(())
    }
}

/// Tracks statistics for one run and produces the summary.
pub(crate) struct RunReporter {
    stats: Arc<RunStats>,
    started: Instant,
    progress: Option<ProgressFn>,
}

impl RunReporter {
    pub(crate) fn new(progress: Option<ProgressFn>) -> Self {
        Self {
            stats: Arc::new(RunStats::new()),
            started: Instant::now(),
            progress,
        }
    }

    pub(crate) fn stats(&self) -> &Arc<RunStats> {
        &self.stats
    }

    pub(crate) fn progress(&self) -> Option<ProgressFn> {
        self.progress.clone()
    }

    pub(crate) fn finish(&self, cancelled: bool, aborted: u64) -> RunSummary {
        RunSummary {
            stats: self.stats.snapshot(),
            elapsed: self.started.elapsed(),
            cancelled,
            aborted,
        }
    }
}

/// Invoke `progress` with the current counters, if a callback is set.
pub(crate) fn notify(progress: Option<&ProgressFn>, stats: &RunStats) {
    if let Some(cb) = progress {
        cb(&stats.snapshot());
    }
}
