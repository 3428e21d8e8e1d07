//! Worker pool: launches transforms in input order under a capacity bound.
//!
//! For each record that still needs work the pool waits for a rate slot,
//! then for a capacity permit, then spawns the transform without awaiting
//! it. A finished task releases its permit before handing its outcome to
//! the sink, so a slow write never holds capacity.
//!
//! Every launched task is tracked in a [`JoinSet`] and awaited before the
//! pool returns. On cancellation or a fatal write error no further record is
//! launched; in-flight tasks get the configured grace period and are then
//! aborted. Aborted records are absent from the output and will be picked up
//! by the next run.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::fs::File;
use tokio::io::BufReader;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, TaskError};
use crate::hooks::{Context, TransformFn};
use crate::jsonl::JsonLines;
use crate::policy::{Attempted, RateLimiter, RetryPolicy};
use crate::record::{Disposition, Failure, Identity, Outcome, Record};
use crate::report::{notify, ProgressFn, RunStats};
use crate::resume::{Decision, ResumeTracker};
use crate::sink::ResultSink;

/// How the launch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolExit {
    /// Stopped by the caller's cancellation token.
    pub cancelled: bool,
    /// In-flight tasks aborted after the grace period.
    pub aborted: usize,
}

pub(crate) struct WorkerPool<S> {
    pub input_path: PathBuf,
    pub capacity: usize,
    pub grace: Duration,
    pub limiter: Arc<RateLimiter>,
    pub retry: Arc<RetryPolicy>,
    pub transform: TransformFn<S>,
    pub ctx: Arc<Context<S>>,
    pub sink: Arc<ResultSink>,
    pub stats: Arc<RunStats>,
    pub progress: Option<ProgressFn>,
}

impl<S> WorkerPool<S>
where
    S: Send + Sync + 'static,
{
    /// Process the whole input, returning once every launched task is done.
    pub(crate) async fn run(
        self,
        tracker: &mut ResumeTracker,
        cancel: &CancellationToken,
    ) -> Result<PoolExit, EngineError> {
        let file = File::open(&self.input_path)
            .await
            .map_err(|e| EngineError::read(&self.input_path, e))?;
        let mut lines = JsonLines::new(BufReader::new(file));

        let semaphore = Arc::new(Semaphore::new(self.capacity));
        let stop = cancel.child_token();
        let mut tasks: JoinSet<Result<(), EngineError>> = JoinSet::new();
        let mut fatal: Option<EngineError> = None;
        let mut aborted = 0;

        info!(
            input = %self.input_path.display(),
            capacity = self.capacity,
            rate_limited = self.limiter.is_enabled(),
            "processing input"
        );

        loop {
            while let Some(done) = tasks.try_join_next() {
                reap(done, &mut fatal, &mut aborted);
            }
            if stop.is_cancelled() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                next = lines.next_record() => next,
            };
            let (line, parsed) = match next {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(e) => {
                    error!(input = %self.input_path.display(), error = %e, "input read failed");
                    fatal.get_or_insert(EngineError::read(&self.input_path, e));
                    stop.cancel();
                    break;
                }
            };

            let record = match parsed {
                Ok(record) => record,
                Err(e) => {
                    warn!(line, error = %e, text = %lines.snippet(), "skipping malformed input line");
                    self.stats.record_input_error();
                    continue;
                }
            };

            let identity = match tracker.should_process(&record) {
                Decision::Process(identity) => identity,
                Decision::Skip(identity) => {
                    debug!(line, %identity, "already complete");
                    self.stats.record_skipped_complete();
                    continue;
                }
                Decision::Reject(err) => {
                    warn!(line, error = %err, "rejecting record");
                    let failure = Failure::new(None, record, err, 0);
                    if let Err(e) = self.sink.submit(Outcome::Failure(failure)).await {
                        fatal.get_or_insert(e);
                        stop.cancel();
                        break;
                    }
                    notify(self.progress.as_ref(), &self.stats);
                    continue;
                }
            };

            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = self.limiter.acquire() => {}
            }
            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            self.stats.record_attempted();
            debug!(line, identity = %label(identity.as_ref()), in_flight = tasks.len() + 1, "launching");
            let job = Job {
                transform: Arc::clone(&self.transform),
                ctx: Arc::clone(&self.ctx),
                limiter: Arc::clone(&self.limiter),
                retry: Arc::clone(&self.retry),
                sink: Arc::clone(&self.sink),
                stats: Arc::clone(&self.stats),
                progress: self.progress.clone(),
                stop: stop.clone(),
            };
            tasks.spawn(job.run(record, identity, permit));
        }

        // Input exhausted or launching stopped: wait for the tail, unless a
        // stop arrives while waiting.
        tokio::select! {
            _ = async {
                while let Some(done) = tasks.join_next().await {
                    reap(done, &mut fatal, &mut aborted);
                }
            } => {}
            _ = stop.cancelled() => {}
        }

        if !tasks.is_empty() {
            info!(
                in_flight = tasks.len(),
                grace_ms = self.grace.as_millis() as u64,
                "stopping, waiting for in-flight records"
            );
            let drained = time::timeout(self.grace, async {
                while let Some(done) = tasks.join_next().await {
                    reap(done, &mut fatal, &mut aborted);
                }
            })
            .await;
            if drained.is_err() {
                warn!(remaining = tasks.len(), "grace period elapsed, aborting in-flight records");
                tasks.abort_all();
                while let Some(done) = tasks.join_next().await {
                    reap(done, &mut fatal, &mut aborted);
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(PoolExit {
                cancelled: cancel.is_cancelled(),
                aborted,
            }),
        }
    }
}

fn reap(
    done: Result<Result<(), EngineError>, JoinError>,
    fatal: &mut Option<EngineError>,
    aborted: &mut usize,
) {
    match done {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            fatal.get_or_insert(e);
        }
        Err(e) if e.is_cancelled() => *aborted += 1,
        Err(e) => {
            fatal.get_or_insert(EngineError::Join(e.to_string()));
        }
    }
}

fn label(identity: Option<&Identity>) -> String {
    identity.map_or_else(|| "-".to_string(), ToString::to_string)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ─── Job ──────────────────────────────────────────────────────────────────────

/// Everything one spawned task needs, cloned out of the pool.
struct Job<S> {
    transform: TransformFn<S>,
    ctx: Arc<Context<S>>,
    limiter: Arc<RateLimiter>,
    retry: Arc<RetryPolicy>,
    sink: Arc<ResultSink>,
    stats: Arc<RunStats>,
    progress: Option<ProgressFn>,
    stop: CancellationToken,
}

impl<S> Job<S>
where
    S: Send + Sync + 'static,
{
    async fn run(
        self,
        record: Record,
        identity: Option<Identity>,
        permit: OwnedSemaphorePermit,
    ) -> Result<(), EngineError> {
        let calls = AtomicU32::new(0);
        let attempted = AssertUnwindSafe(self.attempt(&record, &calls))
            .catch_unwind()
            .await;
        drop(permit);

        let outcome = match attempted {
            Ok(Attempted {
                result: Ok(Disposition::Emit(out)),
                ..
            }) => Outcome::Success(out),
            Ok(Attempted {
                result: Ok(Disposition::Skip),
                ..
            }) => Outcome::Skip,
            Ok(Attempted {
                result: Err(e),
                attempts,
            }) => {
                error!(
                    identity = %label(identity.as_ref()),
                    attempts,
                    kind = e.kind(),
                    error = %e,
                    "record failed"
                );
                Outcome::Failure(Failure::new(identity, record, e, attempts))
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(identity = %label(identity.as_ref()), panic = %message, "transform panicked");
                let attempts = calls.load(Ordering::Relaxed).max(1);
                Outcome::Failure(Failure::new(identity, record, TaskError::Panicked(message), attempts))
            }
        };

        if let Err(e) = self.sink.submit(outcome).await {
            self.stop.cancel();
            return Err(e);
        }
        notify(self.progress.as_ref(), &self.stats);
        Ok(())
    }

    /// Run the transform under the retry policy. Every retry is a new
    /// request and waits for its own rate slot.
    async fn attempt(&self, record: &Record, calls: &AtomicU32) -> Attempted<Disposition, TaskError> {
        self.retry
            .run(|attempt| {
                calls.fetch_add(1, Ordering::Relaxed);
                let transform = Arc::clone(&self.transform);
                let ctx = Arc::clone(&self.ctx);
                let limiter = Arc::clone(&self.limiter);
                let record = record.clone();
                async move {
                    if attempt > 1 {
                        limiter.acquire().await;
                    }
                    transform(record, ctx).await
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*p), "boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("bad record"));
        assert_eq!(panic_message(&*p), "bad record");
        let p: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&*p), "non-string panic payload");
    }

    #[test]
    fn reap_keeps_first_fatal_error() {
        let mut fatal = None;
        let mut aborted = 0;
        reap(Ok(Err(EngineError::Config("first".into()))), &mut fatal, &mut aborted);
        reap(Ok(Err(EngineError::Config("second".into()))), &mut fatal, &mut aborted);
        reap(Ok(Ok(())), &mut fatal, &mut aborted);
        assert!(matches!(fatal, Some(EngineError::Config(ref m)) if m == "first"));
        assert_eq!(aborted, 0);
    }

    #[test]
    fn missing_identity_label() {
        assert_eq!(label(None), "-");
        assert_eq!(label(Some(&Identity::Text("a".into()))), "a");
    }
}
