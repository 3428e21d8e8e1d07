//! Engine: the entry point driving one run end to end.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::hooks::{Context, Hooks, TransformFn};
use crate::lifecycle::{build_client, Lifecycle};
use crate::policy::{RateLimiter, RetryPolicy};
use crate::pool::WorkerPool;
use crate::report::{ProgressFn, RunReporter, RunSummary, StatsSnapshot};
use crate::resume::ResumeTracker;
use crate::sink::ResultSink;

/// Runs a caller's [`Hooks`] over a JSON Lines input.
///
/// ```rust,ignore
/// let summary = Engine::new(config, hooks).run().await?;
/// println!("{summary}");
/// ```
pub struct Engine<S> {
    config: EngineConfig,
    hooks: Hooks<S>,
    progress: Option<ProgressFn>,
}

impl<S> Engine<S>
where
    S: Default + Send + Sync + 'static,
{
    pub fn new(config: EngineConfig, hooks: Hooks<S>) -> Self {
        Self {
            config,
            hooks,
            progress: None,
        }
    }

    /// Receive a counters snapshot after every finished record.
    pub fn on_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(&StatsSnapshot) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Run until the input is exhausted.
    pub async fn run(self) -> Result<RunSummary, EngineError> {
        self.run_until_cancelled(CancellationToken::new()).await
    }

    /// Run until the input is exhausted or `cancel` fires.
    ///
    /// A cancelled run still flushes buffered results and runs shutdown, and
    /// returns `Ok` with [`RunSummary::cancelled`] set.
    pub async fn run_until_cancelled(self, cancel: CancellationToken) -> Result<RunSummary, EngineError> {
        let Self {
            config,
            hooks,
            progress,
        } = self;
        config.validate()?;
        let client = build_client(&config)?;

        let Hooks {
            startup,
            transform,
            shutdown,
        } = hooks;
        let mut lifecycle = Lifecycle::new(client, startup, shutdown);

        let ctx = match lifecycle.startup().await {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(error = %e, "startup failed, no records processed");
                let empty = lifecycle.empty_context();
                lifecycle.shutdown(empty).await;
                return Err(e);
            }
        };

        let result = process(&config, transform, Arc::clone(&ctx), progress, &cancel).await;
        lifecycle.shutdown(ctx).await;
        result
    }
}

/// The processing phase: everything between startup and shutdown.
async fn process<S>(
    config: &EngineConfig,
    transform: TransformFn<S>,
    ctx: Arc<Context<S>>,
    progress: Option<ProgressFn>,
    cancel: &CancellationToken,
) -> Result<RunSummary, EngineError>
where
    S: Send + Sync + 'static,
{
    let mut tracker =
        ResumeTracker::load(&config.output_path, &config.id_key, config.rerun_key.as_deref()).await?;

    let reporter = RunReporter::new(progress);
    let sink = Arc::new(ResultSink::open(config, Arc::clone(reporter.stats())).await?);

    let pool = WorkerPool {
        input_path: config.input_path.clone(),
        capacity: config.max_concurrency,
        grace: config.shutdown_grace(),
        limiter: Arc::new(RateLimiter::new(config.rate_limiter_config())),
        retry: Arc::new(RetryPolicy::new(config.retry_config())),
        transform,
        ctx,
        sink: Arc::clone(&sink),
        stats: Arc::clone(reporter.stats()),
        progress: reporter.progress(),
    };
    let exit = pool.run(&mut tracker, cancel).await;
    let flushed = sink.finish().await;

    let (cancelled, aborted) = match &exit {
        Ok(e) => (e.cancelled, e.aborted as u64),
        Err(_) => (false, 0),
    };
    let summary = reporter.finish(cancelled, aborted);
    summary.log();

    let exit = exit?;
    if let Err(e) = flushed {
        error!(error = %e, "final flush failed");
        return Err(e);
    }
    if exit.cancelled {
        warn!(aborted = exit.aborted, "run cancelled, unfinished records will be retried next run");
    } else {
        info!("input exhausted");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Disposition;

    #[tokio::test]
    async fn invalid_config_fails_before_startup() {
        let started = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&started);
        let hooks = Hooks::<()>::new(|r, _ctx| async move { Ok(Disposition::Emit(r)) }).on_startup(move || async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        let config = EngineConfig {
            max_concurrency: 0,
            ..Default::default()
        };
        let err = Engine::new(config, hooks).run().await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(!started.load(std::sync::atomic::Ordering::SeqCst));
    }
}
