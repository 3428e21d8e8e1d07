//! Startup and shutdown of the caller's resources.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::hooks::{Context, ShutdownFn, StartupFn};

/// Build the HTTP client injected into every [`Context`].
pub fn build_client(config: &EngineConfig) -> Result<reqwest::Client, EngineError> {
    reqwest::Client::builder()
        .timeout(config.http_timeout())
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(EngineError::Client)
}

/// Owns the startup and shutdown hooks of one run.
///
/// Shutdown is stored as an `Option` and taken on first use, so it can run
/// at most once no matter which path ends the run.
pub(crate) struct Lifecycle<S> {
    client: reqwest::Client,
    startup: Option<StartupFn<S>>,
    shutdown: Option<ShutdownFn<S>>,
}

impl<S> Lifecycle<S>
where
    S: Default + Send + Sync + 'static,
{
    pub(crate) fn new(client: reqwest::Client, startup: StartupFn<S>, shutdown: ShutdownFn<S>) -> Self {
        Self {
            client,
            startup: Some(startup),
            shutdown: Some(shutdown),
        }
    }

    /// Run the startup hook and build the shared context.
    ///
    /// On failure the returned error is final for the run, but the caller
    /// must still invoke [`Lifecycle::shutdown`] with [`Lifecycle::empty_context`].
    pub(crate) async fn startup(&mut self) -> Result<Arc<Context<S>>, EngineError> {
        let Some(startup) = self.startup.take() else {
            return Err(EngineError::Config("startup already ran".into()));
        };
        info!("running startup hook");
        let resources = startup().await.map_err(EngineError::Startup)?;
        Ok(Arc::new(Context::new(self.client.clone(), resources)))
    }

    /// A context whose resources are `S::default()`, handed to shutdown when
    /// startup failed.
    pub(crate) fn empty_context(&self) -> Arc<Context<S>> {
        Arc::new(Context::new(self.client.clone(), S::default()))
    }

    /// Run the shutdown hook if it has not run yet. Errors are logged only.
    pub(crate) async fn shutdown(&mut self, ctx: Arc<Context<S>>) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        info!("running shutdown hook");
        if let Err(e) = shutdown(ctx).await {
            error!(error = %e, "shutdown hook failed");
        }
    }
}
