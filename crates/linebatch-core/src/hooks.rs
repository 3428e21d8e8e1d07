//! Caller-supplied hooks and the context shared between them.
//!
//! A run is driven by three independent async closures bound into [`Hooks`]:
//!
//! - `startup`: runs once, returns the caller's resources `S`
//! - `transform`: runs once per scheduled record (more on retry)
//! - `shutdown`: runs exactly once, even after a failed startup
//!
//! ```rust,ignore
//! let hooks = Hooks::<()>::new(|mut record, _ctx| async move {
//!     record.insert("seen".into(), true.into());
//!     Ok(Disposition::Emit(record))
//! });
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::error::{HookError, TaskError};
use crate::record::{Disposition, Record};

/// Resources shared by every transform invocation of one run.
#[derive(Debug)]
pub struct Context<S> {
    /// Engine-owned HTTP client, safe for concurrent use.
    pub client: reqwest::Client,
    /// Whatever the startup hook returned.
    pub resources: S,
}

impl<S> Context<S> {
    pub fn new(client: reqwest::Client, resources: S) -> Self {
        Self { client, resources }
    }
}

// ─── ResourceMap ──────────────────────────────────────────────────────────────

/// String-keyed bag of shared resources, for callers that do not want to
/// declare a resources type.
#[derive(Default, Clone)]
pub struct ResourceMap {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ResourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `key`, replacing any previous entry.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Arc::new(value));
    }

    /// Borrow the value under `key` if present and of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.entries.get(key)?.downcast_ref::<T>()
    }

    /// Clone out a shared handle to the value under `key`.
    pub fn get_arc<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        Arc::clone(self.entries.get(key)?).downcast::<T>().ok()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ResourceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort();
        f.debug_struct("ResourceMap").field("keys", &keys).finish()
    }
}

// ─── Hooks ────────────────────────────────────────────────────────────────────

pub(crate) type StartupFn<S> = Box<dyn FnOnce() -> BoxFuture<'static, Result<S, HookError>> + Send>;

pub(crate) type TransformFn<S> = Arc<
    dyn Fn(Record, Arc<Context<S>>) -> BoxFuture<'static, Result<Disposition, TaskError>>
        + Send
        + Sync,
>;

pub(crate) type ShutdownFn<S> =
    Box<dyn FnOnce(Arc<Context<S>>) -> BoxFuture<'static, Result<(), HookError>> + Send>;

/// The caller's capability contract for one run.
pub struct Hooks<S> {
    pub(crate) startup: StartupFn<S>,
    pub(crate) transform: TransformFn<S>,
    pub(crate) shutdown: ShutdownFn<S>,
}

impl<S> Hooks<S>
where
    S: Default + Send + Sync + 'static,
{
    /// Hooks with the given transform, a startup that yields `S::default()`
    /// and a no-op shutdown.
    pub fn new<F, Fut>(transform: F) -> Self
    where
        F: Fn(Record, Arc<Context<S>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Disposition, TaskError>> + Send + 'static,
    {
        Self {
            startup: Box::new(|| async { Ok::<S, HookError>(S::default()) }.boxed()),
            transform: Arc::new(move |record: Record, ctx: Arc<Context<S>>| {
                transform(record, ctx).boxed()
            }),
            shutdown: Box::new(|_ctx: Arc<Context<S>>| async { Ok::<(), HookError>(()) }.boxed()),
        }
    }

    /// Acquire the run's resources before any record is scheduled.
    pub fn on_startup<F, Fut>(mut self, startup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<S, HookError>> + Send + 'static,
    {
        self.startup = Box::new(move || startup().boxed());
        self
    }

    /// Release the run's resources. Called exactly once per run.
    pub fn on_shutdown<F, Fut>(mut self, shutdown: F) -> Self
    where
        F: FnOnce(Arc<Context<S>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        self.shutdown = Box::new(move |ctx: Arc<Context<S>>| shutdown(ctx).boxed());
        self
    }
}

impl<S> fmt::Debug for Hooks<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}
