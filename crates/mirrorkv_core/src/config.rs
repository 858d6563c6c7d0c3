//! Process-wide context: shared pool, logger, size thresholds, and the
//! store instance registry.
//!
//! Everything that would be ambient global state in other runtimes is
//! carried explicitly by a [`Context`] so embedders can scope it: tests
//! get isolated registries, applications can share one context across
//! all stores. Cloning a context is cheap and shares the same registry
//! and pool.

use crate::executor::{ThreadPool, DEFAULT_IDLE_TIMEOUT, DEFAULT_WORKERS};
use crate::logger::{Logger, TracingLogger};
use crate::store::Store;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default inline-versus-sidecar threshold in bytes.
pub const DEFAULT_INTERNAL_LIMIT: usize = 8192;
/// Lowest accepted inline threshold.
pub const MIN_INTERNAL_LIMIT: usize = 2048;
/// Highest accepted inline threshold (value lengths are 16-bit).
pub const MAX_INTERNAL_LIMIT: usize = 0xFFFF;

/// Shared context for a family of stores.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    pub(crate) pool: ThreadPool,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) internal_limit: usize,
    /// Open stores keyed by canonicalized `path + name`.
    pub(crate) instances: Mutex<HashMap<String, Store>>,
}

impl Context {
    /// Creates a context with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a customized context.
    #[must_use]
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// The size threshold above which values spill to sidecar files.
    #[must_use]
    pub fn internal_limit(&self) -> usize {
        self.inner.internal_limit
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`Context`].
pub struct ContextBuilder {
    workers: usize,
    idle_timeout: Duration,
    logger: Arc<dyn Logger>,
    internal_limit: usize,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            logger: Arc::new(TracingLogger),
            internal_limit: DEFAULT_INTERNAL_LIMIT,
        }
    }
}

impl ContextBuilder {
    /// Sets the worker cap of the shared pool.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the idle timeout after which pool workers exit.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Installs a custom logger.
    #[must_use]
    pub fn logger(mut self, logger: impl Logger + 'static) -> Self {
        self.logger = Arc::new(logger);
        self
    }

    /// Sets the inline-versus-sidecar threshold, clamped to the
    /// supported range.
    #[must_use]
    pub fn internal_limit(mut self, limit: usize) -> Self {
        self.internal_limit = limit.clamp(MIN_INTERNAL_LIMIT, MAX_INTERNAL_LIMIT);
        self
    }

    /// Builds the context.
    #[must_use]
    pub fn build(self) -> Context {
        Context {
            inner: Arc::new(ContextInner {
                pool: ThreadPool::new(self.workers, self.idle_timeout),
                logger: self.logger,
                internal_limit: self.internal_limit,
                instances: Mutex::new(HashMap::new()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_limit_is_clamped() {
        let ctx = Context::builder().internal_limit(100).build();
        assert_eq!(ctx.internal_limit(), MIN_INTERNAL_LIMIT);
        let ctx = Context::builder().internal_limit(1 << 20).build();
        assert_eq!(ctx.internal_limit(), MAX_INTERNAL_LIMIT);
        let ctx = Context::builder().internal_limit(4096).build();
        assert_eq!(ctx.internal_limit(), 4096);
    }

    #[test]
    fn default_limit() {
        assert_eq!(Context::new().internal_limit(), DEFAULT_INTERNAL_LIMIT);
    }
}
