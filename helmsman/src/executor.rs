//! Continuation executors.
//!
//! An [`Executor`] is the explicit handle through which completion continuations and timers
//! are scheduled. There is no process-wide default; components that need one receive it as a
//! constructor parameter.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RaftError;
use crate::error::RaftResult;

/// A handle for scheduling units of work.
///
/// Two flavors exist: an inline executor which runs submitted work on the calling thread, and
/// a Tokio-backed executor which spawns work onto a runtime. Timers always run off-thread.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    flavor: Flavor,
    /// 0 = open, 1 = shutdown requested, plus one per outstanding keep-alive token.
    ///
    /// The executor is gone once shutdown has been requested and all keep-alive tokens have
    /// been dropped.
    shutdown_requested: std::sync::atomic::AtomicBool,
    keep_alives: AtomicUsize,
}

enum Flavor {
    Inline,
    Tokio(tokio::runtime::Handle),
}

impl Executor {
    /// Create an executor which runs submitted work inline on the submitting thread.
    pub fn inline() -> Self {
        Self::with_flavor(Flavor::Inline)
    }

    /// Create an executor backed by the given Tokio runtime handle.
    pub fn tokio(handle: tokio::runtime::Handle) -> Self {
        Self::with_flavor(Flavor::Tokio(handle))
    }

    /// Create an executor backed by the ambient Tokio runtime.
    ///
    /// Panics outside of a Tokio runtime context, same as `tokio::runtime::Handle::current`.
    pub fn current() -> Self {
        Self::tokio(tokio::runtime::Handle::current())
    }

    fn with_flavor(flavor: Flavor) -> Self {
        Self {
            inner: Arc::new(Inner {
                flavor,
                shutdown_requested: std::sync::atomic::AtomicBool::new(false),
                keep_alives: AtomicUsize::new(0),
            }),
        }
    }

    /// Submit a unit of work.
    ///
    /// Fails with `ExecutorGone` if the executor has shut down and no keep-alive tokens are
    /// outstanding.
    pub fn add(&self, work: impl FnOnce() + Send + 'static) -> RaftResult<()> {
        if self.is_gone() {
            return Err(RaftError::ExecutorGone);
        }
        match &self.inner.flavor {
            Flavor::Inline => work(),
            Flavor::Tokio(handle) => {
                handle.spawn(async move { work() });
            }
        }
        Ok(())
    }

    /// Schedule `work` to run after `delay` has elapsed.
    ///
    /// The gone-check is repeated at fire time; work scheduled before shutdown does not run
    /// after it.
    pub fn timer(&self, delay: Duration, work: impl FnOnce() + Send + 'static) -> RaftResult<()> {
        if self.is_gone() {
            return Err(RaftError::ExecutorGone);
        }
        let guard = self.clone();
        match &self.inner.flavor {
            Flavor::Inline => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    if !guard.is_gone() {
                        work();
                    }
                });
            }
            Flavor::Tokio(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if !guard.is_gone() {
                        work();
                    }
                });
            }
        }
        Ok(())
    }

    /// Produce a token which holds the executor open across a shutdown request.
    pub fn keep_alive_token(&self) -> KeepAlive {
        self.inner.keep_alives.fetch_add(1, Ordering::SeqCst);
        KeepAlive {
            inner: self.inner.clone(),
        }
    }

    /// Request shutdown. The executor stops accepting work once all keep-alive tokens are gone.
    pub fn shutdown(&self) {
        self.inner.shutdown_requested.store(true, Ordering::SeqCst);
    }

    fn is_gone(&self) -> bool {
        self.inner.shutdown_requested.load(Ordering::SeqCst) && self.inner.keep_alives.load(Ordering::SeqCst) == 0
    }
}

/// A guard which keeps its executor accepting work until dropped.
pub struct KeepAlive {
    inner: Arc<Inner>,
}

impl Clone for KeepAlive {
    fn clone(&self) -> Self {
        self.inner.keep_alives.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.inner.keep_alives.fetch_sub(1, Ordering::SeqCst);
    }
}
