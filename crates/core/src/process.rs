//! Structured concurrency for long-running tasks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::Context;

/// Owns a group of tasks that share one closing signal.
///
/// Tasks spawned through the supervisor observe [`Supervisor::context`] and
/// are awaited by [`Supervisor::close`], so none of them outlives it.
#[derive(Debug)]
pub struct Supervisor {
    closing: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Supervisor that also closes when `parent` completes.
    pub fn child_of(parent: &Context) -> Self {
        Self::with_token(parent.token().child_token())
    }

    fn with_token(closing: CancellationToken) -> Self {
        Self {
            closing,
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Context that completes when the supervisor starts closing.
    pub fn context(&self) -> Context {
        Context::from_token(self.closing.clone())
    }

    pub fn closing_token(&self) -> CancellationToken {
        self.closing.clone()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            task.await;
            debug!("Task {} exited", name);
        });
    }

    /// Spawn a task that receives the supervisor's closing context.
    pub fn spawn_with<F, Fut>(&self, name: &'static str, task: F)
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(name, task(self.context()));
    }

    /// Number of tasks still running.
    pub fn task_count(&self) -> usize {
        self.tracker.len()
    }

    /// Signal closing and wait for every task to exit. Later calls return
    /// immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
