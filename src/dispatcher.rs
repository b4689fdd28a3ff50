//! Cooperative deferred-task dispatcher.
//!
//! All connection and pool state is touched from whichever task drives the dispatcher.
//! Work which must not run inside the current call stack is [posted](Dispatcher::post)
//! and runs on the next [turn](Dispatcher::run_once). A turn only runs the tasks which
//! were queued before it started, so a task which posts another task never sees it
//! run in the same turn.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a deferred-task queue. Cloning shares the queue.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    queue: Mutex<VecDeque<Task>>,
    notify: Notify,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Dispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` to run on the next turn.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.queue.lock().push_back(Box::new(task));
        self.inner.notify.notify_one();
    }

    /// Number of tasks waiting for a turn.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Run one turn, returning the number of tasks which ran.
    ///
    /// The queue lock is not held while tasks run, so tasks are free to post.
    pub fn run_once(&self) -> usize {
        let tasks = std::mem::take(&mut *self.inner.queue.lock());
        let ran = tasks.len();
        if ran > 0 {
            trace!(tasks = ran, "dispatcher turn");
        }
        for task in tasks {
            task();
        }
        ran
    }

    /// Run turns until a turn finds nothing to do, or `max_turns` is reached.
    ///
    /// Returns the number of turns which ran tasks.
    pub fn run_until_idle(&self, max_turns: usize) -> usize {
        let mut turns = 0;
        while turns < max_turns && self.run_once() > 0 {
            turns += 1;
        }
        turns
    }

    /// Drive the dispatcher on the current tokio task until `shutdown` resolves.
    ///
    /// Each wake-up runs exactly one turn, then yields back to the runtime so that
    /// I/O readiness gets a chance to be delivered between turns.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            if self.pending() > 0 {
                self.run_once();
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    trace!("dispatcher shutdown");
                    return;
                }
                _ = self.inner.notify.notified() => {}
            }
        }
    }
}
