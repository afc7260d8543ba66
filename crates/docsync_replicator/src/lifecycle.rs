//! Tracking of background tasks so owners can wait for them to finish.
//!
//! `stop()` on replicators and listeners only signals; closing a database
//! must additionally wait until every session task has exited. A
//! [`TaskGate`] counts running tasks and lets callers wait for the count to
//! reach zero, either from async code or from a blocking thread.
//!
//! A thread that drives a current-thread runtime cannot block on its own
//! tasks: [`TaskGate::wait_from_sync`] reports that case instead of hanging,
//! and the owner then finishes its teardown without the task.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Notify;

/// Outcome of [`TaskGate::wait_from_sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWait {
    /// No task is running.
    Drained,
    /// Tasks were still running when the timeout expired.
    TimedOut,
    /// Called on a current-thread runtime with tasks still running; nothing
    /// was waited for.
    WouldDeadlock,
}

#[derive(Default)]
struct GateInner {
    running: Mutex<usize>,
    drained: Condvar,
    notify: Notify,
}

/// Counter of running background tasks.
#[derive(Clone, Default)]
pub struct TaskGate {
    inner: Arc<GateInner>,
}

/// Keeps a task counted until dropped.
pub struct TaskGuard {
    inner: Arc<GateInner>,
}

impl TaskGate {
    /// Creates an empty gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a new task. Move the guard into the task.
    pub fn enter(&self) -> TaskGuard {
        *self.inner.running.lock() += 1;
        TaskGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns the number of running tasks.
    pub fn running(&self) -> usize {
        *self.inner.running.lock()
    }

    /// Waits until no task is running.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.running() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Blocks the current thread until no task is running.
    ///
    /// Must not be called from within an async task on a current-thread
    /// runtime driving the tasks being waited for.
    pub fn wait_blocking(&self) {
        let mut running = self.inner.running.lock();
        while *running > 0 {
            self.inner.drained.wait(&mut running);
        }
    }

    /// Like [`wait_blocking`](Self::wait_blocking) with a timeout. Returns
    /// false if tasks were still running when it expired.
    pub fn wait_blocking_for(&self, timeout: Duration) -> bool {
        let mut running = self.inner.running.lock();
        while *running > 0 {
            if self.inner.drained.wait_for(&mut running, timeout).timed_out() {
                return *running == 0;
            }
        }
        true
    }

    /// Waits from synchronous code that may itself be running inside a
    /// tokio runtime.
    ///
    /// On a multi-thread runtime the worker is handed over with
    /// `block_in_place` while waiting. On a current-thread runtime the
    /// tasks cannot progress while this thread blocks, so it returns
    /// [`SyncWait::WouldDeadlock`] at once.
    pub fn wait_from_sync(&self, timeout: Duration) -> SyncWait {
        if self.running() == 0 {
            return SyncWait::Drained;
        }
        let drained = match Handle::try_current().map(|h| h.runtime_flavor()) {
            Ok(RuntimeFlavor::CurrentThread) => return SyncWait::WouldDeadlock,
            Ok(_) => tokio::task::block_in_place(|| self.wait_blocking_for(timeout)),
            Err(_) => self.wait_blocking_for(timeout),
        };
        if drained {
            SyncWait::Drained
        } else {
            SyncWait::TimedOut
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut running = self.inner.running.lock();
        *running = running.saturating_sub(1);
        if *running == 0 {
            self.inner.drained.notify_all();
            self.inner.notify.notify_waiters();
        }
    }
}

impl std::fmt::Debug for TaskGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGate")
            .field("running", &self.running())
            .finish()
    }
}
