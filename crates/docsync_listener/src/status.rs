//! Connection accounting.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Snapshot of a listener's connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStatus {
    /// Open sockets, including those still authenticating.
    pub connection_count: u64,
    /// Connections whose replication session has been accepted and is
    /// exchanging documents.
    pub active_connection_count: u64,
}

/// Shared counters behind [`ListenerStatus`].
///
/// Both counts live under one lock so a snapshot never shows more active
/// connections than open ones.
#[derive(Debug, Default)]
pub(crate) struct ConnectionCounters {
    status: Mutex<ListenerStatus>,
}

impl ConnectionCounters {
    pub(crate) fn snapshot(&self) -> ListenerStatus {
        *self.status.lock()
    }

    /// Counts a newly accepted socket until the guard is dropped.
    pub(crate) fn open(self: &Arc<Self>) -> ConnectionGuard {
        self.status.lock().connection_count += 1;
        ConnectionGuard {
            counters: Arc::clone(self),
            active: AtomicBool::new(false),
        }
    }
}

/// One accepted connection.
#[derive(Debug)]
pub(crate) struct ConnectionGuard {
    counters: Arc<ConnectionCounters>,
    active: AtomicBool,
}

impl ConnectionGuard {
    /// Marks the connection active. Only the first call counts.
    pub(crate) fn activate(&self) {
        let mut status = self.counters.status.lock();
        if !self.active.swap(true, Ordering::AcqRel) {
            status.active_connection_count += 1;
        }
    }

    /// Marks the session finished while the socket may still be open.
    /// Only the first call after `activate` counts.
    pub(crate) fn deactivate(&self) {
        let mut status = self.counters.status.lock();
        if self.active.swap(false, Ordering::AcqRel) {
            status.active_connection_count = status.active_connection_count.saturating_sub(1);
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut status = self.counters.status.lock();
        if self.active.swap(false, Ordering::AcqRel) {
            status.active_connection_count = status.active_connection_count.saturating_sub(1);
        }
        status.connection_count = status.connection_count.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn guard_lifecycle() {
        let counters = Arc::new(ConnectionCounters::default());
        let a = counters.open();
        let b = counters.open();
        assert_eq!(counters.snapshot().connection_count, 2);
        assert_eq!(counters.snapshot().active_connection_count, 0);

        a.activate();
        a.activate();
        assert_eq!(counters.snapshot().active_connection_count, 1);

        a.deactivate();
        a.deactivate();
        assert_eq!(counters.snapshot().active_connection_count, 0);
        assert_eq!(counters.snapshot().connection_count, 2);

        b.activate();
        drop(b);
        assert_eq!(
            counters.snapshot(),
            ListenerStatus {
                connection_count: 1,
                active_connection_count: 0
            }
        );
        drop(a);
        assert_eq!(counters.snapshot(), ListenerStatus::default());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Open,
        Activate(usize),
        Deactivate(usize),
        Close(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Open),
            any::<usize>().prop_map(Op::Activate),
            any::<usize>().prop_map(Op::Deactivate),
            any::<usize>().prop_map(Op::Close),
        ]
    }

    proptest! {
        #[test]
        fn active_never_exceeds_open(ops in prop::collection::vec(op_strategy(), 0..200)) {
            let counters = Arc::new(ConnectionCounters::default());
            let mut guards: Vec<ConnectionGuard> = Vec::new();

            for op in ops {
                match op {
                    Op::Open => guards.push(counters.open()),
                    Op::Activate(i) if !guards.is_empty() => guards[i % guards.len()].activate(),
                    Op::Deactivate(i) if !guards.is_empty() => guards[i % guards.len()].deactivate(),
                    Op::Close(i) if !guards.is_empty() => {
                        let len = guards.len();
                        drop(guards.swap_remove(i % len));
                    }
                    _ => {}
                }
                let status = counters.snapshot();
                prop_assert!(status.active_connection_count <= status.connection_count);
                prop_assert_eq!(status.connection_count, guards.len() as u64);
            }

            guards.clear();
            prop_assert_eq!(counters.snapshot(), ListenerStatus::default());
        }
    }
}
