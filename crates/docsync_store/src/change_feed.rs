//! Change feed for observing committed document changes.
//!
//! Every save, delete, purge and applied remote revision emits one
//! [`ChangeEvent`] after it is committed. Subscribers receive events in
//! commit order through an unbounded tokio channel, so an async replication
//! task can `select!` over the feed alongside its network connection.

use crate::revision::RevisionId;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Type of change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// A new revision was stored.
    Save,
    /// A deletion tombstone was stored.
    Delete,
    /// The document was removed entirely.
    Purge,
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Made through the local API (including conflict merges).
    Local,
    /// Received from a replication peer.
    Remote,
}

/// A single committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Sequence number of the commit.
    pub sequence: u64,
    /// Changed document.
    pub doc_id: String,
    /// New current revision. None for purges.
    pub rev_id: Option<RevisionId>,
    /// Type of change.
    pub change_type: ChangeType,
    /// Where the change came from.
    pub origin: ChangeOrigin,
}

/// Distributes committed changes to subscribers.
#[derive(Default)]
pub struct ChangeFeed {
    subscribers: RwLock<Vec<UnboundedSender<ChangeEvent>>>,
}

impl ChangeFeed {
    /// Creates a new change feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to all future change events.
    pub fn subscribe(&self) -> UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits a change event to all subscribers, dropping closed ones.
    pub fn emit(&self, event: ChangeEvent) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drops all subscribers, closing their receivers.
    pub fn close(&self) {
        self.subscribers.write().clear();
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(sequence: u64) -> ChangeEvent {
        ChangeEvent {
            sequence,
            doc_id: format!("doc-{sequence}"),
            rev_id: None,
            change_type: ChangeType::Save,
            origin: ChangeOrigin::Local,
        }
    }

    #[test]
    fn emit_and_receive_in_order() {
        let feed = ChangeFeed::new();
        let mut rx = feed.subscribe();

        for i in 1..=3 {
            feed.emit(event(i));
        }

        for i in 1..=3 {
            assert_eq!(rx.try_recv().unwrap().sequence, i);
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn multiple_subscribers() {
        let feed = ChangeFeed::new();
        let mut rx1 = feed.subscribe();
        let mut rx2 = feed.subscribe();

        feed.emit(event(7));

        assert_eq!(rx1.try_recv().unwrap(), event(7));
        assert_eq!(rx2.try_recv().unwrap(), event(7));
    }

    #[test]
    fn subscriber_cleanup() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit(event(1));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_ends_receivers() {
        let feed = ChangeFeed::new();
        let mut rx = feed.subscribe();
        feed.close();
        assert!(rx.recv().await.is_none());
    }
}
