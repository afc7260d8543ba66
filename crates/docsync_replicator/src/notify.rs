//! Asynchronous, per-listener ordered event delivery.
//!
//! Each registered callback gets its own queue and delivery task, so events
//! reach a callback in the order they were posted, never concurrently with
//! each other, and never on the thread that posted them.

use crate::status::ListenerToken;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Callback invoked with each event.
pub type Callback<E> = Box<dyn Fn(&E) + Send + Sync>;

/// A set of callbacks for one kind of event.
pub struct Listeners<E> {
    next_token: Mutex<u64>,
    senders: Mutex<BTreeMap<u64, mpsc::UnboundedSender<E>>>,
}

impl<E: Clone + Send + 'static> Listeners<E> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            next_token: Mutex::new(0),
            senders: Mutex::new(BTreeMap::new()),
        }
    }

    /// Adds a callback delivered on the given runtime.
    pub fn add(&self, handle: &Handle, callback: Callback<E>) -> ListenerToken {
        let (tx, mut rx) = mpsc::unbounded_channel::<E>();
        handle.spawn(async move {
            while let Some(event) = rx.recv().await {
                callback(&event);
            }
        });

        let mut next = self.next_token.lock();
        *next += 1;
        let token = *next;
        self.senders.lock().insert(token, tx);
        ListenerToken(token)
    }

    /// Removes a callback. Events already queued are still delivered.
    pub fn remove(&self, token: ListenerToken) -> bool {
        self.senders.lock().remove(&token.0).is_some()
    }

    /// Queues an event for every callback.
    pub fn post(&self, event: &E) {
        let mut senders = self.senders.lock();
        senders.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Returns the number of registered callbacks.
    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    /// Returns true if no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Clone + Send + 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}
