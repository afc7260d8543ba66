//! Registry of resources that must be stopped before a database closes.
//!
//! Replicators and listeners register a weak handle here when they start
//! and unregister when they stop. Closing or deleting the database first
//! stops every live resource and waits for it.
//!
//! The registry lock is re-entrant: a resource's `stop_and_wait` may call
//! back into the registry (typically to unregister itself) on the closing
//! thread. The lock is released before waiting on resources, so background
//! tasks that unregister from other threads cannot deadlock against close.

use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// A long-lived object bound to a database.
pub trait ActiveResource: Send + Sync {
    /// Asks the resource to stop and blocks until it has.
    fn stop_and_wait(&self);

    /// Short description for logging.
    fn describe(&self) -> String {
        "active resource".to_string()
    }
}

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceToken(u64);

#[derive(Default)]
struct RegistryInner {
    next_token: u64,
    closing: bool,
    resources: BTreeMap<u64, Weak<dyn ActiveResource>>,
}

/// The set of active resources of one database.
#[derive(Default)]
pub struct ActiveResourceRegistry {
    inner: ReentrantMutex<RefCell<RegistryInner>>,
}

impl ActiveResourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource.
    ///
    /// Returns None if the registry is shutting down; the caller must not
    /// start in that case.
    pub fn register(&self, resource: Weak<dyn ActiveResource>) -> Option<ResourceToken> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.closing {
            return None;
        }
        inner.next_token += 1;
        let token = inner.next_token;
        inner.resources.insert(token, resource);
        Some(ResourceToken(token))
    }

    /// Unregisters a resource. Returns false if it was not registered.
    pub fn unregister(&self, token: ResourceToken) -> bool {
        let guard = self.inner.lock();
        let removed = guard.borrow_mut().resources.remove(&token.0).is_some();
        removed
    }

    /// Returns the number of registered resources that are still alive.
    pub fn len(&self) -> usize {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner
            .resources
            .values()
            .filter(|r| r.strong_count() > 0)
            .count()
    }

    /// Returns true if no live resources are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops every live resource and waits for each, then clears the registry.
    ///
    /// After this call new registrations are refused.
    pub fn stop_all(&self) {
        let live: Vec<Arc<dyn ActiveResource>> = {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            inner.closing = true;
            inner.resources.values().filter_map(Weak::upgrade).collect()
        };

        for resource in live {
            tracing::debug!(resource = %resource.describe(), "stopping active resource");
            resource.stop_and_wait();
        }

        let guard = self.inner.lock();
        guard.borrow_mut().resources.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        stops: AtomicUsize,
    }

    impl ActiveResource for Counter {
        fn stop_and_wait(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counter() -> Arc<Counter> {
        Arc::new(Counter {
            stops: AtomicUsize::new(0),
        })
    }

    fn weak(resource: &Arc<Counter>) -> Weak<dyn ActiveResource> {
        let resource: Arc<dyn ActiveResource> = resource.clone();
        Arc::downgrade(&resource)
    }

    #[test]
    fn register_and_unregister() {
        let registry = ActiveResourceRegistry::new();
        let a = counter();
        let token = registry.register(weak(&a)).unwrap();
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(token));
        assert!(!registry.unregister(token));
        assert!(registry.is_empty());
    }

    #[test]
    fn dropped_resources_are_not_counted() {
        let registry = ActiveResourceRegistry::new();
        let a = counter();
        registry.register(weak(&a)).unwrap();
        drop(a);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn stop_all_stops_each_once_and_refuses_new() {
        let registry = ActiveResourceRegistry::new();
        let a = counter();
        let b = counter();
        registry.register(weak(&a)).unwrap();
        registry.register(weak(&b)).unwrap();

        registry.stop_all();
        assert_eq!(a.stops.load(Ordering::SeqCst), 1);
        assert_eq!(b.stops.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
        assert!(registry.register(weak(&a)).is_none());
    }

    struct SelfUnregistering {
        registry: Arc<ActiveResourceRegistry>,
        token: Mutex<Option<ResourceToken>>,
    }

    impl ActiveResource for SelfUnregistering {
        fn stop_and_wait(&self) {
            if let Some(token) = self.token.lock().take() {
                self.registry.unregister(token);
            }
        }
    }

    #[test]
    fn stop_may_reenter_registry() {
        let registry = Arc::new(ActiveResourceRegistry::new());
        let resource = Arc::new(SelfUnregistering {
            registry: Arc::clone(&registry),
            token: Mutex::new(None),
        });
        let dyn_resource: Arc<dyn ActiveResource> = resource.clone();
        let token = registry.register(Arc::downgrade(&dyn_resource)).unwrap();
        *resource.token.lock() = Some(token);

        registry.stop_all();
        assert!(registry.is_empty());
        assert!(resource.token.lock().is_none());
    }
}
