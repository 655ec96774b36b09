//! Fan-out of state-change notifications to independently registered
//! observers, keyed by a caller-supplied listener id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::protocol::PlayerEvent;

type Callback = Box<dyn Fn(&PlayerEvent) + Send>;

/// Capability handle returned by [`ListenerRegistry::add`]. Removing requires
/// the handle, so a stale handle cannot unregister a listener that replaced
/// it under the same id.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: String,
    nonce: u64,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }
}

struct Entry {
    nonce: u64,
    callback: Callback,
}

/// Registry of `(id, callback)` pairs. Registering an id that is already
/// present replaces the previous listener.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
    next_nonce: Arc<AtomicU64>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        id: impl Into<String>,
        callback: impl Fn(&PlayerEvent) + Send + 'static,
    ) -> Subscription {
        let id = id.into();
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(&id) {
            debug!("ListenerRegistry: replacing listener '{}'", id);
        }
        inner.insert(
            id.clone(),
            Entry {
                nonce,
                callback: Box::new(callback),
            },
        );
        Subscription { id, nonce }
    }

    pub fn remove(&self, subscription: &Subscription) {
        let mut inner = self.inner.lock().unwrap();
        let matches = inner
            .get(&subscription.id)
            .map(|entry| entry.nonce == subscription.nonce)
            .unwrap_or(false);
        if matches {
            inner.remove(&subscription.id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch(&self, event: &PlayerEvent) {
        let inner = self.inner.lock().unwrap();
        for entry in inner.values() {
            (entry.callback)(event);
        }
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PlaybackState;
    use std::sync::atomic::AtomicUsize;

    fn counting_listener(counter: Arc<AtomicUsize>) -> impl Fn(&PlayerEvent) + Send {
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dispatch_reaches_every_listener() {
        let registry = ListenerRegistry::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let _sub_a = registry.add("client-a", counting_listener(a.clone()));
        let _sub_b = registry.add("client-b", counting_listener(b.clone()));

        registry.dispatch(&PlayerEvent::PlaybackStateChanged(PlaybackState::Playing));
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_listener_stops_receiving() {
        let registry = ListenerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sub = registry.add("client", counting_listener(count.clone()));
        registry.remove(&sub);
        registry.dispatch(&PlayerEvent::StalledChanged(true));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregistering_an_id_replaces_the_listener() {
        let registry = ListenerRegistry::new();
        let old = Arc::new(AtomicUsize::new(0));
        let new = Arc::new(AtomicUsize::new(0));
        let _old_sub = registry.add("client", counting_listener(old.clone()));
        let _new_sub = registry.add("client", counting_listener(new.clone()));

        registry.dispatch(&PlayerEvent::BufferingUpdated(50));
        assert_eq!(old.load(Ordering::SeqCst), 0);
        assert_eq!(new.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_subscription_cannot_remove_replacement() {
        let registry = ListenerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let stale = registry.add("client", |_| {});
        let _current = registry.add("client", counting_listener(count.clone()));

        registry.remove(&stale);
        registry.dispatch(&PlayerEvent::StalledChanged(false));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
