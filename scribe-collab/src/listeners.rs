//! Event subscriptions: the source side ([`ListenerSet`]) and the
//! subscriber side ([`ListenerRegistry`]).
//!
//! Transports and replicas own a `ListenerSet` and hand out
//! [`ListenerId`]s. A session records every id it obtains in its
//! `ListenerRegistry` together with a removal thunk, so teardown can
//! unsubscribe everything in one pass regardless of which source the
//! listener lives on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::CollabResult;
use crate::lock;

/// Handle returned when subscribing to an event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Listeners attached to one event source.
///
/// `emit` snapshots the callbacks before invoking them, so a callback may
/// subscribe or unsubscribe without deadlocking.
pub struct ListenerSet<E: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Callback<E>)>>,
}

impl<E: ?Sized> ListenerSet<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback.
    pub fn add(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.entries).push((id, Arc::new(callback)));
        id
    }

    /// Unregister a callback. Returns `false` for unknown ids.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Invoke every registered callback with `event`.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = lock(&self.entries)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(event);
        }
    }

    /// Drop every callback. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut entries = lock(&self.entries);
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: ?Sized> Default for ListenerSet<E> {
    fn default() -> Self {
        Self::new()
    }
}

type Removal = Box<dyn FnOnce() -> CollabResult<()> + Send>;

/// Every subscription a session holds, for guaranteed bulk removal.
pub struct ListenerRegistry {
    entries: Mutex<Vec<(&'static str, Removal)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Record a subscription. `remove` is invoked once during
    /// [`remove_all`](Self::remove_all).
    pub fn track(
        &self,
        label: &'static str,
        remove: impl FnOnce() -> CollabResult<()> + Send + 'static,
    ) {
        lock(&self.entries).push((label, Box::new(remove)));
    }

    /// Remove every tracked subscription.
    ///
    /// A failing removal is logged and skipped; it never prevents the
    /// remaining ones from running. Returns the number removed cleanly.
    pub fn remove_all(&self) -> usize {
        let drained: Vec<(&'static str, Removal)> = lock(&self.entries).drain(..).collect();
        let mut removed = 0;
        for (label, remove) in drained {
            match remove() {
                Ok(()) => removed += 1,
                Err(e) => log::debug!("Ignoring failed removal of {label} listener: {e}"),
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollabError;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listener_set_emit_and_remove() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t = total.clone();
        let id = set.add(move |v| {
            t.fetch_add(*v as usize, Ordering::SeqCst);
        });
        set.emit(&5);
        assert_eq!(total.load(Ordering::SeqCst), 5);

        assert!(set.remove(id));
        assert!(!set.remove(id));
        set.emit(&5);
        assert_eq!(total.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let set: Arc<ListenerSet<()>> = Arc::new(ListenerSet::new());
        let slot = Arc::new(Mutex::new(None::<ListenerId>));

        let (s, sl) = (set.clone(), slot.clone());
        let id = set.add(move |_| {
            if let Some(id) = *sl.lock().unwrap() {
                s.remove(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        set.emit(&());
        assert!(set.is_empty());
    }

    #[test]
    fn test_registry_removes_everything_despite_failures() {
        let registry = ListenerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let c = calls.clone();
            registry.track("test", move || {
                c.fetch_add(1, Ordering::SeqCst);
                if i == 1 {
                    Err(CollabError::UnknownListener(ListenerId(99)))
                } else {
                    Ok(())
                }
            });
        }

        assert_eq!(registry.len(), 4);
        assert_eq!(registry.remove_all(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(registry.is_empty());

        // Second pass is a no-op.
        assert_eq!(registry.remove_all(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
