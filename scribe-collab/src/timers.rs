//! Registry of outstanding delayed and repeating callbacks.
//!
//! Each timer is a Tokio task; the registry keeps its `JoinHandle` until the
//! task finishes, so [`TimerRegistry::clear_all`] can abort whatever is still
//! pending. One-shot timers deregister themselves just before running their
//! callback.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::lock;

/// Identifies a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Counts returned by [`TimerRegistry::clear_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearedTimers {
    pub timeouts: usize,
    pub intervals: usize,
}

struct Entry {
    handle: JoinHandle<()>,
    repeating: bool,
}

/// Tracks every pending timer of one owner.
///
/// Must be used from within a Tokio runtime.
pub struct TimerRegistry {
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<TimerId, Entry>>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `f` once after `delay`.
    pub fn schedule(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerId {
        let id = self.allocate();
        let pending = Arc::downgrade(&self.pending);

        // Hold the lock across spawn + insert so a zero-delay timer cannot
        // deregister before it was registered.
        let mut map = lock(&self.pending);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(pending) = pending.upgrade() {
                lock(&pending).remove(&id);
            }
            f();
        });
        map.insert(id, Entry { handle, repeating: false });
        id
    }

    /// Run `f` every `period`, first after one full period.
    pub fn schedule_repeating(
        &self,
        period: Duration,
        f: impl Fn() + Send + 'static,
    ) -> TimerId {
        let id = self.allocate();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                f();
            }
        });
        lock(&self.pending).insert(id, Entry { handle, repeating: true });
        id
    }

    /// Cancel one timer. Returns `false` if it already ran or was unknown.
    pub fn cancel(&self, id: TimerId) -> bool {
        match lock(&self.pending).remove(&id) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every pending timer.
    pub fn clear_all(&self) -> ClearedTimers {
        let drained: Vec<Entry> = lock(&self.pending).drain().map(|(_, e)| e).collect();
        let mut cleared = ClearedTimers::default();
        for entry in drained {
            entry.handle.abort();
            if entry.repeating {
                cleared.intervals += 1;
            } else {
                cleared.timeouts += 1;
            }
        }
        cleared
    }

    /// Number of timers still pending.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        lock(&self.pending).contains_key(&id)
    }

    fn allocate(&self) -> TimerId {
        TimerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.clear_all();
    }
}
