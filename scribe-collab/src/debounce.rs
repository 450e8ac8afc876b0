//! Coalesce bursts of calls into a single trailing invocation.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::lock;

/// Trailing-edge debouncer.
///
/// Every [`run`](Debouncer::run) restarts the delay; the callback fires once
/// the delay elapses with no further `run`. Dropping the debouncer cancels
/// a pending invocation.
pub struct Debouncer {
    delay: Duration,
    callback: Arc<dyn Fn() + Send + Sync>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            delay,
            callback: Arc::new(callback),
            pending: Mutex::new(None),
        }
    }

    /// Schedule (or reschedule) the callback. Needs a Tokio runtime.
    pub fn run(&self) {
        let mut pending = lock(&self.pending);
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        let delay = self.delay;
        let callback = self.callback.clone();
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        }));
    }

    /// Drop a pending invocation. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        match lock(&self.pending).take() {
            Some(handle) => {
                let was_pending = !handle.is_finished();
                handle.abort();
                was_pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.pending)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn counting(delay_ms: u64) -> (Arc<AtomicUsize>, Debouncer) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let debouncer = Debouncer::new(Duration::from_millis(delay_ms), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, debouncer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_fires_once() {
        let (count, debouncer) = counting(200);

        for _ in 0..10 {
            debouncer.run();
            sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(debouncer.is_pending());

        sleep(Duration::from_millis(250)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_fire_separately() {
        let (count, debouncer) = counting(100);

        debouncer.run();
        sleep(Duration::from_millis(150)).await;
        debouncer.run();
        sleep(Duration::from_millis(150)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_drop_suppress_callback() {
        let (count, debouncer) = counting(100);
        debouncer.run();
        assert!(debouncer.cancel());
        assert!(!debouncer.cancel());

        debouncer.run();
        drop(debouncer);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
