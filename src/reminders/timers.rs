//! Platform timer primitives.
//!
//! A timer is an abortable sleep that runs an arbitrary future when it fires.
//! Handles are opaque strings so they can be written back onto reminder rows.
//! Timers are deliberately not tracked for shutdown drain: a reminder may
//! sleep for thirty days.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

#[derive(Clone, Default)]
pub struct TimerService {
    inner: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timer that runs `fire` after `delay`. Returns the handle
    /// used for cancellation.
    pub fn register<F>(&self, delay: Duration, fire: F) -> String
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle_id = uuid::Uuid::new_v4().to_string();
        let registry = Arc::clone(&self.inner);
        let own_id = handle_id.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.lock().remove(&own_id);
            fire.await;
        });

        self.inner.lock().insert(handle_id.clone(), task.abort_handle());
        handle_id
    }

    /// Cancel a registered timer. Returns false when the handle is unknown
    /// (already fired, already cancelled, or lost across a restart); callers
    /// treat that as best-effort success.
    pub fn cancel(&self, handle: &str) -> bool {
        match self.inner.lock().remove(handle) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn timer_fires_after_delay_and_unregisters() {
        let timers = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        timers.register(Duration::from_millis(20), async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timers.active(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timers.active(), 0);
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let timers = TimerService::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        let handle = timers.register(Duration::from_millis(20), async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timers.cancel(&handle));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelling_an_unknown_handle_is_tolerated() {
        let timers = TimerService::new();
        assert!(!timers.cancel("gone"));
    }
}
