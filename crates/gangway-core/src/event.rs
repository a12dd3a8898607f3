//! One-shot, multi-waiter event.
//!
//! Sessions carry two of these: `done` (the session terminated) and `ready`
//! (the caller installed its subscriber). Both fire at most once and may be
//! awaited by any number of tasks, before or after the fire.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A one-shot event that any number of tasks can wait on.
///
/// `fire` is idempotent: the first call flips the flag and wakes all waiters,
/// subsequent calls are no-ops and return `false`.
#[derive(Debug, Default)]
pub struct Event {
    fired: AtomicBool,
    notify: Notify,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the event. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Wait until the event fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        loop {
            // Register interest before checking the flag so a concurrent
            // fire() between check and await cannot be missed.
            let notified = self.notify.notified();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fire_is_idempotent() {
        let event = Event::new();
        assert!(!event.is_fired());
        assert!(event.fire());
        assert!(!event.fire());
        assert!(event.is_fired());
    }

    #[tokio::test]
    async fn wait_after_fire_returns_immediately() {
        let event = Event::new();
        event.fire();
        tokio::time::timeout(Duration::from_secs(1), event.wait())
            .await
            .expect("wait should not block after fire");
    }

    #[tokio::test]
    async fn fire_wakes_all_waiters() {
        let event = Arc::new(Event::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let event = event.clone();
            tasks.push(tokio::spawn(async move { event.wait().await }));
        }
        // Give the waiters a chance to park.
        tokio::time::sleep(Duration::from_millis(10)).await;
        event.fire();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .expect("waiter should wake")
                .unwrap();
        }
    }
}
