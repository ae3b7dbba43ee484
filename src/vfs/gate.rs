//! One-shot gate released after the first mirror build.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Default)]
pub struct InitGate {
    ready: AtomicBool,
    notify: Notify,
}

impl InitGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Waits until `open` has been called. Returns immediately afterwards.
    pub async fn wait(&self) {
        if self.is_open() {
            return;
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before re-checking so an `open` in between is not missed.
        notified.as_mut().enable();
        if self.is_open() {
            return;
        }
        notified.await;
    }

    /// Releases all current and future waiters. Returns false if already open.
    pub fn open(&self) -> bool {
        if self.ready.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waiters_released_once_opened() {
        let gate = Arc::new(InitGate::new());
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let g = gate.clone();
            waiters.push(tokio::spawn(async move { g.wait().await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        assert!(gate.open());
        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_open_is_sticky() {
        let gate = InitGate::new();
        assert!(!gate.is_open());
        assert!(gate.open());
        assert!(!gate.open());
        tokio::time::timeout(Duration::from_millis(50), gate.wait())
            .await
            .unwrap();
    }
}
