// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! A `sync.WaitGroup` equivalent for tracking live run-loop tasks across
//! the whole swarm, so `Commander::stop_all` can wait for every pilot's
//! run-loop to actually exit instead of just asking it to.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Clone)]
pub struct WaitGroup {
    count: Arc<AtomicIsize>,
    notify: Arc<Notify>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicIsize::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn add(&self, n: isize) {
        self.count.fetch_add(n, Ordering::SeqCst);
    }

    /// Decrement and wake anyone waiting if the count reached zero.
    pub fn done(&self) {
        let remaining = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining <= 0 {
            self.notify.notify_waiters();
        }
    }

    /// Block until the count reaches zero or `timeout` elapses. Returns
    /// `true` if it reached zero, `false` on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count.load(Ordering::SeqCst) <= 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return self.count.load(Ordering::SeqCst) <= 0;
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return self.count.load(Ordering::SeqCst) <= 0,
            }
        }
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases one count from a `WaitGroup` when dropped, so a run-loop task
/// always decrements even if it returns early or panics.
pub struct WaitGroupGuard(WaitGroup);

impl WaitGroupGuard {
    pub fn new(wg: WaitGroup) -> Self {
        wg.add(1);
        Self(wg)
    }
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        self.0.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_when_already_zero() {
        let wg = WaitGroup::new();
        assert!(wg.wait(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn wait_unblocks_when_last_guard_drops() {
        let wg = WaitGroup::new();
        let guard = WaitGroupGuard::new(wg.clone());
        let wg2 = wg.clone();
        let handle = tokio::spawn(async move { wg2.wait(Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn wait_times_out_when_never_released() {
        let wg = WaitGroup::new();
        let _guard = WaitGroupGuard::new(wg.clone());
        assert!(!wg.wait(Duration::from_millis(30)).await);
    }
}
