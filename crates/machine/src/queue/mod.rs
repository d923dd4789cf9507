//! Rate-limited, de-duplicating work queue feeding the reconcile workers.
//!
//! Keys are machine names. A key that is queued twice collapses into one
//! entry; a key re-added while a worker holds it is parked and re-queued
//! the moment the worker calls [`WorkQueue::done`]. Failed keys come back
//! through an exponential per-key backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::trace;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(300);

/// Per-key retry delay: doubles with every recorded failure until hitting
/// the cap, starting over once the failure count is forgotten.
#[derive(Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: BASE_DELAY,
            cap: MAX_DELAY,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the nth consecutive retry (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap);
        delay.min(self.cap)
    }
}

#[derive(Default)]
struct Inner {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
}

/// The queue itself. Shared between the informer tasks (producers) and the
/// worker pool (consumers) behind an [`Arc`].
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    shutdown: AtomicBool,
    backoff: ExponentialBackoff,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

impl WorkQueue {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        WorkQueue {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            backoff,
        }
    }

    /// Queue a key. Idempotent: a key already queued is left alone, a key
    /// currently in flight is parked and re-queued on [`WorkQueue::done`].
    pub async fn add(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        if inner.in_flight.contains(key) {
            trace!(%key, "key in flight, marking dirty");
            inner.dirty.insert(key.to_string());
            return;
        }
        if inner.queued.insert(key.to_string()) {
            inner.ready.push_back(key.to_string());
            self.notify.notify_one();
        }
    }

    /// Queue a key after a fixed delay. Used for the post-delete polling
    /// periods, where the wait is policy rather than punishment.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key).await;
        });
    }

    /// Queue a key with the exponential backoff derived from its failure
    /// count, and bump that count.
    pub async fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let failures = {
            let mut inner = self.inner.lock().await;
            let failures = inner.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            *failures
        };
        let delay = self.backoff.delay(failures);
        trace!(%key, failures, ?delay, "re-queueing with backoff");
        self.add_after(key, delay);
    }

    /// Block until a key is ready, marking it in flight. Returns `None` once
    /// the queue has been shut down and drained of waiters.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().await;
                if let Some(key) = inner.ready.pop_front() {
                    inner.queued.remove(&key);
                    inner.in_flight.insert(key.clone());
                    return Some(key);
                }
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Release the in-flight mark. If the key was re-added while being
    /// processed it goes straight back into the ready list, so no signal
    /// observed during processing is ever lost.
    pub async fn done(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(key);
        if inner.dirty.remove(key) && inner.queued.insert(key.to_string()) {
            inner.ready.push_back(key.to_string());
            self.notify.notify_one();
        }
    }

    /// Reset the failure count for a key after a clean reconcile.
    pub async fn forget(&self, key: &str) {
        self.inner.lock().await.failures.remove(key);
    }

    /// Wake all blocked workers and make subsequent `get` calls return
    /// `None` once the ready list is empty.
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    async fn failure_count(&self, key: &str) -> u32 {
        *self.inner.lock().await.failures.get(key).unwrap_or(&0)
    }
}
