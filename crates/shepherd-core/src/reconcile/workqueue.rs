//! Delaying workqueue with per-key serialization.
//!
//! Keys added while being processed are re-queued when processing
//! finishes, never handed to a second worker concurrently. Delayed adds
//! promote to ready when due. This is what keeps reconciliation of a
//! single task serialized no matter how many workers drain the queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

struct Inner<K> {
    ready: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    redo: HashSet<K>,
    delayed: HashMap<K, Instant>,
}

/// A work queue of reconcile keys.
pub struct Workqueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

impl<K: Eq + Hash + Clone> Workqueue<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                redo: HashSet::new(),
                delayed: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a key for immediate processing. Duplicate adds of a queued
    /// key collapse; adds of an in-flight key re-queue it after `done`.
    pub fn add(&self, key: K) {
        let mut inner = self.inner.lock().expect("workqueue lock poisoned");
        self.add_locked(&mut inner, key);
        drop(inner);
        self.notify.notify_one();
    }

    fn add_locked(&self, inner: &mut Inner<K>, key: K) {
        inner.delayed.remove(&key);
        if inner.processing.contains(&key) {
            inner.redo.insert(key);
            return;
        }
        if inner.queued.insert(key.clone()) {
            inner.ready.push_back(key);
        }
    }

    /// Enqueue a key after a delay. An earlier pending deadline wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let due = Instant::now() + delay;
        let mut inner = self.inner.lock().expect("workqueue lock poisoned");
        if inner.queued.contains(&key) {
            // Already scheduled for immediate processing.
            return;
        }
        match inner.delayed.get_mut(&key) {
            Some(existing) => {
                if due < *existing {
                    *existing = due;
                }
            }
            None => {
                inner.delayed.insert(key, due);
            }
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Wait for the next ready key. The key stays marked in-flight until
    /// [`Workqueue::done`] is called for it.
    pub async fn next(&self) -> K {
        loop {
            // Arm the notification before inspecting state so an add that
            // races this check still wakes us.
            let notified = self.notify.notified();

            let wait_until = {
                let mut inner = self.inner.lock().expect("workqueue lock poisoned");
                self.promote_due(&mut inner);

                if let Some(key) = inner.ready.pop_front() {
                    inner.queued.remove(&key);
                    inner.processing.insert(key.clone());
                    return key;
                }

                inner.delayed.values().min().copied()
            };

            match wait_until {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn promote_due(&self, inner: &mut Inner<K>) {
        let now = Instant::now();
        let due: Vec<K> = inner
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            inner.delayed.remove(&key);
            self.add_locked(inner, key);
        }
    }

    /// Mark a key's processing finished, re-queueing it if adds arrived
    /// while it was in flight.
    pub fn done(&self, key: &K) {
        let mut inner = self.inner.lock().expect("workqueue lock poisoned");
        inner.processing.remove(key);
        if inner.redo.remove(key) {
            self.add_locked(&mut inner, key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Number of keys waiting (ready or delayed).
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("workqueue lock poisoned");
        inner.ready.len() + inner.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for Workqueue<K> {
    fn default() -> Self {
        Self::new()
    }
}
