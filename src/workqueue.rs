//! Rate-limited deduplicating work queue.
//!
//! FIFO over string keys with the classic dirty/processing split: adding a
//! key already pending collapses into the existing slot, and a key re-added
//! while it is being processed is queued again only once processing finishes.
//! Together with a single worker this serializes all work per key.
//!
//! `add_rate_limited` delays the re-add with per-key exponential backoff and
//! counts requeues so the worker can give up on a key after a bounded number
//! of failures.
//!
//! The queue is a cheap clonable handle; clones share the same state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct Inner {
    queue: VecDeque<String>,
    /// Keys waiting to be processed (pending or needing reprocessing).
    dirty: HashSet<String>,
    /// Keys currently held by the worker.
    processing: HashSet<String>,
    /// Consecutive rate-limited requeues per key.
    requeues: HashMap<String, u32>,
    shutting_down: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<Inner>,
    notify: Notify,
}

#[derive(Clone, Default)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a key. Collapses into an already-pending add for the same
    /// key; a key currently being processed is marked for reprocessing
    /// instead of being queued twice.
    pub fn add(&self, key: &str) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutting_down || state.dirty.contains(key) {
                return;
            }
            state.dirty.insert(key.to_string());
            if state.processing.contains(key) {
                return;
            }
            state.queue.push_back(key.to_string());
        }
        self.shared.notify.notify_one();
    }

    /// Re-enqueue a key after a backoff that doubles with each consecutive
    /// requeue of that key.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutting_down {
                return;
            }
            let attempts = state.requeues.entry(key.to_string()).or_insert(0);
            let delay = backoff_delay(*attempts);
            *attempts += 1;
            delay
        };
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Consecutive rate-limited requeues recorded for `key`.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.shared
            .state
            .lock()
            .unwrap()
            .requeues
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Clear the requeue count for `key` (success, or giving up).
    pub fn forget(&self, key: &str) {
        self.shared.state.lock().unwrap().requeues.remove(key);
    }

    /// Pop the next key, waiting if the queue is empty. Returns `None` once
    /// the queue is shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key returned by [`get`](Self::get) as processed. If the key
    /// was re-added in the meantime it goes back on the queue.
    pub fn done(&self, key: &str) {
        let requeue = {
            let mut state = self.shared.state.lock().unwrap();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeue {
            self.shared.notify.notify_one();
        }
    }

    /// Stop accepting new work and wake the worker so it can drain and exit.
    pub fn shut_down(&self) {
        self.shared.state.lock().unwrap().shutting_down = true;
        self.shared.notify.notify_one();
    }
}

fn backoff_delay(attempts: u32) -> Duration {
    // 2^20 * 5ms already exceeds the cap; avoid the shift overflowing.
    let factor = 2u32.saturating_pow(attempts.min(20));
    BASE_DELAY.saturating_mul(factor).min(MAX_DELAY)
}
