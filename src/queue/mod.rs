//! Rate-limited work queue with per-key deduplication.
//!
//! Semantics: at most one instance of a key is queued at a time, and a key
//! being processed is owned by exactly one worker. Re-adds during
//! processing are deferred until [`WorkQueue::done`] and coalesce into a
//! single requeue. Retries back off exponentially and reset on
//! [`WorkQueue::forget`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    retries: HashMap<K, u32>,
    shutdown: bool,
}

impl<K> Default for State<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            retries: HashMap::new(),
            shutdown: false,
        }
    }
}

pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    /// Enqueues the key unless it is already queued. A key currently being
    /// processed is marked dirty and requeued when its worker finishes.
    pub fn add(&self, key: K) {
        let mut state = self.state.lock().unwrap();
        if state.shutdown || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueues the key after a delay.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Enqueues the key with exponential backoff based on its retry count.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = {
            let mut state = self.state.lock().unwrap();
            let retries = state.retries.entry(key.clone()).or_insert(0);
            *retries += 1;
            backoff(self.base_delay, self.max_delay, *retries)
        };
        self.add_after(key, delay);
    }

    /// Waits for the next key. Returns None once the queue is shut down and
    /// drained. The key is owned by the caller until [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    // Another item may still be queued for another worker.
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Releases a key obtained from [`WorkQueue::get`]. A deferred re-add
    /// puts it back on the queue.
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutdown {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Resets the retry counter after a success.
    pub fn forget(&self, key: &K) {
        self.state.lock().unwrap().retries.remove(key);
    }

    pub fn num_retries(&self, key: &K) -> u32 {
        self.state
            .lock()
            .unwrap()
            .retries
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the queue: pending gets return None, further adds are dropped.
    pub fn shut_down(&self) {
        self.state.lock().unwrap().shutdown = true;
        self.notify.notify_waiters();
    }
}

/// Exponential backoff: `base * 2^(retries-1)`, capped at `max`.
fn backoff(base: Duration, max: Duration, retries: u32) -> Duration {
    let exp = retries.saturating_sub(1).min(63);
    let delay = base.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
    delay.min(max)
}
