//! Deduplicating, delaying, rate-limited work queue.
//!
//! A key is in at most one of three places: ready (in the FIFO), waiting
//! (in the delay heap), or processing. A key that is added while it is being
//! processed is marked dirty and goes back into the FIFO on `done`, so the
//! same key is never handed to two workers at once and an update that arrives
//! mid-processing is never lost.

pub mod rate_limit;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use self::rate_limit::{MAX_DELAY, RateLimiter};

/// Bounds every queue key must satisfy.
pub trait QueueKey: Clone + Eq + Hash + Debug + Send + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + 'static> QueueKey for T {}

/// Heap entry for a key waiting out a delay. Ordered soonest-first.
struct Waiting<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Waiting<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for Waiting<K> {}

impl<K> PartialOrd for Waiting<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Waiting<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap.
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<K> {
    /// Ready keys in delivery order. Every entry is also in `dirty`.
    queue: VecDeque<K>,
    /// Keys that need processing.
    dirty: HashSet<K>,
    /// Keys held by a worker.
    processing: HashSet<K>,
    waiting: BinaryHeap<Waiting<K>>,
    /// Authoritative ready time per waiting key; heap entries that disagree
    /// are stale and skipped.
    waiting_index: HashMap<K, (Instant, u64)>,
    next_seq: u64,
    shutting_down: bool,
}

impl<K: QueueKey> State<K> {
    /// Returns true if the key was pushed to the ready FIFO.
    fn insert(&mut self, key: K) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Move every due waiting key into the ready FIFO. Returns how many
    /// keys became ready.
    fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(head) = self.waiting.peek() {
            if head.ready_at > now {
                break;
            }
            let Some(entry) = self.waiting.pop() else {
                break;
            };
            let current = self.waiting_index.get(&entry.key).copied();
            if current != Some((entry.ready_at, entry.seq)) {
                continue;
            }
            self.waiting_index.remove(&entry.key);
            if self.insert(entry.key) {
                promoted += 1;
            }
        }
        promoted
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.waiting.peek().map(|w| w.ready_at)
    }
}

/// The work queue shared by the event adapter and the worker pool.
pub struct WorkQueue<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K: QueueKey> WorkQueue<K> {
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: BinaryHeap::new(),
                waiting_index: HashMap::new(),
                next_seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: Box::new(limiter),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: K) {
        let pushed = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.insert(key)
        };
        if pushed {
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed. If the key is already waiting,
    /// the earlier of the two ready times is kept. Delays saturate at
    /// [`MAX_DELAY`].
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let ready_at = Instant::now() + delay.min(MAX_DELAY);
        let became_head = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if let Some(&(existing, _)) = state.waiting_index.get(&key) {
                if existing <= ready_at {
                    return;
                }
            }
            let seq = state.next_seq;
            state.next_seq = state.next_seq.wrapping_add(1);
            state.waiting_index.insert(key.clone(), (ready_at, seq));
            state.waiting.push(Waiting { ready_at, seq, key });
            state.next_ready_at() == Some(ready_at)
        };
        // A sleeping `get` may be waiting on a later deadline.
        if became_head {
            self.notify.notify_waiters();
        }
    }

    /// Add `key` after the delay its rate limiter prescribes.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.when(&key);
        trace!(queue = %self.name, ?key, ?delay, "rate limited add");
        self.add_after(key, delay);
    }

    /// Clear the key's failure history.
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    /// Failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.retries(key)
    }

    /// Wait for the next ready key. Returns `None` once the queue is shut
    /// down; the caller should stop pulling work.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a wakeup between the check
            // and the await is not missed.
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.processing.insert(key.clone());
                    state.dirty.remove(&key);
                    let more = !state.queue.is_empty();
                    drop(state);
                    // Promotion may have readied keys nobody was woken for.
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                state.next_ready_at()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `key` after processing. If it was added again meanwhile it
    /// becomes ready immediately.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Number of keys ready for delivery.
    pub fn len(&self) -> usize {
        let (len, promoted) = {
            let mut state = self.lock();
            let promoted = state.promote_due(Instant::now());
            (state.queue.len(), promoted)
        };
        if promoted > 0 {
            self.notify.notify_waiters();
        }
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is currently held by a worker.
    pub fn is_processing(&self, key: &K) -> bool {
        self.lock().processing.contains(key)
    }

    /// Release every blocked and future `get` and stop accepting keys.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        trace!(queue = %self.name, "queue shutting down");
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
