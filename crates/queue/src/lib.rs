//! Refuge change queue: a deduplicating, rate-limited work queue of object keys.
//!
//! A key lives in at most one of three places: pending (in `queue`), waiting for a
//! delayed add, or in flight. Adding a key that is pending or in flight only marks it
//! dirty; a dirty in-flight key goes back to pending when the worker calls [`WorkQueue::done`].

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use refuge_core::ChangeHandler;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

pub mod limiter;

pub use limiter::{default_controller_rate_limiter, ItemExponentialBackoff, MaxOf, RateLimiter, TokenBucket};

/// Cloneable handle to a shared work queue.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

struct Shared<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    waiting: BinaryHeap<Waiting<K>>,
    ready_at: FxHashMap<K, Instant>,
    limiter: Box<dyn RateLimiter<K>>,
    shutting_down: bool,
    seq: u64,
}

/// Delayed add; ordered so the heap pops the earliest deadline first.
struct Waiting<K> {
    at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Waiting<K> {
    fn eq(&self, other: &Self) -> bool { self.at == other.at && self.seq == other.seq }
}

impl<K> Eq for Waiting<K> {}

impl<K> PartialOrd for Waiting<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl<K> Ord for Waiting<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<K: Hash + Eq + Clone> State<K> {
    /// Returns true when the key became pending (a waiter should be woken).
    fn insert(&mut self, key: K) -> bool {
        if self.shutting_down || self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn schedule(&mut self, key: K, delay: Duration) -> bool {
        if self.shutting_down {
            return false;
        }
        if delay.is_zero() {
            return self.insert(key);
        }
        let at = Instant::now() + delay;
        if let Some(existing) = self.ready_at.get(&key) {
            if *existing <= at {
                return false;
            }
        }
        self.seq = self.seq.wrapping_add(1);
        self.ready_at.insert(key.clone(), at);
        self.waiting.push(Waiting { at, seq: self.seq, key });
        // wake the consumer so it re-arms its timer on the new deadline
        true
    }

    fn promote_due(&mut self, now: Instant) {
        while self.waiting.peek().is_some_and(|w| w.at <= now) {
            let Some(w) = self.waiting.pop() else { break };
            // stale heap entries are superseded by an earlier deadline for the same key
            if self.ready_at.get(&w.key) == Some(&w.at) {
                self.ready_at.remove(&w.key);
                self.insert(w.key);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> { self.waiting.peek().map(|w| w.at) }

    /// Take `key` out of flight. Returns the new pending depth when it was dirty and went back to pending.
    fn release(&mut self, key: &K) -> Option<usize> {
        self.processing.remove(key);
        if self.dirty.contains(key) {
            self.queue.push_back(key.clone());
            Some(self.queue.len())
        } else {
            None
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Hash + Eq + Clone + Send + 'static,
{
    /// Queue retrying failed keys with [`default_controller_rate_limiter`].
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, Box::new(default_controller_rate_limiter()))
    }

    pub fn with_rate_limiter(name: impl Into<String>, limiter: Box<dyn RateLimiter<K>>) -> Self {
        let state = State {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            waiting: BinaryHeap::new(),
            ready_at: FxHashMap::default(),
            limiter,
            shutting_down: false,
            seq: 0,
        };
        Self { shared: Arc::new(Shared { name: name.into(), state: Mutex::new(state), notify: Notify::new() }) }
    }

    pub fn name(&self) -> &str { &self.shared.name }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_depth(&self, depth: usize) {
        gauge!("workqueue_depth", depth as f64, "queue" => self.shared.name.clone());
    }

    /// Schedule `key`. No-op beyond marking it dirty when already pending or in flight.
    pub fn add(&self, key: K) {
        let (woke, depth) = {
            let mut st = self.lock();
            let woke = st.insert(key);
            (woke, st.queue.len())
        };
        if woke {
            counter!("workqueue_adds_total", 1, "queue" => self.shared.name.clone());
            self.record_depth(depth);
            self.shared.notify.notify_one();
        }
    }

    /// Schedule `key` once `delay` has elapsed. Pending delays of the same key collapse
    /// to the earliest deadline.
    pub fn add_after(&self, key: K, delay: Duration) {
        let woke = self.lock().schedule(key, delay);
        if woke {
            self.shared.notify.notify_one();
        }
    }

    /// Re-add `key` after the rate limiter's delay, counting one more failure for it.
    pub fn add_rate_limited(&self, key: K) {
        let woke = {
            let mut st = self.lock();
            let delay = st.limiter.when(&key);
            trace!(queue = %self.shared.name, delay_ms = delay.as_millis() as u64, "rate limited re-add");
            st.schedule(key, delay)
        };
        counter!("workqueue_retries_total", 1, "queue" => self.shared.name.clone());
        if woke {
            self.shared.notify.notify_one();
        }
    }

    /// Wait for the next key and mark it in flight. `None` once the queue is shut down
    /// and has no pending keys left.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut st = self.lock();
                st.promote_due(Instant::now());
                if let Some(key) = st.queue.pop_front() {
                    st.processing.insert(key.clone());
                    st.dirty.remove(&key);
                    let depth = st.queue.len();
                    drop(st);
                    self.record_depth(depth);
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
                st.next_deadline()
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

    /// Release an in-flight key; it is queued again if it was added while in flight.
    pub fn done(&self, key: &K) {
        let requeued = self.lock().release(key);
        if let Some(depth) = requeued {
            self.record_depth(depth);
            self.shared.notify.notify_one();
        }
    }

    /// Clear the retry history of `key`.
    pub fn forget(&self, key: &K) { self.lock().limiter.forget(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.lock().limiter.num_requeues(key) }

    /// Pending keys, not counting in-flight or delayed ones.
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Refuse new keys, drop delayed ones and wake every waiter. Keys already pending are
    /// still handed out by [`WorkQueue::get`] before it reports shutdown.
    pub fn shut_down(&self) {
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            st.waiting.clear();
            st.ready_at.clear();
        }
        debug!(queue = %self.shared.name, "queue shutting down");
        self.shared.notify.notify_waiters();
    }
}

impl ChangeHandler for WorkQueue<String> {
    fn on_change(&self, key: String) { self.add(key) }
}
