//! Deduplicating, rate-limited work queue.
//!
//! Keys flow through three disjoint states, following the classic
//! controller workqueue discipline: *ready* (FIFO, waiting for a worker),
//! *dirty* (known to need work), and *processing* (checked out by exactly
//! one worker). An add for a key already pending coalesces; an add for a
//! key in flight defers until `done`. Delayed re-adds park in a min-heap
//! and promote when due; the earliest scheduled deadline for a key wins,
//! and a direct `add` supersedes any schedule.
//!
//! Once `shut_down` runs, `get` never returns another item.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;

use operon_core::BackoffPolicy;

struct Delayed<T> {
    at: Instant,
    item: T,
}

// Min-heap on deadline; the item itself never participates in ordering.
impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl<T> Eq for Delayed<T> {}

impl<T> PartialOrd for Delayed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Delayed<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at)
    }
}

struct State<T> {
    ready: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    delayed: BinaryHeap<Delayed<T>>,
    deadlines: FxHashMap<T, Instant>,
    attempts: FxHashMap<T, u32>,
    shutting_down: bool,
}

impl<T> State<T> {
    fn record_depth(&self) {
        metrics::gauge!("queue_depth", self.ready.len() as f64);
    }
}

impl<T: Clone + Eq + Hash> State<T> {
    /// Returns true when the item landed in the ready deque (a wake-up is
    /// warranted); false when it coalesced, deferred, or was refused.
    fn insert_ready(&mut self, item: T) -> bool {
        if self.shutting_down {
            return false;
        }
        if self.dirty.contains(&item) {
            return false;
        }
        self.deadlines.remove(&item);
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            // Deferred: surfaces when the in-flight slot frees up.
            return false;
        }
        self.ready.push_back(item);
        self.record_depth();
        true
    }

    fn promote_due(&mut self, now: Instant) {
        loop {
            let due = matches!(self.delayed.peek(), Some(d) if d.at <= now);
            if !due {
                break;
            }
            if let Some(Delayed { at, item }) = self.delayed.pop() {
                // Entries superseded by a sooner schedule or a direct add
                // no longer match the deadline map and are skipped.
                if self.deadlines.get(&item) == Some(&at) {
                    self.deadlines.remove(&item);
                    self.insert_ready(item);
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|d| d.at)
    }
}

/// Shared work queue handing out keys to a worker pool.
///
/// All methods take `&self`; clone-free sharing happens through an
/// `Arc<WorkQueue<_>>`. The critical sections are short and never held
/// across an await.
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    wake: watch::Sender<u64>,
    policy: BackoffPolicy,
}

impl<T: Clone + Eq + Hash + Debug> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Eq + Hash + Debug> WorkQueue<T> {
    pub fn new() -> Self {
        Self::with_policy(BackoffPolicy::default())
    }

    pub fn with_policy(policy: BackoffPolicy) -> Self {
        let (wake, _) = watch::channel(0u64);
        Self {
            state: Mutex::new(State {
                ready: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                delayed: BinaryHeap::new(),
                deadlines: FxHashMap::default(),
                attempts: FxHashMap::default(),
                shutting_down: false,
            }),
            wake,
            policy,
        }
    }

    /// Idempotent insert: a no-op while the key is already pending, deferred
    /// while it is in flight.
    pub fn add(&self, item: T) {
        let woke = self.lock().insert_ready(item);
        if woke {
            metrics::counter!("queue_adds_total", 1u64);
            self.bump();
        }
    }

    /// Insert after `delay`. The earliest scheduled deadline for a key wins;
    /// a direct `add` cancels any schedule.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        let scheduled = {
            let mut s = self.lock();
            if s.shutting_down {
                false
            } else {
                let at = Instant::now() + delay;
                match s.deadlines.get(&item) {
                    Some(cur) if *cur <= at => false,
                    _ => {
                        s.deadlines.insert(item.clone(), at);
                        s.delayed.push(Delayed { at, item });
                        true
                    }
                }
            }
        };
        if scheduled {
            // Parked getters recompute their wake-up deadline.
            self.bump();
        }
    }

    /// Insert after the key's backoff delay, bumping its attempt counter.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut s = self.lock();
            if s.shutting_down {
                return;
            }
            let n = s.attempts.entry(item.clone()).or_insert(0);
            *n += 1;
            self.policy.delay(*n)
        };
        metrics::counter!("queue_retries_total", 1u64);
        trace!(item = ?item, delay_ms = delay.as_millis() as u64, "rate-limited re-add");
        self.add_after(item, delay);
    }

    /// Next key to work on, or `None` once the queue is shut down. A key
    /// stays invisible to other callers until its `done`.
    pub async fn get(&self) -> Option<T> {
        let mut rx = self.wake.subscribe();
        loop {
            rx.borrow_and_update();
            let parked_until = {
                let mut s = self.lock();
                if s.shutting_down {
                    return None;
                }
                s.promote_due(Instant::now());
                if let Some(item) = s.ready.pop_front() {
                    s.dirty.remove(&item);
                    s.processing.insert(item.clone());
                    s.record_depth();
                    return Some(item);
                }
                s.next_deadline()
            };
            match parked_until {
                Some(at) => {
                    tokio::select! {
                        _ = rx.changed() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => {
                    // The sender lives inside `self`, so this cannot fail
                    // while we are borrowed from it.
                    let _ = rx.changed().await;
                }
            }
        }
    }

    /// Release the key's in-flight slot. A re-add that arrived while it was
    /// in flight becomes eligible immediately.
    pub fn done(&self, item: &T) {
        let woke = {
            let mut s = self.lock();
            s.processing.remove(item);
            if s.dirty.contains(item) && !s.shutting_down {
                s.ready.push_back(item.clone());
                s.record_depth();
                true
            } else {
                false
            }
        };
        if woke {
            self.bump();
        }
    }

    /// Reset the key's failure counter; the next failure backs off from the
    /// base delay again.
    pub fn forget(&self, item: &T) {
        self.lock().attempts.remove(item);
    }

    /// Consecutive failures recorded for the key.
    pub fn retries(&self, item: &T) -> u32 {
        self.lock().attempts.get(item).copied().unwrap_or(0)
    }

    /// Keys waiting for a worker; excludes in-flight and scheduled ones.
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop delivering work. Blocked and future `get` calls observe the
    /// shutdown immediately; pending and scheduled keys are discarded.
    /// In-flight keys may still be `done`d.
    pub fn shut_down(&self) {
        {
            let mut s = self.lock();
            s.shutting_down = true;
            s.ready.clear();
            s.dirty.clear();
            s.delayed.clear();
            s.deadlines.clear();
            s.attempts.clear();
            s.record_depth();
        }
        self.bump();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    fn bump(&self) {
        self.wake.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
