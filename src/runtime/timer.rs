//! Min-heap timer keyed by connection id.
//!
//! Entries are ordered by absolute expiry. An auxiliary `id -> index` map
//! gives O(log n) reschedule and removal of an arbitrary entry; it is kept
//! in step with the array on every swap.
//!
//! The heap is single-threaded: only the event loop thread touches it.
//! Expiry callbacks receive `&mut C`, a context owned by the caller, so an
//! eviction can mutate event-loop state without shared ownership.

#![allow(dead_code)] // The event loop expires entries only through `next_delay`

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Callback run when an entry expires.
pub type TimeoutCallback<C> = Box<dyn FnOnce(&mut C)>;

struct TimerNode<K, C> {
    id: K,
    expires: Instant,
    callback: TimeoutCallback<C>,
}

/// Binary min-heap of timeouts.
pub struct TimerHeap<K, C> {
    heap: Vec<TimerNode<K, C>>,
    index: HashMap<K, usize>,
}

impl<K, C> Default for TimerHeap<K, C>
where
    K: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, C> TimerHeap<K, C>
where
    K: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::with_capacity(64),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: K) -> bool {
        self.index.contains_key(&id)
    }

    /// Schedule `id` to fire `timeout` from now, replacing any existing entry.
    pub fn add_or_update(&mut self, id: K, timeout: Duration, callback: TimeoutCallback<C>) {
        self.schedule(id, Instant::now() + timeout, callback);
    }

    /// Schedule `id` to fire at `expires`, replacing any existing entry.
    pub fn schedule(&mut self, id: K, expires: Instant, callback: TimeoutCallback<C>) {
        match self.index.get(&id).copied() {
            None => {
                let i = self.heap.len();
                self.index.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires,
                    callback,
                });
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].callback = callback;
                let n = self.heap.len();
                if !self.sift_down(i, n) {
                    self.sift_up(i);
                }
            }
        }
    }

    /// Push the expiry of an existing entry to `timeout` from now.
    ///
    /// Returns false if `id` has no entry.
    pub fn adjust(&mut self, id: K, timeout: Duration) -> bool {
        self.adjust_to(id, Instant::now() + timeout)
    }

    /// Move the expiry of an existing entry to `expires`.
    pub fn adjust_to(&mut self, id: K, expires: Instant) -> bool {
        let Some(i) = self.index.get(&id).copied() else {
            return false;
        };
        self.heap[i].expires = expires;
        let n = self.heap.len();
        if !self.sift_down(i, n) {
            self.sift_up(i);
        }
        true
    }

    /// Remove the entry for `id` without running its callback.
    pub fn cancel(&mut self, id: K) -> bool {
        match self.index.get(&id).copied() {
            Some(i) => {
                self.del_timer(i);
                true
            }
            None => false,
        }
    }

    /// Run the callback for `id` immediately and remove the entry.
    pub fn fire(&mut self, id: K, ctx: &mut C) -> bool {
        match self.index.get(&id).copied() {
            Some(i) => {
                let node = self.del_timer(i);
                (node.callback)(ctx);
                true
            }
            None => false,
        }
    }

    /// Remove the root entry without running its callback.
    pub fn pop(&mut self) -> Option<K> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.del_timer(0).id)
    }

    /// Run and remove every entry that has expired by now.
    pub fn tick(&mut self, ctx: &mut C) -> usize {
        self.tick_at(Instant::now(), ctx)
    }

    /// Run and remove every entry with `expires <= now`, in expiry order.
    pub fn tick_at(&mut self, now: Instant, ctx: &mut C) -> usize {
        let mut fired = 0;
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.del_timer(0);
            (node.callback)(ctx);
            fired += 1;
        }
        fired
    }

    /// Evict expired entries, then report the time until the next expiry.
    ///
    /// `None` means there is nothing scheduled.
    pub fn next_delay(&mut self, ctx: &mut C) -> Option<Duration> {
        self.next_delay_at(Instant::now(), ctx)
    }

    pub fn next_delay_at(&mut self, now: Instant, ctx: &mut C) -> Option<Duration> {
        self.tick_at(now, ctx);
        self.heap
            .first()
            .map(|root| root.expires.saturating_duration_since(now))
    }

    /// Drop every entry without running callbacks.
    pub fn clear(&mut self) {
        self.index.clear();
        self.heap.clear();
    }

    /// Remove the node at `i`: the last node takes its slot and is sifted
    /// in whichever direction restores order.
    fn del_timer(&mut self, i: usize) -> TimerNode<K, C> {
        let node = self.heap.swap_remove(i);
        self.index.remove(&node.id);
        let n = self.heap.len();
        if i < n {
            self.index.insert(self.heap[i].id, i);
            if !self.sift_down(i, n) {
                self.sift_up(i);
            }
        }
        node
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_node(i, parent);
            i = parent;
        }
    }

    /// Sift within the first `n` slots. Returns true if the node moved.
    fn sift_down(&mut self, start: usize, n: usize) -> bool {
        let mut i = start;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_node(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > start
    }

    fn swap_node(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }

    #[cfg(test)]
    fn is_valid_heap(&self) -> bool {
        let ordered = (1..self.heap.len()).all(|i| self.heap[(i - 1) / 2].expires <= self.heap[i].expires);
        let indexed = self.index.len() == self.heap.len()
            && self
                .heap
                .iter()
                .enumerate()
                .all(|(i, node)| self.index.get(&node.id) == Some(&i));
        ordered && indexed
    }

    #[cfg(test)]
    fn min_expiry(&self) -> Option<Instant> {
        self.heap.iter().map(|n| n.expires).min()
    }
}
