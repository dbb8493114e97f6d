//! Bounded memo of container ids that cannot be restarted
//!
//! Entries leave only by pruning against a fresh listing or by eviction when
//! full. Eviction prefers ids that are no longer live, then the oldest entry.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

/// Capacity used when none (or a non-positive one) is configured
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Default)]
struct Inner {
    ids: HashSet<String>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

#[derive(Debug)]
pub struct UnrestartableSet {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl Default for UnrestartableSet {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl UnrestartableSet {
    /// Create a set holding at most `capacity` ids (0 means the default)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: if capacity == 0 { DEFAULT_CAPACITY } else { capacity },
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().ids.contains(id)
    }

    /// Remember an id, evicting one entry first if the set is full
    pub fn add(&self, id: &str, live: Option<&HashSet<String>>) {
        let mut inner = self.lock();
        if inner.ids.contains(id) {
            return;
        }

        if inner.ids.len() >= self.capacity {
            let stale = live.and_then(|live| inner.order.iter().position(|old| !live.contains(old)));
            let evicted = match stale {
                Some(pos) => inner.order.remove(pos),
                None => inner.order.pop_front(),
            };
            if let Some(evicted) = evicted {
                inner.ids.remove(&evicted);
            }
        }

        inner.ids.insert(id.to_string());
        inner.order.push_back(id.to_string());
    }

    /// Drop every id missing from the live listing; returns how many were dropped
    pub fn prune(&self, live: &HashSet<String>) -> usize {
        let mut inner = self.lock();
        let before = inner.order.len();
        inner.order.retain(|id| live.contains(id));
        inner.ids.retain(|id| live.contains(id));
        before - inner.order.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
