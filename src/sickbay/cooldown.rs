//! Per-parent recovery gating and per-dependent restart cooldown

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Slot {
    /// When the last recovery started
    last: Instant,
    in_flight: bool,
}

/// At most one recovery per parent at a time, and none within `window` of the last start
#[derive(Debug)]
pub struct RecoveryCooldown {
    window: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl RecoveryCooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Claim a recovery for `parent`; on success the caller must call `end` exactly once
    pub fn try_start(&self, parent: &str) -> bool {
        let now = Instant::now();
        let mut slots = lock(&self.slots);
        let blocked = slots
            .get(parent)
            .is_some_and(|slot| slot.in_flight || now.duration_since(slot.last) < self.window);
        if blocked {
            return false;
        }
        slots.insert(
            parent.to_string(),
            Slot {
                last: now,
                in_flight: true,
            },
        );
        true
    }

    /// Finish a recovery; the start timestamp is kept
    pub fn end(&self, parent: &str) {
        if let Some(slot) = lock(&self.slots).get_mut(parent) {
            slot.in_flight = false;
        }
    }

    /// `try_start` wrapped in a guard that calls `end` when dropped
    pub fn acquire(&self, parent: &str) -> Option<RecoveryPermit<'_>> {
        self.try_start(parent).then(|| RecoveryPermit {
            cooldown: self,
            parent: parent.to_string(),
        })
    }

    pub fn is_in_flight(&self, parent: &str) -> bool {
        lock(&self.slots).get(parent).is_some_and(|s| s.in_flight)
    }
}

/// Held for the duration of one recovery
#[derive(Debug)]
pub struct RecoveryPermit<'a> {
    cooldown: &'a RecoveryCooldown,
    parent: String,
}

impl Drop for RecoveryPermit<'_> {
    fn drop(&mut self) {
        self.cooldown.end(&self.parent);
    }
}

/// Minimum interval between restarts of the same dependent, whichever parent asks
#[derive(Debug)]
pub struct DependentCooldown {
    window: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl DependentCooldown {
    /// A zero window disables the guard
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.window.is_zero()
    }

    /// Stamp `dependent` as restarted now unless it already was within the window
    pub fn try_claim(&self, dependent: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let now = Instant::now();
        let mut last = lock(&self.last);
        if last.get(dependent).is_some_and(|at| now.duration_since(*at) < self.window) {
            return false;
        }
        last.insert(dependent.to_string(), now);
        true
    }

    /// Forget a stamp for a restart that did not happen
    pub fn clear(&self, dependent: &str) {
        if self.is_enabled() {
            lock(&self.last).remove(dependent);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
