//! Per-model-name mutual exclusion.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use dashmap::DashMap;
use tracing::trace;

/// One name's lock: the held flag and the condvar its waiters park on.
#[derive(Default)]
struct Slot {
    held: Mutex<bool>,
    released: Condvar,
}

impl Slot {
    fn held(&self) -> MutexGuard<'_, bool> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keyed lock: at most one holder per name, no contention across names.
///
/// Slots are created on first use and dropped again by the last guard
/// or waiter to leave, so the map only holds names in use.
#[derive(Default)]
pub struct NameLocks {
    slots: DashMap<String, Arc<Slot>>,
}

impl NameLocks {
    /// Block until `key` is free, then hold it until the guard drops.
    pub fn lock(&self, key: &str) -> NameGuard<'_> {
        // Clone out of the entry so no shard lock is held while waiting.
        let slot = Arc::clone(self.slots.entry(key.to_string()).or_default().value());
        {
            let mut held = slot.held();
            while *held {
                trace!(key, "waiting for name lock");
                held = slot
                    .released
                    .wait(held)
                    .unwrap_or_else(|e| e.into_inner());
            }
            *held = true;
        }
        NameGuard {
            locks: self,
            key: key.to_string(),
            slot,
        }
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.slots.get(key).is_some_and(|slot| *slot.held())
    }
}

pub struct NameGuard<'a> {
    locks: &'a NameLocks,
    key: String,
    slot: Arc<Slot>,
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        *self.slot.held() = false;
        self.slot.released.notify_one();
        // Map plus this guard: nobody else is waiting on the slot.
        self.locks
            .slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 2);
    }
}
