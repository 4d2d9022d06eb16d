//! Bounded map of per-operation state with one lock per entry.
//!
//! The outer lock is only held to look up or insert an entry. When the map
//! is full, the least recently used entry that is idle and evictable makes
//! room for the new one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::debug;

/// State that can tell whether dropping it would lose information
pub(crate) trait Evictable {
    fn is_evictable(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Slot<V> {
    value: Arc<Mutex<V>>,
    last_used: AtomicU64,
}

#[derive(Debug)]
pub(crate) struct EntryMap<V> {
    entries: RwLock<HashMap<String, Slot<V>>>,
    capacity: usize,
    clock: AtomicU64,
}

/// Locks an entry, recovering the data if a holder panicked
pub(crate) fn lock<V>(entry: &Mutex<V>) -> MutexGuard<'_, V> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<V: Evictable> EntryMap<V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the entry for `key` if it exists
    pub(crate) fn get(&self, key: &str) -> Option<Arc<Mutex<V>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).map(|slot| {
            slot.last_used.store(self.tick(), Ordering::Relaxed);
            Arc::clone(&slot.value)
        })
    }

    /// Returns the entry for `key`, creating it with `make` if needed
    pub(crate) fn get_or_insert_with<F>(&self, key: &str, make: F) -> Arc<Mutex<V>>
    where
        F: FnOnce() -> V,
    {
        if let Some(entry) = self.get(key) {
            return entry;
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = entries.get(key) {
            slot.last_used.store(self.tick(), Ordering::Relaxed);
            return Arc::clone(&slot.value);
        }

        if entries.len() >= self.capacity {
            Self::evict_one(&mut entries);
        }

        let value = Arc::new(Mutex::new(make()));
        entries.insert(
            key.to_string(),
            Slot {
                value: Arc::clone(&value),
                last_used: AtomicU64::new(self.tick()),
            },
        );
        value
    }

    fn evict_one(entries: &mut HashMap<String, Slot<V>>) {
        let victim = entries
            .iter()
            .filter(|(_, slot)| Arc::strong_count(&slot.value) == 1)
            .filter(|(_, slot)| {
                slot.value
                    .try_lock()
                    .map(|value| value.is_evictable())
                    .unwrap_or(false)
            })
            .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => {
                debug!(operation_id = %key, "Evicting least recently used entry");
                entries.remove(&key);
            }
            None => debug!(len = entries.len(), "No evictable entry, growing past capacity"),
        }
    }

    /// Applies `f` to every entry, returning the results keyed by operation
    pub(crate) fn collect<T, F>(&self, f: F) -> HashMap<String, T>
    where
        F: Fn(&V) -> T,
    {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .map(|(key, slot)| (key.clone(), f(&lock(&slot.value))))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
