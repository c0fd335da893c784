use std::collections::HashMap;

use parking_lot::Mutex;

use crate::ids::ReferenceIdGenerator;

const INITIAL_CAPACITY: usize = 8192;

/// Thread-safe id -> item table.
///
/// Id allocation and insertion happen under the same lock, so an id returned
/// by [`SynchronizedStore::add`] is never observable by [`get`](Self::get) or
/// [`filter`](Self::filter) before its item is in place.
#[derive(Debug)]
pub struct SynchronizedStore<T> {
    ids: ReferenceIdGenerator,
    items: Mutex<HashMap<u64, T>>,
}

impl<T> Default for SynchronizedStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SynchronizedStore<T> {
    pub fn new() -> Self {
        Self {
            ids: ReferenceIdGenerator::new(),
            items: Mutex::new(HashMap::with_capacity(INITIAL_CAPACITY)),
        }
    }

    pub fn add(&self, item: T) -> u64 {
        let mut items = self.items.lock();
        let id = self.ids.new_id();
        items.insert(id, item);
        id
    }

    /// Stores an item built from its own id. Used when the item needs to know
    /// the key it lives under.
    pub fn add_with(&self, build: impl FnOnce(u64) -> T) -> (u64, T)
    where
        T: Clone,
    {
        let mut items = self.items.lock();
        let id = self.ids.new_id();
        let item = build(id);
        items.insert(id, item.clone());
        (id, item)
    }

    /// Removing an id that is not present is a no-op.
    pub fn remove(&self, id: u64) -> Option<T> {
        self.items.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

impl<T: Clone> SynchronizedStore<T> {
    /// Returns `None` when the id is unknown or has been removed.
    pub fn get(&self, id: u64) -> Option<T> {
        self.items.lock().get(&id).cloned()
    }

    /// Snapshot of every item matching `predicate`, taken under the store lock.
    pub fn filter(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        self.items
            .lock()
            .values()
            .filter(|item| predicate(item))
            .cloned()
            .collect()
    }
}
