//! Most-recently-used ring.
//!
//! A fixed array of `(id, value)` slots written round-robin. Lookups scan
//! the whole ring, so rings are kept small and sharded.

use std::sync::Arc;

#[derive(Debug)]
pub(super) struct MruRing {
    slots: Vec<(u32, Arc<str>)>,
    capacity: usize,
    next: usize,
}

impl MruRing {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    pub(super) fn get(&self, id: u32) -> Option<Arc<str>> {
        self.slots
            .iter()
            .find(|(slot_id, _)| *slot_id == id)
            .map(|(_, value)| Arc::clone(value))
    }

    pub(super) fn insert(&mut self, id: u32, value: Arc<str>) {
        if self.get(id).is_some() {
            return;
        }
        if self.slots.len() < self.capacity {
            self.slots.push((id, value));
        } else {
            self.slots[self.next] = (id, value);
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub(super) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(super) fn clear(&mut self) {
        self.slots.clear();
        self.next = 0;
    }
}
