//! Segmented LRU.
//!
//! New entries land in the probation segment. A second hit promotes an
//! entry to the protected segment; protected overflow demotes the oldest
//! protected entry back to probation, and probation overflow evicts.
//!
//! Recency is tracked with a stamp per entry and a queue of `(id, stamp)`
//! per segment. Queue entries whose stamp no longer matches are skipped on
//! eviction and dropped when the queue is compacted.

use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;

#[derive(Debug)]
struct Segment {
    entries: HashMap<u32, (Arc<str>, u64)>,
    order: VecDeque<(u32, u64)>,
    capacity: usize,
}

impl Segment {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, id: u32, value: Arc<str>, stamp: u64) {
        self.entries.insert(id, (value, stamp));
        self.order.push_back((id, stamp));
        if self.order.len() > self.capacity * 2 + 16 {
            self.compact();
        }
    }

    fn touch(&mut self, id: u32, stamp: u64) -> Option<Arc<str>> {
        let (value, entry_stamp) = self.entries.get_mut(&id)?;
        *entry_stamp = stamp;
        let value = Arc::clone(value);
        self.order.push_back((id, stamp));
        if self.order.len() > self.capacity * 2 + 16 {
            self.compact();
        }
        Some(value)
    }

    fn remove(&mut self, id: u32) -> Option<Arc<str>> {
        self.entries.remove(&id).map(|(value, _)| value)
    }

    /// Removes the least recently used entry when over capacity.
    fn pop_overflow(&mut self) -> Option<(u32, Arc<str>)> {
        if self.entries.len() <= self.capacity {
            return None;
        }
        while let Some((id, stamp)) = self.order.pop_front() {
            if matches!(self.entries.get(&id), Some((_, current)) if *current == stamp) {
                return self.remove(id).map(|value| (id, value));
            }
        }
        None
    }

    fn compact(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(id, stamp)| matches!(entries.get(id), Some((_, current)) if current == stamp));
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[derive(Debug)]
pub(super) struct SlruShard {
    probation: Segment,
    protected: Segment,
    clock: u64,
}

impl SlruShard {
    pub(super) fn new(probation: usize, protected: usize) -> Self {
        Self {
            probation: Segment::new(probation),
            protected: Segment::new(protected),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub(super) fn get(&mut self, id: u32) -> Option<Arc<str>> {
        let stamp = self.tick();
        if let Some(value) = self.protected.touch(id, stamp) {
            return Some(value);
        }
        let value = self.probation.remove(id)?;
        self.protected.push(id, Arc::clone(&value), stamp);
        if let Some((demoted, demoted_value)) = self.protected.pop_overflow() {
            let stamp = self.tick();
            self.probation.push(demoted, demoted_value, stamp);
            self.probation.pop_overflow();
        }
        Some(value)
    }

    pub(super) fn insert(&mut self, id: u32, value: Arc<str>) {
        if self.protected.entries.contains_key(&id) || self.probation.entries.contains_key(&id) {
            return;
        }
        let stamp = self.tick();
        self.probation.push(id, value, stamp);
        self.probation.pop_overflow();
    }

    pub(super) fn len(&self) -> usize {
        self.probation.entries.len() + self.protected.entries.len()
    }

    pub(super) fn clear(&mut self) {
        self.probation.clear();
        self.protected.clear();
    }

    #[cfg(test)]
    fn is_protected(&self, id: u32) -> bool {
        self.protected.entries.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[test]
    fn second_hit_promotes() {
        let mut shard = SlruShard::new(2, 2);
        shard.insert(1, value("a"));
        assert!(!shard.is_protected(1));

        assert_eq!(shard.get(1).as_deref(), Some("a"));
        assert!(shard.is_protected(1));
    }

    #[test]
    fn probation_overflow_evicts_oldest() {
        let mut shard = SlruShard::new(2, 2);
        shard.insert(1, value("a"));
        shard.insert(2, value("b"));
        shard.insert(3, value("c"));

        assert!(shard.get(1).is_none());
        assert_eq!(shard.len(), 2);
    }

    #[test]
    fn protected_entries_survive_probation_churn() {
        let mut shard = SlruShard::new(2, 4);
        shard.insert(1, value("hot"));
        shard.get(1);

        for id in 10..100 {
            shard.insert(id, value("cold"));
        }
        assert_eq!(shard.get(1).as_deref(), Some("hot"));
    }

    #[test]
    fn protected_overflow_demotes_to_probation() {
        let mut shard = SlruShard::new(4, 1);
        shard.insert(1, value("a"));
        shard.insert(2, value("b"));
        shard.get(1);
        shard.get(2);

        assert!(shard.is_protected(2));
        assert!(!shard.is_protected(1));
        assert_eq!(shard.get(1).as_deref(), Some("a"));
    }

    #[test]
    fn repeated_hits_keep_queue_bounded() {
        let mut shard = SlruShard::new(2, 2);
        shard.insert(1, value("a"));
        for _ in 0..1_000 {
            shard.get(1);
        }
        assert!(shard.protected.order.len() <= 2 * 2 + 17);
    }
}
