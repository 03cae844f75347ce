//! # Children/Tree Accessor
//!
//! Each directory's children are stored as one attribute blob of
//! `(child id, name id)` pairs, in the order the caller saved them.
//!
//! ## Lost-Update Prevention
//!
//! A [`ChildrenList`] remembers the parent's `mod_count` at load time.
//! Saving checks it under the parent's stripe lock, writes the blob, then
//! sets [`RecordFlags::CHILDREN_CACHED`] on the parent through
//! `update_record`, which moves `mod_count` on. Any list loaded before that
//! save is now stale and is rejected:
//!
//! ```text
//! A: load (m=5)                     save(m=5) -> StaleChildren
//! B: load (m=5)   save(m=5) -> m=6
//! ```
//!
//! [`ChildrenAccessor::update_children`] wraps load/modify/save in a retry
//! loop so callers that only add or remove entries never see the conflict.
//!
//! The blob also records the `mod_count` its save moved the parent to.
//! Other record updates (renames, moves) move the parent on without
//! rewriting the blob, so on load the stored value may trail the record's
//! but never lead it. A leading value means a save is between its blob
//! write and its record update; loads retry past that window and report a
//! blob that stays ahead as corrupt.

mod codec;

use std::sync::Arc;

use eyre::{Result, WrapErr};
use parking_lot::Mutex;

use crate::attributes::{AttributeKey, AttributeStore};
use crate::config::{CHILDREN_WRITE_STRIPES, MAX_CHILDREN_SAVE_RETRIES};
use crate::error::{store_error, StoreError};
use crate::records::{RecordFlags, RecordStorage};

pub const CHILDREN_ATTRIBUTE: &str = "children";
const CHILDREN_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildEntry {
    pub id: u32,
    pub name_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildrenList {
    pub children: Vec<ChildEntry>,
    /// Parent `mod_count` the list was loaded at.
    pub mod_count: u32,
}

impl ChildrenList {
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.children.iter().map(|child| child.id)
    }
}

pub struct ChildrenAccessor {
    records: Arc<dyn RecordStorage>,
    attributes: Arc<AttributeStore>,
    key: AttributeKey,
    stripes: Box<[Mutex<()>]>,
}

impl std::fmt::Debug for ChildrenAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildrenAccessor")
            .field("key", &self.key)
            .finish()
    }
}

impl ChildrenAccessor {
    pub fn new(records: Arc<dyn RecordStorage>, attributes: Arc<AttributeStore>) -> Self {
        Self {
            records,
            attributes,
            key: AttributeKey::new(CHILDREN_ATTRIBUTE, CHILDREN_VERSION),
            stripes: (0..CHILDREN_WRITE_STRIPES)
                .map(|_| Mutex::new(()))
                .collect(),
        }
    }

    /// Lock serializing structural changes under `parent`. Held by
    /// [`do_save_children`](Self::do_save_children) and by callers that must
    /// change a record and its parent's list together.
    pub fn lock_parent(&self, parent: u32) -> parking_lot::MutexGuard<'_, ()> {
        self.stripes[parent as usize % self.stripes.len()].lock()
    }

    fn corruption(&self, parent: u32, err: eyre::Report) -> eyre::Report {
        StoreError::AttributeCorruption {
            path: self.attributes.path().to_path_buf(),
            reason: format!("children list of {} is malformed: {}", parent, err),
        }
        .into()
    }

    /// Loads the children list, empty when none has been saved.
    pub fn do_load_children(&self, parent: u32) -> Result<ChildrenList> {
        let mut ahead = None;
        for _ in 0..MAX_CHILDREN_SAVE_RETRIES {
            let before = self.records.mod_count(parent)?;
            let (saved_at, children) = self
                .attributes
                .read_attribute_raw(parent, &self.key, codec::decode)?
                .transpose()
                .map_err(|err| self.corruption(parent, err))?
                .unwrap_or_default();
            let stable = self.records.mod_count(parent)? == before;
            if is_ahead(saved_at, before) {
                ahead = Some((saved_at, before));
            } else if stable {
                return Ok(ChildrenList {
                    children,
                    mod_count: before,
                });
            }
            std::thread::yield_now();
        }
        if let Some((saved_at, current)) = ahead {
            return Err(StoreError::AttributeCorruption {
                path: self.attributes.path().to_path_buf(),
                reason: format!(
                    "children list of {} was saved at mod count {} but the record is at {}",
                    parent, saved_at, current
                ),
            }
            .into());
        }
        Err(StoreError::TornRead {
            id: parent,
            retries: MAX_CHILDREN_SAVE_RETRIES,
        }
        .into())
    }

    /// Saves `list`, failing with `StaleChildren` when the parent changed
    /// since it was loaded. Returns the parent's new `mod_count`.
    pub fn do_save_children(&self, parent: u32, list: &ChildrenList) -> Result<u32> {
        let _guard = self.lock_parent(parent);
        self.save_locked(parent, list)
    }

    /// Same as [`do_save_children`](Self::do_save_children) for callers
    /// already holding [`lock_parent`](Self::lock_parent).
    pub fn save_locked(&self, parent: u32, list: &ChildrenList) -> Result<u32> {
        let actual = self.records.mod_count(parent)?;
        if actual != list.mod_count {
            return Err(StoreError::StaleChildren {
                parent,
                expected: list.mod_count,
                actual,
            }
            .into());
        }

        let encoded = codec::encode(actual.wrapping_add(1), &list.children);
        self.attributes
            .write_attribute_bytes(parent, &self.key, &encoded)
            .wrap_err_with(|| format!("failed to save {} children of {}", list.len(), parent))?;
        let snapshot = self.records.update_record(parent, &mut |fields| {
            fields.flags.insert(RecordFlags::CHILDREN_CACHED);
        })?;
        Ok(snapshot.mod_count)
    }

    /// Visits children in stored order until `visitor` returns false, without
    /// building the list. Returns whether every child was visited.
    pub fn for_each_child(
        &self,
        parent: u32,
        mut visitor: impl FnMut(ChildEntry) -> bool,
    ) -> Result<bool> {
        match self
            .attributes
            .read_attribute_raw(parent, &self.key, |bytes| codec::visit(bytes, &mut visitor))?
        {
            None => Ok(true),
            Some(visited) => visited.map_err(|err| self.corruption(parent, err)),
        }
    }

    pub fn find_child(&self, parent: u32, name_id: u32) -> Result<Option<u32>> {
        let mut found = None;
        self.for_each_child(parent, |child| {
            if child.name_id == name_id {
                found = Some(child.id);
                return false;
            }
            true
        })?;
        Ok(found)
    }

    /// Applies `edit` to a freshly loaded list and saves it, reloading on
    /// `StaleChildren`. Holds the parent's stripe for the whole edit.
    pub fn update_children(
        &self,
        parent: u32,
        mut edit: impl FnMut(&mut Vec<ChildEntry>),
    ) -> Result<ChildrenList> {
        let _guard = self.lock_parent(parent);
        self.update_children_locked(parent, |children| {
            edit(children);
            Ok(())
        })
    }

    /// Same as [`update_children`](Self::update_children) for callers already
    /// holding [`lock_parent`](Self::lock_parent). An error from `edit`
    /// aborts without saving.
    pub fn update_children_locked(
        &self,
        parent: u32,
        mut edit: impl FnMut(&mut Vec<ChildEntry>) -> Result<()>,
    ) -> Result<ChildrenList> {
        let mut attempts = 0;
        loop {
            let mut list = self.do_load_children(parent)?;
            edit(&mut list.children)?;
            match self.save_locked(parent, &list) {
                Ok(mod_count) => {
                    list.mod_count = mod_count;
                    return Ok(list);
                }
                Err(err)
                    if attempts < MAX_CHILDREN_SAVE_RETRIES
                        && matches!(store_error(&err), Some(StoreError::StaleChildren { .. })) =>
                {
                    attempts += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Locks two parents in stripe order. The second guard is `None` when
    /// both share a stripe.
    pub fn lock_parents(
        &self,
        a: u32,
        b: u32,
    ) -> (
        parking_lot::MutexGuard<'_, ()>,
        Option<parking_lot::MutexGuard<'_, ()>>,
    ) {
        let stripes = self.stripes.len();
        let (sa, sb) = (a as usize % stripes, b as usize % stripes);
        if sa == sb {
            return (self.stripes[sa].lock(), None);
        }
        let (low, high) = if sa < sb { (sa, sb) } else { (sb, sa) };
        let first = self.stripes[low].lock();
        let second = self.stripes[high].lock();
        (first, Some(second))
    }

    pub fn is_cached(&self, parent: u32) -> Result<bool> {
        Ok(self.records.flags(parent)?.contains(RecordFlags::CHILDREN_CACHED))
    }
}

/// Whether `saved_at` is past `current` in wrapping `mod_count` order.
fn is_ahead(saved_at: u32, current: u32) -> bool {
    (saved_at.wrapping_sub(current) as i32) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enumerator::InMemoryEnumerator;
    use crate::error::{error_kind, ErrorKind};
    use crate::records::HeapRecordTable;
    use tempfile::tempdir;

    fn accessor(root: &std::path::Path, entities: u32) -> ChildrenAccessor {
        let records: Arc<dyn RecordStorage> = Arc::new(HeapRecordTable::new());
        for _ in 0..entities {
            records.allocate_record().unwrap();
        }
        let attributes = Arc::new(
            AttributeStore::open_or_create(
                root,
                1,
                Arc::clone(&records),
                Arc::new(InMemoryEnumerator::new(true)),
            )
            .unwrap(),
        );
        ChildrenAccessor::new(records, attributes)
    }

    #[test]
    fn absent_list_is_empty() {
        let dir = tempdir().unwrap();
        let tree = accessor(dir.path(), 1);

        let list = tree.do_load_children(1).unwrap();
        assert!(list.is_empty());
        assert!(!tree.is_cached(1).unwrap());
        assert!(tree.for_each_child(1, |_| false).unwrap());
    }

    #[test]
    fn save_then_load_keeps_order() {
        let dir = tempdir().unwrap();
        let tree = accessor(dir.path(), 4);

        let mut list = tree.do_load_children(1).unwrap();
        list.children = vec![
            ChildEntry { id: 4, name_id: 40 },
            ChildEntry { id: 2, name_id: 20 },
            ChildEntry { id: 3, name_id: 30 },
        ];
        let new_mod_count = tree.do_save_children(1, &list).unwrap();

        let loaded = tree.do_load_children(1).unwrap();
        assert_eq!(loaded.children, list.children);
        assert_eq!(loaded.mod_count, new_mod_count);
        assert!(tree.is_cached(1).unwrap());
        assert_eq!(tree.find_child(1, 20).unwrap(), Some(2));
        assert_eq!(tree.find_child(1, 99).unwrap(), None);
    }

    #[test]
    fn stale_save_is_rejected() {
        let dir = tempdir().unwrap();
        let tree = accessor(dir.path(), 3);

        let mut first = tree.do_load_children(1).unwrap();
        let mut second = tree.do_load_children(1).unwrap();

        first.children.push(ChildEntry { id: 2, name_id: 1 });
        tree.do_save_children(1, &first).unwrap();

        second.children.push(ChildEntry { id: 3, name_id: 2 });
        let err = tree.do_save_children(1, &second).unwrap_err();
        assert!(matches!(
            store_error(&err),
            Some(StoreError::StaleChildren { parent: 1, .. })
        ));
        assert_eq!(tree.do_load_children(1).unwrap().children, first.children);
    }

    #[test]
    fn record_updates_after_save_do_not_invalidate_the_list() {
        let dir = tempdir().unwrap();
        let tree = accessor(dir.path(), 2);
        tree.update_children(1, |children| children.push(ChildEntry { id: 2, name_id: 7 }))
            .unwrap();

        tree.records.set_name_id(1, 99).unwrap();
        tree.records.set_parent(1, 0).unwrap();

        let loaded = tree.do_load_children(1).unwrap();
        assert_eq!(loaded.children, vec![ChildEntry { id: 2, name_id: 7 }]);
        assert_eq!(loaded.mod_count, tree.records.mod_count(1).unwrap());
        tree.do_save_children(1, &loaded).unwrap();
    }

    #[test]
    fn list_saved_ahead_of_its_record_is_corrupt() {
        let dir = tempdir().unwrap();
        let tree = accessor(dir.path(), 2);
        let current = tree.records.mod_count(1).unwrap();

        let foreign = codec::encode(current + 5, &[ChildEntry { id: 2, name_id: 1 }]);
        tree.attributes
            .write_attribute_bytes(1, &tree.key, &foreign)
            .unwrap();

        let err = tree.do_load_children(1).unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Corruption);
        assert!(matches!(
            store_error(&err),
            Some(StoreError::AttributeCorruption { .. })
        ));
    }

    #[test]
    fn saved_mod_count_ordering_wraps() {
        assert!(is_ahead(6, 5));
        assert!(!is_ahead(5, 5));
        assert!(!is_ahead(3, 5));
        assert!(is_ahead(0, u32::MAX));
    }

    #[test]
    fn concurrent_updates_lose_no_children() {
        let dir = tempdir().unwrap();
        let tree = Arc::new(accessor(dir.path(), 1 + 8 * 50));

        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let tree = Arc::clone(&tree);
                std::thread::spawn(move || {
                    for i in 0..50u32 {
                        let id = 2 + t * 50 + i;
                        tree.update_children(1, |children| {
                            children.push(ChildEntry { id, name_id: id })
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut ids: Vec<u32> = tree.do_load_children(1).unwrap().ids().collect();
        ids.sort_unstable();
        assert_eq!(ids, (2..2 + 400).collect::<Vec<_>>());
    }
}
