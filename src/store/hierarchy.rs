//! Directory-tree operations on top of records, children lists and the
//! name index.
//!
//! Each structural change runs under the children stripe of the affected
//! parent(s): record first, then the parent's list, then the index.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{Result, WrapErr};

use super::VfsStore;
use crate::error::StoreError;
use crate::records::{RecordFields, RecordFlags, RecordSnapshot};
use crate::tree::ChildEntry;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

fn invalid(message: String) -> eyre::Report {
    StoreError::InvalidArgument(message).into()
}

impl VfsStore {
    fn live_record(&self, id: u32) -> Result<RecordSnapshot> {
        let snapshot = self.records.read_record(id)?;
        if snapshot.is_free() {
            return Err(StoreError::InvalidEntityId {
                id,
                allocated: self.records.record_count(),
            }
            .into());
        }
        Ok(snapshot)
    }

    fn live_directory(&self, id: u32) -> Result<RecordSnapshot> {
        let snapshot = self.live_record(id)?;
        if !snapshot.is_directory() {
            return Err(invalid(format!("entity {} is not a directory", id)));
        }
        Ok(snapshot)
    }

    fn find_root_by_name_id(&self, name_id: u32) -> Result<Option<u32>> {
        for id in self.index.files_with_name(name_id)? {
            let snapshot = self.records.read_record(id)?;
            if !snapshot.is_free() && snapshot.fields.parent_id == 0 && snapshot.is_directory() {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    fn allocate_entity(&self, parent: u32, name_id: u32, flags: RecordFlags) -> Result<u32> {
        let id = self.records.allocate_record()?;
        let timestamp = now_millis();
        self.records.update_record(id, &mut |fields| {
            *fields = RecordFields {
                parent_id: parent,
                name_id,
                flags,
                timestamp,
                attribute_record_id: fields.attribute_record_id,
                ..RecordFields::default()
            };
        })?;
        Ok(id)
    }

    /// Creates a top-level directory.
    pub fn create_root(&self, name: &str) -> Result<u32> {
        self.ensure_open()?;
        let name_id = self.names.enumerate(name)?;
        let _guard = self.children.lock_parent(0);
        if self.find_root_by_name_id(name_id)?.is_some() {
            return Err(invalid(format!("root '{}' already exists", name)));
        }
        let id = self.allocate_entity(0, name_id, RecordFlags::DIRECTORY)?;
        self.index.update_file_name(id, 0, name_id)?;
        Ok(id)
    }

    pub fn roots(&self) -> Result<Vec<u32>> {
        self.ensure_open()?;
        let mut roots = Vec::new();
        self.records.for_each_live(&mut |snapshot| {
            if snapshot.fields.parent_id == 0 && snapshot.is_directory() {
                roots.push(snapshot.id);
            }
            Ok(true)
        })?;
        Ok(roots)
    }

    pub fn root_id(&self, name: &str) -> Result<Option<u32>> {
        self.ensure_open()?;
        match self.names.try_enumerate(name)? {
            Some(name_id) => self.find_root_by_name_id(name_id),
            None => Ok(None),
        }
    }

    /// Creates `name` under the directory `parent`. Sibling names must be
    /// unique.
    pub fn create_child(&self, parent: u32, name: &str, flags: RecordFlags) -> Result<u32> {
        self.ensure_open()?;
        self.live_directory(parent)?;
        let name_id = self.names.enumerate(name)?;
        let flags = flags - (RecordFlags::FREE | RecordFlags::CHILDREN_CACHED);

        let _guard = self.children.lock_parent(parent);
        // a concurrent delete frees the parent under this same lock
        self.live_directory(parent)?;
        if self.children.find_child(parent, name_id)?.is_some() {
            return Err(invalid(format!(
                "'{}' already exists in directory {}",
                name, parent
            )));
        }

        let id = self.allocate_entity(parent, name_id, flags)?;
        self.children
            .update_children_locked(parent, |children| {
                children.push(ChildEntry { id, name_id });
                Ok(())
            })
            .wrap_err_with(|| format!("failed to link {} under {}", id, parent))?;
        self.index.update_file_name(id, 0, name_id)?;
        Ok(id)
    }

    pub fn rename(&self, entity: u32, new_name: &str) -> Result<()> {
        self.ensure_open()?;
        let new_id = self.names.enumerate(new_name)?;
        let (parent, old_id, _guard) = loop {
            let parent = self.live_record(entity)?.fields.parent_id;
            let guard = self.children.lock_parent(parent);
            let snapshot = self.live_record(entity)?;
            // moved before the lock was taken
            if snapshot.fields.parent_id == parent {
                break (parent, snapshot.fields.name_id, guard);
            }
        };
        if old_id == new_id {
            return Ok(());
        }
        let clash = if parent == 0 {
            self.find_root_by_name_id(new_id)?
        } else {
            self.children.find_child(parent, new_id)?
        };
        if clash.is_some_and(|other| other != entity) {
            return Err(invalid(format!("'{}' already exists next to {}", new_name, entity)));
        }

        self.records.set_name_id(entity, new_id)?;
        if parent != 0 {
            self.children.update_children_locked(parent, |children| {
                for child in children.iter_mut().filter(|child| child.id == entity) {
                    child.name_id = new_id;
                }
                Ok(())
            })?;
        }
        self.index.update_file_name(entity, old_id, new_id)
    }

    /// Moves `entity` under the directory `new_parent`.
    ///
    /// Directory moves are serialized store-wide so the subtree check and
    /// the parent write see the same tree.
    pub fn move_to(&self, entity: u32, new_parent: u32) -> Result<()> {
        self.ensure_open()?;
        let current = self.live_record(entity)?;
        let old_parent = current.fields.parent_id;
        self.live_directory(new_parent)?;
        if old_parent == new_parent {
            return Ok(());
        }

        let _moves = current.is_directory().then(|| self.directory_moves.lock());
        let _guards = self.children.lock_parents(old_parent, new_parent);
        self.live_directory(new_parent)?;
        let snapshot = self.live_record(entity)?;
        if snapshot.fields.parent_id != old_parent {
            return Err(invalid(format!("{} was moved concurrently", entity)));
        }
        if snapshot.is_directory() {
            self.check_not_ancestor(entity, new_parent)?;
        }
        let name_id = snapshot.fields.name_id;
        if self.children.find_child(new_parent, name_id)?.is_some() {
            return Err(invalid(format!(
                "directory {} already has a child with the name of {}",
                new_parent, entity
            )));
        }

        self.children.update_children_locked(new_parent, |children| {
            children.push(ChildEntry { id: entity, name_id });
            Ok(())
        })?;
        if old_parent != 0 {
            self.children.update_children_locked(old_parent, |children| {
                children.retain(|child| child.id != entity);
                Ok(())
            })?;
        }
        self.records.set_parent(entity, new_parent)
    }

    fn check_not_ancestor(&self, entity: u32, new_parent: u32) -> Result<()> {
        let mut ancestor = new_parent;
        for _ in 0..=self.records.record_count() {
            if ancestor == 0 {
                return Ok(());
            }
            if ancestor == entity {
                return Err(invalid(format!(
                    "cannot move {} into its own subtree ({})",
                    entity, new_parent
                )));
            }
            ancestor = self.records.parent_id(ancestor)?;
        }
        Err(StoreError::RecordCorruption {
            path: self.root.clone(),
            reason: format!("parent chain of {} does not reach a root", new_parent),
        }
        .into())
    }

    /// Deletes `entity` and everything below it. Returns the number of
    /// entities freed.
    pub fn delete(&self, entity: u32) -> Result<usize> {
        self.ensure_open()?;
        loop {
            let parent = self.live_record(entity)?.fields.parent_id;
            let _guard = self.children.lock_parent(parent);
            if self.live_record(entity)?.fields.parent_id != parent {
                continue;
            }
            if parent != 0 {
                self.children.update_children_locked(parent, |children| {
                    children.retain(|child| child.id != entity);
                    Ok(())
                })?;
            }
            break;
        }

        let mut freed = 0;
        let mut pending = vec![entity];
        while let Some(id) = pending.pop() {
            let _guard = self.children.lock_parent(id);
            let snapshot = self.records.read_record(id)?;
            if snapshot.is_free() {
                continue;
            }
            if snapshot.is_directory() {
                pending.extend(self.children.do_load_children(id)?.ids());
            }
            self.records.mark_free(id)?;
            self.attributes.delete_all(id)?;
            self.index
                .update_file_name(id, snapshot.fields.name_id, 0)?;
            freed += 1;
        }
        tracing::debug!(entity, freed, "deleted subtree");
        Ok(freed)
    }

    pub fn find_child(&self, parent: u32, name: &str) -> Result<Option<u32>> {
        self.ensure_open()?;
        match self.names.try_enumerate(name)? {
            Some(name_id) => self.children.find_child(parent, name_id),
            None => Ok(None),
        }
    }

    /// Children of `parent` with their names, in stored order.
    pub fn list_children(&self, parent: u32) -> Result<Vec<(u32, Arc<str>)>> {
        self.ensure_open()?;
        self.children
            .do_load_children(parent)?
            .children
            .into_iter()
            .map(|child| Ok((child.id, self.names.value_of(child.name_id)?)))
            .collect()
    }

    pub fn name_of(&self, entity: u32) -> Result<Option<Arc<str>>> {
        self.ensure_open()?;
        match self.records.name_id(entity)? {
            0 => Ok(None),
            name_id => self.names.value_of(name_id).map(Some),
        }
    }

    /// Every live entity named `name`, ascending.
    pub fn files_named(&self, name: &str) -> Result<Vec<u32>> {
        self.ensure_open()?;
        match self.names.try_enumerate(name)? {
            Some(name_id) => self.index.files_with_name(name_id),
            None => Ok(Vec::new()),
        }
    }

    /// `/`-separated names from the root down to `entity`.
    pub fn path_of(&self, entity: u32) -> Result<String> {
        self.ensure_open()?;
        let mut parts = Vec::new();
        let mut current = entity;
        for _ in 0..=self.records.record_count() {
            if current == 0 {
                break;
            }
            let snapshot = self.live_record(current)?;
            parts.push(match snapshot.fields.name_id {
                0 => Arc::from(""),
                name_id => self.names.value_of(name_id)?,
            });
            current = snapshot.fields.parent_id;
        }
        if current != 0 {
            return Err(StoreError::RecordCorruption {
                path: self.root.clone(),
                reason: format!("parent chain of {} does not reach a root", entity),
            }
            .into());
        }
        let mut path = String::new();
        for part in parts.iter().rev() {
            path.push('/');
            path.push_str(part);
        }
        Ok(path)
    }

    /// Resolves a `/`-separated path whose first component is a root name.
    pub fn resolve_path(&self, path: &str) -> Result<Option<u32>> {
        let mut components = path.split('/').filter(|part| !part.is_empty());
        let Some(first) = components.next() else {
            return Ok(None);
        };
        let Some(mut current) = self.root_id(first)? else {
            return Ok(None);
        };
        for component in components {
            match self.find_child(current, component)? {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }
}
