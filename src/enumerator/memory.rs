//! Heap-only enumerator for ephemeral stores.

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::{check_value, normalize, reject_null_id, Enumerator};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Interned {
    ids: HashMap<Box<str>, u32>,
    values: Vec<Arc<str>>,
}

#[derive(Debug)]
pub struct InMemoryEnumerator {
    case_sensitive: bool,
    state: RwLock<Interned>,
}

impl InMemoryEnumerator {
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            case_sensitive,
            state: RwLock::new(Interned::default()),
        }
    }

    /// Shared handle to the stored value, without copying it.
    pub fn value_arc(&self, id: u32) -> Result<Arc<str>> {
        reject_null_id(id)?;
        self.state
            .read()
            .values
            .get(id as usize - 1)
            .cloned()
            .ok_or_else(|| {
                StoreError::InvalidArgument(format!("id {} was never enumerated", id)).into()
            })
    }
}

impl Enumerator for InMemoryEnumerator {
    fn enumerate(&self, value: &str) -> Result<u32> {
        check_value(value)?;
        let key = normalize(value, self.case_sensitive);
        if let Some(id) = self.state.read().ids.get(&*key) {
            return Ok(*id);
        }

        let mut state = self.state.write();
        if let Some(id) = state.ids.get(&*key) {
            return Ok(*id);
        }
        state.values.push(Arc::from(value));
        let id = state.values.len() as u32;
        state.ids.insert(key.into_owned().into_boxed_str(), id);
        Ok(id)
    }

    fn try_enumerate(&self, value: &str) -> Result<Option<u32>> {
        check_value(value)?;
        let key = normalize(value, self.case_sensitive);
        Ok(self.state.read().ids.get(&*key).copied())
    }

    fn value_of(&self, id: u32) -> Result<String> {
        Ok(self.value_arc(id)?.to_string())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.state.read().values.len() as u64)
    }

    fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn for_each(&self, visitor: &mut dyn FnMut(u32, &str) -> bool) -> Result<()> {
        let state = self.state.read();
        for (index, value) in state.values.iter().enumerate() {
            if !visitor(index as u32 + 1, value) {
                break;
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
