//! # Enumerators
//!
//! An enumerator interns strings: every distinct value gets a positive u32
//! id, the same value always gets the same id, and the id maps back to the
//! value. File names and attribute key names are stored as these ids.
//!
//! | Implementation         | Backing                                 | Used by              |
//! |------------------------|-----------------------------------------|----------------------|
//! | [`DurableEnumerator`]  | value log + multi-valued hash map       | `Backend::Mapped`    |
//! | [`InMemoryEnumerator`] | `hashbrown` map + `Vec<Arc<str>>`       | `Backend::InMemory`  |
//!
//! Both implement [`Enumerator`], which the rest of the store holds as a
//! trait object chosen at connect.
//!
//! ## Case Sensitivity
//!
//! Fixed when the enumerator is created. A case-insensitive enumerator
//! hashes and compares the lowercase form of each value but returns the
//! casing of the first value interned.
//!
//! ## Id 0
//!
//! Id 0 means "no name" and is never handed out. Asking for its value is a
//! programming error.

mod durable;
mod memory;

pub use durable::DurableEnumerator;
pub use memory::InMemoryEnumerator;

use std::borrow::Cow;

use eyre::Result;

use crate::config::MAX_ENUMERATED_LEN;
use crate::error::StoreError;

pub trait Enumerator: Send + Sync {
    /// Returns the id of `value`, interning it first if necessary.
    fn enumerate(&self, value: &str) -> Result<u32>;

    /// Returns the id of `value` if it has been interned.
    fn try_enumerate(&self, value: &str) -> Result<Option<u32>>;

    fn value_of(&self, id: u32) -> Result<String>;

    /// Number of interned values.
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn is_case_sensitive(&self) -> bool;

    /// Visits every interned value in id order until `visitor` returns `false`.
    fn for_each(&self, visitor: &mut dyn FnMut(u32, &str) -> bool) -> Result<()>;

    fn flush(&self) -> Result<()>;
}

pub(crate) fn check_value(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(StoreError::InvalidArgument("cannot enumerate an empty string".into()).into());
    }
    if value.len() > MAX_ENUMERATED_LEN {
        return Err(StoreError::InvalidArgument(format!(
            "value of {} bytes exceeds the {} byte limit",
            value.len(),
            MAX_ENUMERATED_LEN
        ))
        .into());
    }
    Ok(())
}

pub(crate) fn normalize(value: &str, case_sensitive: bool) -> Cow<'_, str> {
    if case_sensitive || !value.chars().any(char::is_uppercase) {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(value.to_lowercase())
    }
}

pub(crate) fn reject_null_id(id: u32) -> Result<()> {
    if id == 0 {
        return Err(StoreError::InvalidArgument("id 0 has no value".into()).into());
    }
    Ok(())
}
