//! # vfstore Configuration Module
//!
//! Layout constants live in [`constants`] so interdependent values stay next
//! to each other and are checked at compile time.
//!
//! Runtime options (storage root, expected version, cache and index policy)
//! are set through [`crate::store::StoreBuilder`].

pub mod constants;
pub use constants::*;
