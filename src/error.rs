//! # Error Taxonomy
//!
//! Every fallible operation in the crate returns `eyre::Result`, with context
//! attached through `WrapErr` as the failure travels up. Failures the caller
//! must be able to react to are raised as a typed [`StoreError`] inside the
//! report, so they survive any amount of added context and can be recovered
//! with [`error_kind`] or `report.downcast_ref::<StoreError>()`.
//!
//! ## Kinds
//!
//! | Kind          | Scope                         | Recovery                          |
//! |---------------|-------------------------------|-----------------------------------|
//! | `Programming` | the calling operation only    | fix the call; store stays usable  |
//! | `Corruption`  | the whole store               | rebuild from scratch at connect   |
//! | `Io`          | the whole store               | surface to the owning application |
//!
//! Untyped `std::io::Error`s anywhere in a report chain classify as `Io`.

use std::io;
use std::path::PathBuf;

/// Classification of a failure by how much of the store it takes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Programming,
    Corruption,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid entity id {id} (allocated: {allocated})")]
    InvalidEntityId { id: u32, allocated: u32 },

    #[error("invalid attribute key: {0}")]
    InvalidAttributeKey(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("stale children list for {parent}: loaded at modCount {expected}, now {actual}")]
    StaleChildren {
        parent: u32,
        expected: u32,
        actual: u32,
    },

    #[error("store is closed")]
    StoreClosed,

    #[error("enumerator corruption in '{}': {reason}", .path.display())]
    EnumeratorCorruption { path: PathBuf, reason: String },

    #[error("hash map corruption in '{}': {reason}", .path.display())]
    MapCorruption { path: PathBuf, reason: String },

    #[error("attribute corruption in '{}': {reason}", .path.display())]
    AttributeCorruption { path: PathBuf, reason: String },

    #[error("record corruption in '{}': {reason}", .path.display())]
    RecordCorruption { path: PathBuf, reason: String },

    #[error("torn read of record {id} not resolved after {retries} retries")]
    TornRead { id: u32, retries: u32 },

    #[error("header mismatch in '{}': {reason}", .path.display())]
    HeaderMismatch { path: PathBuf, reason: String },

    #[error("version mismatch in '{}': found {found}, expected {expected}", .path.display())]
    VersionMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("offset {offset}+{len} outside mapped region '{}' ({mapped} bytes)", .path.display())]
    OutOfBounds {
        path: PathBuf,
        offset: u64,
        len: u64,
        mapped: u64,
    },

    #[error("region '{}' cannot grow past {limit} bytes", .path.display())]
    RegionFull { path: PathBuf, limit: u64 },

    #[error("storage I/O failure during {op} on '{}'", .path.display())]
    StorageIo {
        path: PathBuf,
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidEntityId { .. }
            | StoreError::InvalidAttributeKey(_)
            | StoreError::InvalidArgument(_)
            | StoreError::StaleChildren { .. }
            | StoreError::StoreClosed => ErrorKind::Programming,
            StoreError::EnumeratorCorruption { .. }
            | StoreError::MapCorruption { .. }
            | StoreError::AttributeCorruption { .. }
            | StoreError::RecordCorruption { .. }
            | StoreError::TornRead { .. }
            | StoreError::HeaderMismatch { .. }
            | StoreError::VersionMismatch { .. }
            | StoreError::OutOfBounds { .. } => ErrorKind::Corruption,
            StoreError::RegionFull { .. } | StoreError::StorageIo { .. } => ErrorKind::Io,
        }
    }

    pub fn io(path: impl Into<PathBuf>, op: &'static str, source: io::Error) -> Self {
        StoreError::StorageIo {
            path: path.into(),
            op,
            source,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::Programming
    }
}

/// Returns the typed store error carried anywhere in the report chain.
pub fn store_error(report: &eyre::Report) -> Option<&StoreError> {
    report
        .chain()
        .find_map(|cause| cause.downcast_ref::<StoreError>())
}

/// Classifies a report. Reports with no typed cause are treated as I/O when
/// an OS error is in the chain and as programming errors otherwise.
pub fn error_kind(report: &eyre::Report) -> ErrorKind {
    if let Some(err) = store_error(report) {
        return err.kind();
    }
    if report
        .chain()
        .any(|cause| cause.downcast_ref::<io::Error>().is_some())
    {
        return ErrorKind::Io;
    }
    ErrorKind::Programming
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::WrapErr;

    fn fails_with(err: StoreError) -> eyre::Result<()> {
        Err(err.into())
    }

    #[test]
    fn kind_survives_added_context() {
        let report = fails_with(StoreError::MapCorruption {
            path: "names.map".into(),
            reason: "bad magic".into(),
        })
        .wrap_err("failed to look up name")
        .wrap_err("failed to enumerate 'foo'")
        .unwrap_err();

        assert_eq!(error_kind(&report), ErrorKind::Corruption);
        assert!(matches!(
            store_error(&report),
            Some(StoreError::MapCorruption { .. })
        ));
    }

    #[test]
    fn programming_errors_are_not_fatal() {
        let err = StoreError::InvalidEntityId {
            id: 0,
            allocated: 3,
        };
        assert_eq!(err.kind(), ErrorKind::Programming);
        assert!(!err.is_fatal());
    }

    #[test]
    fn untyped_io_error_classifies_as_io() {
        let report = eyre::Report::new(io::Error::new(io::ErrorKind::Other, "disk full"))
            .wrap_err("flush failed");
        assert_eq!(error_kind(&report), ErrorKind::Io);
    }

    #[test]
    fn storage_io_keeps_source() {
        let err = StoreError::io(
            "records.dat",
            "extend",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("records.dat"));
    }
}
