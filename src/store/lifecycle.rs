//! # Store Lifecycle
//!
//! `close` runs once: the name index drains its background build, every
//! file is flushed, every header is marked clean, and the root lock is
//! released. A store dropped without `close` still runs the same sequence,
//! ignoring failures. A process that dies before either leaves headers
//! marked dirty, which the next connect treats as an unclean shutdown.
//!
//! `mark_corrupted` records a reason in `corruption.marker`; the next
//! connect discards the data files and starts over.

use std::fs;
use std::sync::atomic::Ordering;

use eyre::{Result, WrapErr};

use super::connect::CORRUPTION_MARKER_FILE_NAME;
use super::VfsStore;
use crate::error::StoreError;

impl VfsStore {
    /// Flushes every component without changing the clean-shutdown state.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.flush_components()
    }

    fn flush_components(&self) -> Result<()> {
        self.records.flush()?;
        self.names.enumerator().flush()?;
        self.attributes.flush()?;
        if let Some(parts) = &self.durable {
            parts.flush()?;
        }
        self.index.flush()
    }

    /// Closes the store. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.index.close().wrap_err("failed to close name index")?;
        self.flush_components()
            .wrap_err_with(|| format!("failed to flush store at '{}'", self.root.display()))?;

        if let Some(parts) = &self.durable {
            parts.set_clean_shutdown(true)?;
        }
        self.attributes.set_clean_shutdown(true)?;
        if let Some(index) = &self.durable_index {
            index.set_clean_shutdown(true)?;
        }
        self.flush_components()?;

        self.lock.lock().take();
        tracing::info!(root = %self.root.display(), "closed store");
        Ok(())
    }

    /// Flags the store so the next connect rebuilds it. The store stays
    /// usable for the rest of this session.
    pub fn mark_corrupted(&self, reason: &str) -> Result<()> {
        self.ensure_open()?;
        let path = self.root.join(CORRUPTION_MARKER_FILE_NAME);
        fs::write(&path, reason.as_bytes())
            .map_err(|e| StoreError::io(&path, "write corruption marker", e))?;
        tracing::error!(root = %self.root.display(), reason, "store marked corrupted");
        Ok(())
    }
}

impl Drop for VfsStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::error!(error = %format!("{:#}", err), "failed to close store on drop");
        }
    }
}
