//! Stream adapters over attribute values.

use std::borrow::Cow;
use std::io;

use eyre::Result;

use super::{AttributeKey, AttributeStore};
use crate::config::MAX_ATTRIBUTE_SIZE;

/// Reads one attribute value. Borrows mapped memory when the blob lies in a
/// single chunk.
#[derive(Debug)]
pub struct AttributeReader<'a> {
    data: Cow<'a, [u8]>,
    pos: usize,
}

impl<'a> AttributeReader<'a> {
    pub(super) fn new(data: Cow<'a, [u8]>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data.into_owned()
    }
}

impl io::Read for AttributeReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = &self.data[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// Buffers a new attribute value. Nothing is visible to readers until
/// [`commit`](AttributeWriter::commit); dropping the writer keeps the
/// previous value.
#[derive(Debug)]
pub struct AttributeWriter<'a> {
    store: &'a AttributeStore,
    entity: u32,
    key: AttributeKey,
    buf: Vec<u8>,
}

impl<'a> AttributeWriter<'a> {
    pub(super) fn new(store: &'a AttributeStore, entity: u32, key: AttributeKey) -> Self {
        Self {
            store,
            entity,
            key,
            buf: Vec::new(),
        }
    }

    pub fn commit(self) -> Result<()> {
        self.store
            .write_attribute_bytes(self.entity, &self.key, &self.buf)
    }
}

impl io::Write for AttributeWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > MAX_ATTRIBUTE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "attribute '{}' would exceed {} bytes",
                    self.key.name(),
                    MAX_ATTRIBUTE_SIZE
                ),
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
