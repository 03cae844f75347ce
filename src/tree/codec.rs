//! Children list encoding.
//!
//! ```text
//! varint  mod_count of the parent once the list is saved
//! varint  child count
//! repeated:
//!   zigzag varint  child id minus previous child id (first: minus 0)
//!   varint         name id
//! ```

use eyre::{ensure, Result};

use super::ChildEntry;
use crate::encoding::{put_varint, varint_len, zigzag_encode, VarintCursor};

pub(super) fn encode(mod_count: u32, children: &[ChildEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(varint_len(children.len() as u64) + 5 + children.len() * 4);
    put_varint(&mut out, mod_count as u64);
    put_varint(&mut out, children.len() as u64);
    let mut previous = 0i64;
    for child in children {
        put_varint(&mut out, zigzag_encode(child.id as i64 - previous));
        put_varint(&mut out, child.name_id as u64);
        previous = child.id as i64;
    }
    out
}

/// Reads the header, returning `(mod_count, count, cursor at first child)`.
pub(super) fn header(bytes: &[u8]) -> Result<(u32, usize, VarintCursor<'_>)> {
    let mut cursor = VarintCursor::new(bytes);
    let mod_count = cursor.read_u32()?;
    let count = cursor.read_u64()?;
    // every child takes at least two bytes
    ensure!(
        count <= (bytes.len() as u64) / 2,
        "children count {} exceeds blob of {} bytes",
        count,
        bytes.len()
    );
    Ok((mod_count, count as usize, cursor))
}

/// Visits children in stored order until `visitor` returns false. Returns
/// whether every child was visited.
pub(super) fn visit(bytes: &[u8], mut visitor: impl FnMut(ChildEntry) -> bool) -> Result<bool> {
    let (_, count, mut cursor) = header(bytes)?;
    let mut previous = 0i64;
    for _ in 0..count {
        let id = previous + cursor.read_zigzag()?;
        ensure!(
            (1..=u32::MAX as i64).contains(&id),
            "child id {} out of range",
            id
        );
        let name_id = cursor.read_u32()?;
        previous = id;
        if !visitor(ChildEntry {
            id: id as u32,
            name_id,
        }) {
            return Ok(false);
        }
    }
    ensure!(cursor.is_at_end(), "trailing bytes after {} children", count);
    Ok(true)
}

/// Returns the stored parent `mod_count` and the children.
pub(super) fn decode(bytes: &[u8]) -> Result<(u32, Vec<ChildEntry>)> {
    let (mod_count, count, _) = header(bytes)?;
    let mut children = Vec::with_capacity(count);
    visit(bytes, |child| {
        children.push(child);
        true
    })?;
    Ok((mod_count, children))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u32, name_id: u32) -> ChildEntry {
        ChildEntry { id, name_id }
    }

    #[test]
    fn keeps_order_including_decreasing_ids() {
        let children = vec![entry(10, 3), entry(4, 9), entry(4_000_000, 1), entry(11, 2)];
        let bytes = encode(7, &children);

        let (mod_count, count, _) = header(&bytes).unwrap();
        assert_eq!((mod_count, count), (7, 4));
        assert_eq!(decode(&bytes).unwrap(), (7, children));
    }

    #[test]
    fn dense_ids_stay_compact() {
        let children: Vec<ChildEntry> = (1..=1000).map(|i| entry(i, 5)).collect();
        let bytes = encode(0, &children);
        assert!(bytes.len() < 2_010);
    }

    #[test]
    fn visit_stops_early() {
        let bytes = encode(0, &[entry(1, 1), entry(2, 2), entry(3, 3)]);
        let mut seen = Vec::new();
        let completed = visit(&bytes, |child| {
            seen.push(child.id);
            child.id < 2
        })
        .unwrap();
        assert!(!completed);
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn truncated_blob_fails() {
        let bytes = encode(0, &[entry(1, 300), entry(2, 400)]);
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode(&[]).is_err());
    }
}
