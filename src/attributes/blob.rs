//! Blob layout in `attributes.dat`.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ------------------------------
//!      0     4  magic
//!      4     4  len (payload bytes)
//!      8     4  entity
//!     12     4  key (attribute key id, DIRECTORY_KEY for directories)
//!     16     4  version
//!     20     4  crc32c of payload
//!     24   len  payload, zero-padded to 8
//! ```
//!
//! A blob pointer is `offset / 8`. Directory payloads are `(key, pointer)`
//! u32 pairs sorted by key.

use crc::{Crc, CRC_32_ISCSI};

use crate::config::BLOB_ALIGNMENT;

pub const BLOB_MAGIC: u32 = 0x424F_4C42;
pub const BLOB_HEADER_SIZE: usize = 24;

/// Key id reserved for per-entity attribute directories.
pub const DIRECTORY_KEY: u32 = u32::MAX;

pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    pub len: u32,
    pub entity: u32,
    pub key: u32,
    pub version: u32,
    pub crc: u32,
}

impl BlobHeader {
    pub fn decode(raw: &[u8; BLOB_HEADER_SIZE]) -> Option<Self> {
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        if word(0) != BLOB_MAGIC {
            return None;
        }
        Some(Self {
            len: word(4),
            entity: word(8),
            key: word(12),
            version: word(16),
            crc: word(20),
        })
    }
}

pub fn stored_size(payload_len: usize) -> u64 {
    (BLOB_HEADER_SIZE + payload_len).next_multiple_of(BLOB_ALIGNMENT) as u64
}

pub fn encode(entity: u32, key: u32, version: u32, payload: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(stored_size(payload.len()) as usize);
    for word in [
        BLOB_MAGIC,
        payload.len() as u32,
        entity,
        key,
        version,
        CRC32C.checksum(payload),
    ] {
        blob.extend_from_slice(&word.to_le_bytes());
    }
    blob.extend_from_slice(payload);
    blob.resize(stored_size(payload.len()) as usize, 0);
    blob
}

pub fn encode_directory(entries: &[(u32, u32)]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(entries.len() * 8);
    for (key, pointer) in entries {
        payload.extend_from_slice(&key.to_le_bytes());
        payload.extend_from_slice(&pointer.to_le_bytes());
    }
    payload
}

/// Returns `None` when the payload is not a whole number of pairs.
pub fn decode_directory(payload: &[u8]) -> Option<Vec<(u32, u32)>> {
    if payload.len() % 8 != 0 {
        return None;
    }
    Some(
        payload
            .chunks_exact(8)
            .map(|pair| {
                (
                    u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]),
                    u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]),
                )
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_blob_is_aligned_and_decodes() {
        let blob = encode(7, 3, 2, b"hello");
        assert_eq!(blob.len() % BLOB_ALIGNMENT, 0);
        assert_eq!(blob.len() as u64, stored_size(5));

        let mut raw = [0u8; BLOB_HEADER_SIZE];
        raw.copy_from_slice(&blob[..BLOB_HEADER_SIZE]);
        let header = BlobHeader::decode(&raw).unwrap();
        assert_eq!(header.len, 5);
        assert_eq!(header.entity, 7);
        assert_eq!(header.key, 3);
        assert_eq!(header.version, 2);
        assert_eq!(header.crc, CRC32C.checksum(b"hello"));
        assert_eq!(&blob[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + 5], b"hello");
    }

    #[test]
    fn bad_magic_does_not_decode() {
        assert!(BlobHeader::decode(&[0u8; BLOB_HEADER_SIZE]).is_none());
    }

    #[test]
    fn directory_pairs() {
        let entries = vec![(1, 100), (5, 200)];
        assert_eq!(decode_directory(&encode_directory(&entries)).unwrap(), entries);
        assert!(decode_directory(&[0u8; 7]).is_none());
    }
}
