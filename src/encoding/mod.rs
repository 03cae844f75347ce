//! # Encoding Module
//!
//! Compact integer encodings used inside attribute blobs (children lists).

pub mod varint;

pub use varint::{put_varint, varint_len, zigzag_decode, zigzag_encode, VarintCursor};
