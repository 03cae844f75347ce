//! # Variable-Length Integer Encoding
//!
//! Children lists are stored as runs of small integers: a count, id deltas
//! between neighbouring children and name ids. This module encodes them with
//! a marker-byte varint and maps signed deltas onto it with zigzag encoding.
//!
//! ## Encoding Format
//!
//! | Value Range              | Bytes | Format                            |
//! |--------------------------|-------|-----------------------------------|
//! | 0 - 240                  | 1     | `[value]`                         |
//! | 241 - 2287               | 2     | `[241 + (v-240)>>8, (v-240)&FF]`  |
//! | 2288 - 67823             | 3     | `[249, (v-2288)>>8, (v-2288)&FF]` |
//! | 67824 - 16777215         | 4     | `[250, v>>16, v>>8, v]`           |
//! | 16777216 - 4294967295    | 5     | `[251, v>>24, v>>16, v>>8, v]`    |
//! | 4294967296 - u64::MAX    | 9     | `[255, 8-byte big-endian]`        |
//!
//! Markers 252-254 are invalid.
//!
//! ## Zigzag
//!
//! Sibling ids are mostly increasing but not always, so deltas are signed.
//! Zigzag interleaves them so small magnitudes of either sign stay short:
//!
//! ```text
//!  0 -> 0    -1 -> 1    1 -> 2    -2 -> 3    2 -> 4 ...
//! ```
//!
//! ## Decoding
//!
//! [`VarintCursor`] walks a borrowed buffer and reports truncation or a bad
//! marker as an error; callers turn that into a corruption error carrying
//! the blob's location.

use eyre::{bail, ensure, Result};

const MAX_VARINT_LEN: usize = 9;

pub fn varint_len(value: u64) -> usize {
    match value {
        0..=240 => 1,
        241..=2287 => 2,
        2288..=67823 => 3,
        67824..=0xFF_FFFF => 4,
        0x100_0000..=0xFFFF_FFFF => 5,
        _ => MAX_VARINT_LEN,
    }
}

/// Appends the encoding of `value` to `out`.
pub fn put_varint(out: &mut Vec<u8>, value: u64) {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let len = encode_varint(value, &mut buf);
    out.extend_from_slice(&buf[..len]);
}

/// Writes the encoding into `buf`, which must hold `varint_len(value)` bytes.
pub fn encode_varint(value: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    match value {
        0..=240 => {
            buf[0] = value as u8;
            1
        }
        241..=2287 => {
            let v = value - 240;
            buf[0] = (241 + (v >> 8)) as u8;
            buf[1] = v as u8;
            2
        }
        2288..=67823 => {
            let v = value - 2288;
            buf[0] = 249;
            buf[1] = (v >> 8) as u8;
            buf[2] = v as u8;
            3
        }
        67824..=0xFF_FFFF => {
            buf[0] = 250;
            buf[1..4].copy_from_slice(&(value as u32).to_be_bytes()[1..]);
            4
        }
        0x100_0000..=0xFFFF_FFFF => {
            buf[0] = 251;
            buf[1..5].copy_from_slice(&(value as u32).to_be_bytes());
            5
        }
        _ => {
            buf[0] = 255;
            buf[1..9].copy_from_slice(&value.to_be_bytes());
            9
        }
    }
}

#[inline]
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Sequential reader over an encoded buffer.
#[derive(Debug)]
pub struct VarintCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> VarintCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.buf.len() - self.pos >= n,
            "truncated varint at byte {} (need {} more, have {})",
            self.pos,
            n,
            self.buf.len() - self.pos
        );
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let marker = self.take(1)?[0];
        let value = match marker {
            0..=240 => marker as u64,
            241..=248 => {
                let next = self.take(1)?[0];
                240 + (((marker - 241) as u64) << 8) + next as u64
            }
            249 => {
                let b = self.take(2)?;
                2288 + ((b[0] as u64) << 8) + b[1] as u64
            }
            250 => {
                let b = self.take(3)?;
                u32::from_be_bytes([0, b[0], b[1], b[2]]) as u64
            }
            251 => {
                let b = self.take(4)?;
                u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64
            }
            255 => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                u64::from_be_bytes(raw)
            }
            _ => bail!("invalid varint marker {} at byte {}", marker, self.pos - 1),
        };
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let at = self.pos;
        let value = self.read_u64()?;
        u32::try_from(value).map_err(|_| eyre::eyre!("varint at byte {} exceeds u32: {}", at, value))
    }

    pub fn read_zigzag(&mut self) -> Result<i64> {
        Ok(zigzag_decode(self.read_u64()?))
    }
}
