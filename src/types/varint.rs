//! Variable-length integers: 1 to 9 bytes, big-endian, 7 bits per byte
//! except the ninth byte which contributes all 8 bits.

use crate::types::error::{DatabaseError, Result};

pub const MAX_VARINT_LEN: usize = 9;

pub fn varint_len(value: u64) -> usize {
    if value & 0xff00_0000_0000_0000 != 0 {
        return 9;
    }
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Encodes `value` into `out`, returning the number of bytes written.
pub fn put_varint(out: &mut [u8], value: u64) -> usize {
    if value & 0xff00_0000_0000_0000 != 0 {
        out[8] = value as u8;
        let mut v = value >> 8;
        for i in (0..8).rev() {
            out[i] = ((v & 0x7f) | 0x80) as u8;
            v >>= 7;
        }
        return 9;
    }
    let len = varint_len(value);
    let mut v = value;
    for i in (0..len).rev() {
        let byte = (v & 0x7f) as u8;
        out[i] = if i == len - 1 { byte } else { byte | 0x80 };
        v >>= 7;
    }
    len
}

pub fn write_varint(buffer: &mut Vec<u8>, value: u64) {
    let mut scratch = [0u8; MAX_VARINT_LEN];
    let len = put_varint(&mut scratch, value);
    buffer.extend_from_slice(&scratch[..len]);
}

/// Decodes a varint from the start of `bytes`, returning the value and its length.
pub fn read_varint(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for i in 0..8 {
        let byte = *bytes
            .get(i)
            .ok_or_else(|| DatabaseError::corrupt(0, "truncated varint"))?;
        value = (value << 7) | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    let last = *bytes
        .get(8)
        .ok_or_else(|| DatabaseError::corrupt(0, "truncated varint"))?;
    Ok(((value << 8) | last as u64, 9))
}
