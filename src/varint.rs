//! Unsigned LEB128 varints.
//!
//! Used for the length prefix on data shards and for every length/count in
//! the node envelopes. 7 bits per byte, low group first, high bit set on
//! every byte except the last. A u64 takes 1-10 bytes.

/// Maximum encoded length of a u64.
pub const MAX_VARINT_LEN: usize = 10;

/// Number of bytes needed to encode `value`.
pub const fn varint_len(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Write `value` into the front of `buf`, returning the number of bytes written.
///
/// `buf` must hold at least `varint_len(value)` bytes.
pub fn write_varint(buf: &mut [u8], value: u64) -> usize {
    let mut v = value;
    let mut i = 0;
    while v >= 0x80 {
        buf[i] = (v as u8) | 0x80;
        v >>= 7;
        i += 1;
    }
    buf[i] = v as u8;
    i + 1
}

/// Append `value` to `out`.
pub fn push_varint(out: &mut Vec<u8>, value: u64) {
    let mut tmp = [0u8; MAX_VARINT_LEN];
    let n = write_varint(&mut tmp, value);
    out.extend_from_slice(&tmp[..n]);
}

/// Read a varint from a byte slice, returning `(value, bytes_consumed)`.
///
/// Returns None on truncated input or on overflow past 64 bits.
pub fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        let group = u64::from(byte & 0x7f);
        if i == MAX_VARINT_LEN - 1 && group > 1 {
            return None;
        }
        value |= group << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}
