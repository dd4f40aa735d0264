//! Canonical byte encoding, pinned per SPEC_FULL.md §4.1.
//!
//! Every field is written in declaration order. Variable-length byte
//! fields are a big-endian `u32` length prefix followed by the raw
//! bytes; fixed-width integers (`u64` view components) are written as
//! 8-byte big-endian words with no prefix; optional fields get a single
//! presence byte; repeated fields get a `u32` count prefix. This is a
//! length-prefixed concatenation scheme — deterministic, unambiguous,
//! and cheap to stream into a hasher without an intermediate buffer.

use byteorder::{BigEndian, WriteBytesExt};

/// A type with a frozen, signature-independent canonical encoding.
pub trait CanonicalEncode {
    fn encode_canonical(&self, buf: &mut Vec<u8>);

    /// Convenience: encode into a freshly allocated buffer.
    fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_canonical(&mut buf);
        buf
    }
}

pub fn write_u64(buf: &mut Vec<u8>, value: u64) {
    // `Vec<u8>` as `io::Write` never fails.
    buf.write_u64::<BigEndian>(value)
        .expect("writing to a Vec<u8> is infallible");
}

pub fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.write_u32::<BigEndian>(data.len() as u32)
        .expect("writing to a Vec<u8> is infallible");
    buf.extend_from_slice(data);
}

pub fn write_count(buf: &mut Vec<u8>, count: usize) {
    buf.write_u32::<BigEndian>(count as u32)
        .expect("writing to a Vec<u8> is infallible");
}

pub fn write_option<T>(buf: &mut Vec<u8>, value: &Option<T>, encode_some: impl FnOnce(&mut Vec<u8>, &T)) {
    match value {
        None => buf.push(0x00),
        Some(v) => {
            buf.push(0x01);
            encode_some(buf, v);
        }
    }
}

pub fn write_repeated<T>(buf: &mut Vec<u8>, items: &[T], mut encode_one: impl FnMut(&mut Vec<u8>, &T)) {
    write_count(buf, items.len());
    for item in items {
        encode_one(buf, item);
    }
}
