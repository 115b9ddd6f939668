//! Type References
//!
//! Polymorphic payloads are prefixed with a reference to their concrete type.
//!
//! ```text
//! exact expected type:   00 00
//! any other type:        len:u16le  hash:u16le  name:utf8[len]
//! ```
//!
//! The hash lets the reader find an interned name by `(len, hash)` without
//! decoding UTF-8, and catches corrupted names: a hash that doesn't match the
//! name bytes fails the read.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use smallvec::SmallVec;

use crate::error::{Error, Result};

const NULL_MARKER: [u8; 2] = [0, 0];

/// Interned type names, keyed by `(length, hash)`.
static TYPE_NAMES: OnceLock<DashMap<(u16, u16), SmallVec<[Arc<str>; 2]>>> = OnceLock::new();

/// Names arrive from remote peers, so the table stops growing here; later
/// names are still returned, just not shared.
const MAX_INTERNED_NAMES: usize = 1024;

static INTERNED: AtomicUsize = AtomicUsize::new(0);

fn type_names() -> &'static DashMap<(u16, u16), SmallVec<[Arc<str>; 2]>> {
    TYPE_NAMES.get_or_init(DashMap::new)
}

fn intern(len: u16, hash: u16, name: Arc<str>) {
    let reserved = INTERNED
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
            (count < MAX_INTERNED_NAMES).then_some(count + 1)
        })
        .is_ok();
    if !reserved {
        return;
    }
    let mut candidates = type_names().entry((len, hash)).or_default();
    if candidates.iter().any(|known| *known == name) {
        INTERNED.fetch_sub(1, Ordering::Relaxed);
    } else {
        candidates.push(name);
    }
}

fn interned_count() -> usize {
    INTERNED.load(Ordering::Relaxed)
}

/// 16-bit fold of the FNV-1a hash of `bytes`.
pub fn type_hash(bytes: &[u8]) -> u16 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    ((hash >> 16) ^ (hash & 0xffff)) as u16
}

/// Write a reference to `actual`, or the null marker when it equals
/// `expected`.
pub fn write_type_ref(buffer: &mut Vec<u8>, expected: &str, actual: &str) -> Result<()> {
    if expected == actual {
        buffer.extend_from_slice(&NULL_MARKER);
        return Ok(());
    }
    let bytes = actual.as_bytes();
    let len = u16::try_from(bytes.len())
        .ok()
        .filter(|len| *len > 0)
        .ok_or_else(|| Error::InvalidTypeRef(format!("type name has {} bytes", bytes.len())))?;
    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(&type_hash(bytes).to_le_bytes());
    buffer.extend_from_slice(bytes);
    Ok(())
}

/// Read a type reference from the front of `data`, advancing it.
///
/// Returns `expected` for the null marker.
pub fn read_type_ref(data: &mut &[u8], expected: &str) -> Result<Arc<str>> {
    let header = take(data, 2)?;
    let len = u16::from_le_bytes([header[0], header[1]]);
    if len == 0 {
        return Ok(Arc::from(expected));
    }
    let hash_bytes = take(data, 2)?;
    let hash = u16::from_le_bytes([hash_bytes[0], hash_bytes[1]]);
    let name = take(data, usize::from(len))?;
    if type_hash(name) != hash {
        return Err(Error::InvalidTypeRef(format!(
            "hash mismatch for {}-byte name",
            len
        )));
    }

    let names = type_names();
    if let Some(candidates) = names.get(&(len, hash)) {
        if let Some(known) = candidates.iter().find(|known| known.as_bytes() == name) {
            return Ok(known.clone());
        }
    }
    let decoded = std::str::from_utf8(name)
        .map_err(|error| Error::InvalidTypeRef(error.to_string()))?;
    let decoded: Arc<str> = Arc::from(decoded);
    intern(len, hash, decoded.clone());
    Ok(decoded)
}

fn take<'a>(data: &mut &'a [u8], count: usize) -> Result<&'a [u8]> {
    if data.len() < count {
        return Err(Error::InvalidTypeRef(format!(
            "need {count} bytes, have {}",
            data.len()
        )));
    }
    let (head, tail) = data.split_at(count);
    *data = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_type_is_two_zero_bytes() {
        let mut buffer = Vec::new();
        write_type_ref(&mut buffer, "Error", "Error").unwrap();
        assert_eq!(buffer, vec![0, 0]);

        let mut data = buffer.as_slice();
        assert_eq!(&*read_type_ref(&mut data, "Error").unwrap(), "Error");
        assert!(data.is_empty());
    }

    #[test]
    fn other_types_carry_length_hash_and_name() {
        let mut buffer = Vec::new();
        write_type_ref(&mut buffer, "Error", "CallTimeout").unwrap();
        assert_eq!(&buffer[0..2], &11u16.to_le_bytes());
        assert_eq!(&buffer[2..4], &type_hash(b"CallTimeout").to_le_bytes());
        assert_eq!(&buffer[4..], b"CallTimeout");

        buffer.extend_from_slice(b"rest");
        let mut data = buffer.as_slice();
        assert_eq!(&*read_type_ref(&mut data, "Error").unwrap(), "CallTimeout");
        assert_eq!(data, b"rest");
    }

    #[test]
    fn interning_stops_at_the_cap() {
        for n in 0..MAX_INTERNED_NAMES + 100 {
            let mut buffer = Vec::new();
            write_type_ref(&mut buffer, "Error", &format!("Kind{n}")).unwrap();
            let mut data = buffer.as_slice();
            assert_eq!(&*read_type_ref(&mut data, "Error").unwrap(), format!("Kind{n}"));
        }
        assert!(interned_count() <= MAX_INTERNED_NAMES);
        let stored: usize = type_names().iter().map(|entry| entry.value().len()).sum();
        assert!(stored <= MAX_INTERNED_NAMES);
    }

    #[test]
    fn corrupted_names_are_rejected() {
        let mut buffer = Vec::new();
        write_type_ref(&mut buffer, "Error", "Remote").unwrap();
        let last = buffer.len() - 1;
        buffer[last] ^= 0x20;
        let mut data = buffer.as_slice();
        assert!(matches!(
            read_type_ref(&mut data, "Error"),
            Err(Error::InvalidTypeRef(_))
        ));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let mut data: &[u8] = &[5, 0, 1];
        assert!(read_type_ref(&mut data, "Error").is_err());
    }
}
