//! Binary profile blobs.
//!
//! All blobs are little-endian, start with a magic and a version and keep
//! every section 4-byte aligned. Readers validate the whole blob before
//! handing out views.

mod path;
mod rules;

pub use path::{BlobStats, PathBlobView};
pub use rules::{MountBlobView, MountRuleView, NetBlobView, NetRuleView};
pub(crate) use path::{encode_dfa, encode_trie, path_blob_size};
pub(crate) use rules::{encode_mount_rules, encode_net_rules};

use crate::error::{Error, Result};
use std::collections::HashMap;

pub const PROTECC_PROFILE_MAGIC: u32 = u32::from_le_bytes(*b"PRTC");
pub const PROTECC_NET_PROFILE_MAGIC: u32 = u32::from_le_bytes(*b"PRTN");
pub const PROTECC_MOUNT_PROFILE_MAGIC: u32 = u32::from_le_bytes(*b"PRTM");
pub const PROTECC_BLOB_VERSION: u32 = 1;

pub const FLAG_TYPE_TRIE: u32 = 1;
pub const FLAG_TYPE_DFA: u32 = 1 << 1;
pub const FLAG_CASE_INSENSITIVE: u32 = 1 << 2;

/// String offset meaning "absent".
pub const NO_STRING: u32 = u32::MAX;

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Bounds-checked little-endian read.
pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    offset
        .checked_add(4)
        .and_then(|end| bytes.get(offset..end))
        .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .ok_or_else(|| Error::blob(format!("read past end at offset {offset}")))
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    offset
        .checked_add(2)
        .and_then(|end| bytes.get(offset..end))
        .map(|raw| u16::from_le_bytes([raw[0], raw[1]]))
        .ok_or_else(|| Error::blob(format!("read past end at offset {offset}")))
}

/// Read from a region that has already been validated.
pub(crate) fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

pub(crate) fn checked_size(parts: &[(usize, usize)], base: usize) -> Option<usize> {
    parts.iter().try_fold(base, |acc, &(count, size)| {
        count.checked_mul(size).and_then(|bytes| acc.checked_add(bytes))
    })
}

/// Deduplicating builder for the trailing string heap.
#[derive(Default)]
pub(crate) struct StringHeap {
    bytes: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StringHeap {
    pub(crate) fn add(&mut self, value: Option<&str>) -> Result<u32> {
        let Some(value) = value else {
            return Ok(NO_STRING);
        };
        if let Some(&offset) = self.offsets.get(value) {
            return Ok(offset);
        }
        let offset = u32::try_from(self.bytes.len())
            .ok()
            .filter(|&offset| offset != NO_STRING)
            .ok_or_else(|| Error::CompileFailed("string heap exceeds 4 GiB".into()))?;
        self.bytes
            .try_reserve(value.len() + 1)
            .map_err(|_| Error::OutOfMemory("growing the string heap"))?;
        self.bytes.extend_from_slice(value.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(value.to_string(), offset);
        Ok(offset)
    }

    /// Heap bytes padded to a multiple of four.
    pub(crate) fn finish(mut self) -> Vec<u8> {
        let padded = self.bytes.len().next_multiple_of(4);
        self.bytes.resize(padded, 0);
        self.bytes
    }
}

/// Resolves a heap offset to a NUL-terminated UTF-8 string.
pub(crate) fn heap_str(heap: &[u8], offset: u32) -> Result<Option<&str>> {
    if offset == NO_STRING {
        return Ok(None);
    }
    let start = offset as usize;
    let tail = heap
        .get(start..)
        .filter(|tail| !tail.is_empty())
        .ok_or_else(|| Error::blob(format!("string offset {offset} outside heap")))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::blob(format!("string at {offset} is not NUL-terminated")))?;
    std::str::from_utf8(&tail[..len])
        .map(Some)
        .map_err(|_| Error::blob(format!("string at {offset} is not UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn heap_deduplicates_and_pads() {
        let mut heap = StringHeap::default();
        assert_eq!(heap.add(Some("abc")).unwrap(), 0);
        assert_eq!(heap.add(None).unwrap(), NO_STRING);
        assert_eq!(heap.add(Some("de")).unwrap(), 4);
        assert_eq!(heap.add(Some("abc")).unwrap(), 0);
        let bytes = heap.finish();
        assert_eq!(bytes, b"abc\0de\0\0");
    }

    #[test]
    fn heap_strings_must_terminate() {
        let heap = b"abc\0def";
        assert_eq!(heap_str(heap, 0).unwrap(), Some("abc"));
        assert_eq!(heap_str(heap, NO_STRING).unwrap(), None);
        assert_eq!(heap_str(heap, 4).unwrap_err().kind(), ErrorKind::InvalidBlob);
        assert_eq!(heap_str(heap, 7).unwrap_err().kind(), ErrorKind::InvalidBlob);
        assert_eq!(heap_str(heap, 100).unwrap_err().kind(), ErrorKind::InvalidBlob);
    }

    #[test]
    fn magics_are_distinct() {
        assert_ne!(PROTECC_PROFILE_MAGIC, PROTECC_NET_PROFILE_MAGIC);
        assert_ne!(PROTECC_NET_PROFILE_MAGIC, PROTECC_MOUNT_PROFILE_MAGIC);
        assert_eq!(read_u32(b"PRTC", 0).unwrap(), PROTECC_PROFILE_MAGIC);
        assert!(read_u32(b"PRT", 0).is_err());
    }
}
