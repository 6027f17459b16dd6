//! Hash index artifacts: deterministic value hash → row-group ids.
//!
//! Used for equality predicates; unlike the bloom index the mapping is
//! exact over hashes, so an absent hash proves the value is absent while a
//! present hash narrows the scan to the listed row groups.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{ParqueError, Result, StorageErrorKind};

const FORMAT_VERSION: u8 = 0x03;

/// Exact hash → row-group multimap for one indexed field of a segment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HashIndex {
    /// Sorted by hash; values are sorted, deduplicated row-group ids.
    entries: BTreeMap<u64, Vec<u16>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HashIndexStats {
    pub distinct_hashes: usize,
    pub total_postings: usize,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the indexed values of each row group.
    pub fn build<S: AsRef<[u8]>>(values_per_row_group: &[Vec<S>]) -> Self {
        let mut index = Self::new();
        for (rg, values) in values_per_row_group.iter().enumerate() {
            for value in values {
                index.insert(value.as_ref(), rg as u16);
            }
        }
        index
    }

    pub fn insert(&mut self, value: &[u8], row_group: u16) {
        let groups = self.entries.entry(hash_value(value)).or_default();
        if let Err(pos) = groups.binary_search(&row_group) {
            groups.insert(pos, row_group);
        }
    }

    /// Row groups that contain the value's hash. Empty proves absence.
    pub fn lookup(&self, value: &[u8]) -> Vec<u16> {
        self.entries
            .get(&hash_value(value))
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> HashIndexStats {
        HashIndexStats {
            distinct_hashes: self.entries.len(),
            total_postings: self.entries.values().map(Vec::len).sum(),
        }
    }

    /// Serialize: version byte (0x03), flags byte, entryCount (u32 BE),
    /// then per entry `hash (u64 BE) | count (u16 BE) | row-group ids`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(FORMAT_VERSION);
        out.push(0u8); // flags
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for (hash, groups) in &self.entries {
            out.extend_from_slice(&hash.to_be_bytes());
            out.extend_from_slice(&(groups.len() as u16).to_be_bytes());
            for rg in groups {
                out.extend_from_slice(&rg.to_be_bytes());
            }
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let corrupted = |detail: &str| ParqueError::Storage {
            kind: StorageErrorKind::Corrupted,
            detail: format!("hash index: {detail}"),
        };

        if data.len() < 6 {
            return Err(corrupted("truncated header"));
        }
        if data[0] != FORMAT_VERSION {
            return Err(corrupted(&format!("unsupported version {:#04x}", data[0])));
        }
        let entry_count = u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;

        let mut entries = BTreeMap::new();
        let mut offset = 6;
        for _ in 0..entry_count {
            if data.len() < offset + 10 {
                return Err(corrupted("truncated entry"));
            }
            let mut hash_bytes = [0u8; 8];
            hash_bytes.copy_from_slice(&data[offset..offset + 8]);
            let hash = u64::from_be_bytes(hash_bytes);
            let count = u16::from_be_bytes([data[offset + 8], data[offset + 9]]) as usize;
            offset += 10;

            if data.len() < offset + count * 2 {
                return Err(corrupted("truncated posting list"));
            }
            let mut groups = Vec::with_capacity(count);
            for _ in 0..count {
                groups.push(u16::from_be_bytes([data[offset], data[offset + 1]]));
                offset += 2;
            }
            entries.insert(hash, groups);
        }

        Ok(Self { entries })
    }
}

/// Deterministic 64-bit FNV-1a, shared with the reader side so serialized
/// indexes stay valid across processes.
fn hash_value(data: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_exact() {
        let index = HashIndex::build(&[
            vec!["alice", "bob"],
            vec!["bob", "carol"],
            vec!["dave"],
        ]);

        assert_eq!(index.lookup(b"alice"), vec![0]);
        assert_eq!(index.lookup(b"bob"), vec![0, 1]);
        assert_eq!(index.lookup(b"dave"), vec![2]);
        assert!(index.lookup(b"absent").is_empty());
    }

    #[test]
    fn test_insert_deduplicates() {
        let mut index = HashIndex::new();
        index.insert(b"x", 3);
        index.insert(b"x", 3);
        index.insert(b"x", 1);
        assert_eq!(index.lookup(b"x"), vec![1, 3]);
    }

    #[test]
    fn test_wire_round_trip() {
        let index = HashIndex::build(&[vec!["a", "b"], vec!["b", "c"], vec!["c"]]);
        let parsed = HashIndex::from_bytes(&index.to_bytes()).unwrap();
        assert_eq!(parsed, index);
    }

    #[test]
    fn test_header_layout() {
        let index = HashIndex::build(&[vec!["a"]]);
        let bytes = index.to_bytes();
        assert_eq!(bytes[0], 0x03);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]), 1);
    }

    #[test]
    fn test_corrupted_rejected() {
        let index = HashIndex::build(&[vec!["a", "b"]]);
        let mut bytes = index.to_bytes();

        bytes[0] = 0x01;
        assert!(matches!(
            HashIndex::from_bytes(&bytes).unwrap_err(),
            ParqueError::Storage {
                kind: StorageErrorKind::Corrupted,
                ..
            }
        ));

        let truncated = &index.to_bytes()[..8];
        assert!(HashIndex::from_bytes(truncated).is_err());
    }

    #[test]
    fn test_deterministic_across_builds() {
        let a = HashIndex::build(&[vec!["k1", "k2"], vec!["k3"]]);
        let b = HashIndex::build(&[vec!["k1", "k2"], vec!["k3"]]);
        assert_eq!(a.to_bytes(), b.to_bytes());
    }
}
