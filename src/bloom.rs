//! Bloom index artifacts for Parquet segments.
//!
//! One filter per row group (fixed 4096-byte bitmaps) plus a namespace-level
//! filter sized from the configured false-positive rate. The on-disk format
//! is `PQBF` followed by a big-endian header; a corrupted header is treated
//! as a missing index and rebuilt on demand.

use serde::Serialize;

use crate::error::{ParqueError, Result, StorageErrorKind};

const MAGIC: &[u8; 4] = b"PQBF";
const FORMAT_VERSION: u16 = 1;

/// Fixed size of each per-row-group filter.
pub const ROW_GROUP_FILTER_SIZE: usize = 4096;

/// A plain bloom filter over byte strings. Double hashing over two FNV-1a
/// passes keeps membership checks deterministic across processes.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_hashes: u16,
}

impl BloomFilter {
    pub fn new(size_bytes: usize, num_hashes: u16) -> Self {
        Self {
            bits: vec![0u8; size_bytes.max(1)],
            num_hashes: num_hashes.max(1),
        }
    }

    /// Size a filter for `expected_items` at the target false-positive rate.
    pub fn sized_for(expected_items: usize, fpr: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let bits = (-(n * fpr.ln()) / (ln2 * ln2)).ceil().max(8.0);
        let bytes = ((bits / 8.0).ceil() as usize).max(1);
        Self::new(bytes, optimal_hashes(fpr))
    }

    pub fn insert(&mut self, value: &[u8]) {
        for bit in self.bit_positions(value) {
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    pub fn contains(&self, value: &[u8]) -> bool {
        self.bit_positions(value)
            .into_iter()
            .all(|bit| self.bits[bit / 8] & (1 << (bit % 8)) != 0)
    }

    fn bit_positions(&self, value: &[u8]) -> Vec<usize> {
        let total_bits = self.bits.len() * 8;
        let h1 = fnv1a(value, 0xcbf2_9ce4_8422_2325);
        let h2 = fnv1a(value, 0x6c62_272e_07bb_0142) | 1;
        (0..self.num_hashes as u64)
            .map(|i| (h1.wrapping_add(i.wrapping_mul(h2)) % total_bits as u64) as usize)
            .collect()
    }

    pub fn len_bytes(&self) -> usize {
        self.bits.len()
    }
}

fn fnv1a(data: &[u8], seed: u64) -> u64 {
    let mut hash = seed;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn optimal_hashes(fpr: f64) -> u16 {
    ((-fpr.ln() / std::f64::consts::LN_2).ceil() as u16).clamp(1, 16)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BloomIndexStats {
    pub row_groups: usize,
    pub namespace_filter_bytes: usize,
    pub num_hashes: u16,
}

/// Bloom index for one segment: a namespace-level filter for whole-segment
/// skips plus one fixed-size filter per row group.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentBloomIndex {
    namespace_filter: BloomFilter,
    row_group_filters: Vec<BloomFilter>,
}

impl SegmentBloomIndex {
    /// Build from the indexed values of each row group.
    pub fn build<S: AsRef<[u8]>>(values_per_row_group: &[Vec<S>], fpr: f64) -> Self {
        let total: usize = values_per_row_group.iter().map(Vec::len).sum();
        let num_hashes = optimal_hashes(fpr);
        let mut namespace_filter = BloomFilter::sized_for(total, fpr);

        let row_group_filters = values_per_row_group
            .iter()
            .map(|values| {
                let mut filter = BloomFilter::new(ROW_GROUP_FILTER_SIZE, num_hashes);
                for value in values {
                    filter.insert(value.as_ref());
                    namespace_filter.insert(value.as_ref());
                }
                filter
            })
            .collect();

        Self {
            namespace_filter,
            row_group_filters,
        }
    }

    /// Probabilistic membership across the whole segment.
    pub fn might_contain(&self, value: &[u8]) -> bool {
        self.namespace_filter.contains(value)
    }

    /// Row groups that may contain the value. Empty means the value is
    /// provably absent from every row group.
    pub fn candidate_row_groups(&self, value: &[u8]) -> Vec<usize> {
        if !self.might_contain(value) {
            return Vec::new();
        }
        self.row_group_filters
            .iter()
            .enumerate()
            .filter(|(_, filter)| filter.contains(value))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn row_group_count(&self) -> usize {
        self.row_group_filters.len()
    }

    pub fn stats(&self) -> BloomIndexStats {
        BloomIndexStats {
            row_groups: self.row_group_filters.len(),
            namespace_filter_bytes: self.namespace_filter.len_bytes(),
            num_hashes: self.namespace_filter.num_hashes,
        }
    }

    /// Serialize to the `PQBF` wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let filter_size = self.namespace_filter.bits.len() as u32;
        let mut out = Vec::with_capacity(
            16 + filter_size as usize + self.row_group_filters.len() * ROW_GROUP_FILTER_SIZE,
        );
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        out.extend_from_slice(&self.namespace_filter.num_hashes.to_be_bytes());
        out.extend_from_slice(&filter_size.to_be_bytes());
        out.extend_from_slice(&(self.row_group_filters.len() as u16).to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // reserved
        out.extend_from_slice(&self.namespace_filter.bits);
        for filter in &self.row_group_filters {
            out.extend_from_slice(&filter.bits);
        }
        out
    }

    /// Parse the `PQBF` wire format. Wrong magic or an unsupported version
    /// is a corruption error; callers treat it as a missing index.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let corrupted = |detail: &str| ParqueError::Storage {
            kind: StorageErrorKind::Corrupted,
            detail: format!("bloom index: {detail}"),
        };

        if data.len() < 16 {
            return Err(corrupted("truncated header"));
        }
        if &data[0..4] != MAGIC {
            return Err(corrupted("bad magic"));
        }
        let version = u16::from_be_bytes([data[4], data[5]]);
        if version != FORMAT_VERSION {
            return Err(corrupted(&format!("unsupported version {version}")));
        }
        let num_hashes = u16::from_be_bytes([data[6], data[7]]);
        let filter_size = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
        let num_row_groups = u16::from_be_bytes([data[12], data[13]]) as usize;

        let expected = 16 + filter_size + num_row_groups * ROW_GROUP_FILTER_SIZE;
        if data.len() < expected {
            return Err(corrupted("truncated body"));
        }

        let namespace_filter = BloomFilter {
            bits: data[16..16 + filter_size].to_vec(),
            num_hashes,
        };
        let mut row_group_filters = Vec::with_capacity(num_row_groups);
        let mut offset = 16 + filter_size;
        for _ in 0..num_row_groups {
            row_group_filters.push(BloomFilter {
                bits: data[offset..offset + ROW_GROUP_FILTER_SIZE].to_vec(),
                num_hashes,
            });
            offset += ROW_GROUP_FILTER_SIZE;
        }

        Ok(Self {
            namespace_filter,
            row_group_filters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_values() -> Vec<Vec<String>> {
        (0..4)
            .map(|rg| (0..100).map(|i| format!("value-{rg}-{i}")).collect())
            .collect()
    }

    #[test]
    fn test_no_false_negatives() {
        let values = sample_values();
        let index = SegmentBloomIndex::build(&values, 0.01);

        for (rg, rg_values) in values.iter().enumerate() {
            for value in rg_values {
                assert!(index.might_contain(value.as_bytes()));
                assert!(
                    index.candidate_row_groups(value.as_bytes()).contains(&rg),
                    "row group {rg} must be a candidate for {value}"
                );
            }
        }
    }

    #[test]
    fn test_false_positive_rate_near_configured() {
        let values = sample_values();
        let index = SegmentBloomIndex::build(&values, 0.01);

        let false_positives = (0..10_000)
            .filter(|i| index.might_contain(format!("absent-{i}").as_bytes()))
            .count();
        // Allow generous slack over the 1% target.
        assert!(
            false_positives < 500,
            "false positive rate too high: {false_positives}/10000"
        );
    }

    #[test]
    fn test_wire_round_trip() {
        let index = SegmentBloomIndex::build(&sample_values(), 0.01);
        let bytes = index.to_bytes();
        let parsed = SegmentBloomIndex::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, index);
    }

    #[test]
    fn test_header_layout() {
        let index = SegmentBloomIndex::build(&sample_values(), 0.01);
        let bytes = index.to_bytes();
        assert_eq!(&bytes[0..4], b"PQBF");
        let num_row_groups = u16::from_be_bytes([bytes[12], bytes[13]]);
        assert_eq!(num_row_groups, 4);
    }

    #[test]
    fn test_corrupted_header_rejected() {
        let index = SegmentBloomIndex::build(&sample_values(), 0.01);
        let mut bytes = index.to_bytes();

        bytes[0] = b'X';
        assert!(matches!(
            SegmentBloomIndex::from_bytes(&bytes).unwrap_err(),
            ParqueError::Storage {
                kind: StorageErrorKind::Corrupted,
                ..
            }
        ));

        let short = &index.to_bytes()[..10];
        assert!(SegmentBloomIndex::from_bytes(short).is_err());

        let mut wrong_version = index.to_bytes();
        wrong_version[5] = 99;
        assert!(SegmentBloomIndex::from_bytes(&wrong_version).is_err());
    }

    #[test]
    fn test_candidate_row_groups_prunes() {
        // Distinct value domains per row group: most lookups should prune
        // down to the single owning row group.
        let values = sample_values();
        let index = SegmentBloomIndex::build(&values, 0.001);
        let candidates = index.candidate_row_groups("value-2-50".as_bytes());
        assert!(candidates.contains(&2));
        assert!(candidates.len() <= 2);
    }
}
