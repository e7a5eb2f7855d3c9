//! Filter facade over the approximate-membership store
//!
//! The index treats its membership filter as a hash-ordered map from
//! fixed-width keys to small integers. Keys are already in hash space
//! (see [`crate::hasher::hash64`]); the facade guarantees:
//!
//! - stable iteration in ascending key-hash order,
//! - keyed insert and query (value 0 means absent),
//! - automatic growth (a failed growth aborts the process),
//! - serialization to a flat file and read-only mmap open.
//!
//! The construction path appends: the N-way merge emits keys in
//! nondecreasing hash order, so inserts are O(1); an out-of-order insert
//! falls back to a binary-search insertion.

use crate::error::{CdbgError, Result};
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Magic bytes of a serialized filter
const FILTER_MAGIC: &[u8; 8] = b"CDBGAMQ1";
/// Serialized format version
const FILTER_VERSION: u32 = 1;
/// Header: magic(8) + version(4) + seed(4) + key_bits(8) + num_entries(8)
const HEADER_BYTES: usize = 32;
/// Bytes per (key, value) entry
const ENTRY_BYTES: usize = 16;

/// One (key-hash, value) pair stored in the filter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterEntry {
    /// Key in hash space, below `2^key_bits`
    pub key: u64,
    /// Stored small-integer value; never 0 for a present key
    pub value: u64,
}

enum Backing {
    Owned(Vec<FilterEntry>),
    Mapped { map: Mmap, num_entries: usize },
}

/// Hash-ordered key -> small-integer store
pub struct KmerFilter {
    key_bits: u64,
    seed: u32,
    backing: Backing,
}

impl KmerFilter {
    /// Create an empty filter with `2^qbits` slots pre-reserved and keys of
    /// `key_bits` bits (2k for a k-mer index)
    pub fn new(qbits: u64, key_bits: u64, seed: u32) -> Self {
        assert!(key_bits >= 2 && key_bits <= 64, "key_bits must be in [2, 64]");
        let capacity = 1usize.checked_shl(qbits as u32).unwrap_or(0);
        Self {
            key_bits,
            seed,
            backing: Backing::Owned(Vec::with_capacity(capacity)),
        }
    }

    /// Key width in bits
    #[inline]
    pub fn key_bits(&self) -> u64 {
        self.key_bits
    }

    /// Hash seed recorded at construction
    #[inline]
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Mask selecting the low `key_bits` bits
    #[inline]
    pub fn key_mask(&self) -> u64 {
        if self.key_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.key_bits) - 1
        }
    }

    /// Size of the key-hash space, `2^key_bits`
    #[inline]
    pub fn range(&self) -> u128 {
        1u128 << self.key_bits
    }

    /// Number of distinct keys present
    #[inline]
    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Owned(entries) => entries.len(),
            Backing::Mapped { num_entries, .. } => *num_entries,
        }
    }

    /// Whether the filter holds no keys
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry at position `i` in hash order
    #[inline]
    pub fn entry(&self, i: usize) -> FilterEntry {
        match &self.backing {
            Backing::Owned(entries) => entries[i],
            Backing::Mapped { map, num_entries } => {
                assert!(i < *num_entries, "entry index {i} out of bounds");
                let off = HEADER_BYTES + i * ENTRY_BYTES;
                let key = u64::from_le_bytes(map[off..off + 8].try_into().unwrap());
                let value = u64::from_le_bytes(map[off + 8..off + 16].try_into().unwrap());
                FilterEntry { key, value }
            }
        }
    }

    /// Insert a key with a non-zero value. Panics if the key is already
    /// present: a key is inserted at most once over the life of a build.
    pub fn insert(&mut self, key: u64, value: u64) {
        assert!(value > 0, "filter values must be non-zero");
        assert!(key <= self.key_mask(), "key {key:#x} exceeds key width");
        let entries = match &mut self.backing {
            Backing::Owned(entries) => entries,
            Backing::Mapped { .. } => panic!("insert into a sealed (mmapped) filter"),
        };
        let entry = FilterEntry { key, value };
        match entries.last().map(|e| e.key) {
            Some(last) if last < key => entries.push(entry),
            None => entries.push(entry),
            Some(last) if last == key => {
                panic!("key {key:#x} inserted twice");
            }
            _ => {
                let pos = entries.partition_point(|e| e.key < key);
                if entries.get(pos).is_some_and(|e| e.key == key) {
                    panic!("key {key:#x} inserted twice");
                }
                entries.insert(pos, entry);
            }
        }
    }

    /// Look up a key; 0 means absent
    pub fn query(&self, key: u64) -> u64 {
        let idx = self.lower_bound(key);
        if idx < self.len() {
            let e = self.entry(idx);
            if e.key == key {
                return e.value;
            }
        }
        0
    }

    /// Index of the first entry with key >= `key`
    pub fn lower_bound(&self, key: u64) -> usize {
        let mut lo = 0usize;
        let mut hi = self.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entry(mid).key < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Iterate all entries in ascending key-hash order
    pub fn iter(&self) -> FilterIter<'_> {
        FilterIter { filter: self, idx: 0, end: self.len() }
    }

    /// Iterate entries whose key-hash lies in `[start, end)`. `end` is a
    /// `u128` so that the top of the full range (`2^64`) is expressible.
    pub fn iter_hash_range(&self, start: u64, end: u128) -> FilterIter<'_> {
        let begin = self.lower_bound(start);
        let stop = if end >= self.range() {
            self.len()
        } else {
            self.lower_bound(end as u64)
        };
        FilterIter { filter: self, idx: begin, end: stop }
    }

    /// Write the filter to `path`
    pub fn serialize(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| CdbgError::io(path, e))?;
        let mut w = BufWriter::new(file);
        let io = |e| CdbgError::io(path, e);
        w.write_all(FILTER_MAGIC).map_err(io)?;
        w.write_all(&FILTER_VERSION.to_le_bytes()).map_err(io)?;
        w.write_all(&self.seed.to_le_bytes()).map_err(io)?;
        w.write_all(&self.key_bits.to_le_bytes()).map_err(io)?;
        w.write_all(&(self.len() as u64).to_le_bytes()).map_err(io)?;
        for i in 0..self.len() {
            let e = self.entry(i);
            w.write_all(&e.key.to_le_bytes()).map_err(io)?;
            w.write_all(&e.value.to_le_bytes()).map_err(io)?;
        }
        w.flush().map_err(io)?;
        Ok(())
    }

    /// Open a serialized filter read-only through a memory map
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| CdbgError::io(path, e))?;
        // SAFETY: the file is opened read-only and never truncated by us
        let map = unsafe { Mmap::map(&file) }.map_err(|e| CdbgError::io(path, e))?;
        let corrupt = |reason: &str| CdbgError::CorruptFile {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        if map.len() < HEADER_BYTES {
            return Err(corrupt("truncated header"));
        }
        if &map[0..8] != FILTER_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = u32::from_le_bytes(map[8..12].try_into().unwrap());
        if version != FILTER_VERSION {
            return Err(corrupt("unsupported version"));
        }
        let seed = u32::from_le_bytes(map[12..16].try_into().unwrap());
        let key_bits = u64::from_le_bytes(map[16..24].try_into().unwrap());
        let num_entries = u64::from_le_bytes(map[24..32].try_into().unwrap()) as usize;
        if map.len() < HEADER_BYTES + num_entries * ENTRY_BYTES {
            return Err(corrupt("truncated entry table"));
        }
        Ok(Self {
            key_bits,
            seed,
            backing: Backing::Mapped { map, num_entries },
        })
    }

    /// Build a per-sample filter from canonical k-mers (used for tests and
    /// for assembling small inputs); keys are hashed, sorted and deduped.
    pub fn from_kmers(
        kmers: impl IntoIterator<Item = crate::kmer::Kmer>,
        qbits: u64,
        key_bits: u64,
        seed: u32,
    ) -> Self {
        let mut filter = Self::new(qbits, key_bits, seed);
        let mask = filter.key_mask();
        let mut keys: Vec<u64> = kmers
            .into_iter()
            .map(|kmer| crate::hasher::hash64(kmer.canonical().bits(), mask))
            .collect();
        keys.sort_unstable();
        keys.dedup();
        for key in keys {
            filter.insert(key, 1);
        }
        filter
    }
}

/// Ascending-hash-order iterator over filter entries
pub struct FilterIter<'a> {
    filter: &'a KmerFilter,
    idx: usize,
    end: usize,
}

impl Iterator for FilterIter<'_> {
    type Item = FilterEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.end {
            return None;
        }
        let entry = self.filter.entry(self.idx);
        self.idx += 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.idx;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FilterIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmer::Kmer;

    #[test]
    fn test_insert_query() {
        let mut f = KmerFilter::new(4, 10, 1);
        f.insert(5, 2);
        f.insert(9, 7);
        f.insert(7, 1); // out of order takes the slow path
        assert_eq!(f.query(5), 2);
        assert_eq!(f.query(7), 1);
        assert_eq!(f.query(9), 7);
        assert_eq!(f.query(6), 0);
        assert_eq!(f.len(), 3);
    }

    #[test]
    fn test_iteration_is_hash_ordered() {
        let mut f = KmerFilter::new(4, 16, 1);
        for key in [42u64, 7, 1000, 3, 512] {
            f.insert(key, key + 1);
        }
        let keys: Vec<u64> = f.iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![3, 7, 42, 512, 1000]);
    }

    #[test]
    fn test_iter_hash_range() {
        let mut f = KmerFilter::new(4, 16, 1);
        for key in [1u64, 5, 9, 13, 60000] {
            f.insert(key, 1);
        }
        let keys: Vec<u64> = f.iter_hash_range(5, 14).map(|e| e.key).collect();
        assert_eq!(keys, vec![5, 9, 13]);
        // end == range() covers the tail
        let keys: Vec<u64> = f.iter_hash_range(10, f.range()).map(|e| e.key).collect();
        assert_eq!(keys, vec![13, 60000]);
    }

    #[test]
    #[should_panic(expected = "inserted twice")]
    fn test_duplicate_insert_panics() {
        let mut f = KmerFilter::new(4, 10, 1);
        f.insert(5, 1);
        f.insert(5, 2);
    }

    #[test]
    fn test_serialize_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.ser");

        let mut f = KmerFilter::new(4, 42, 7);
        for key in [3u64, 99, 12345] {
            f.insert(key, key % 10 + 1);
        }
        f.serialize(&path).unwrap();

        let g = KmerFilter::open(&path).unwrap();
        assert_eq!(g.key_bits(), 42);
        assert_eq!(g.seed(), 7);
        assert_eq!(g.len(), 3);
        for (a, b) in f.iter().zip(g.iter()) {
            assert_eq!(a, b);
        }
        assert_eq!(g.query(99), 10);
        assert_eq!(g.query(100), 0);
    }

    #[test]
    fn test_from_kmers_dedups_canonical_pairs() {
        let fwd = Kmer::from_str("ACGTG").unwrap();
        let rc = fwd.reverse_complement();
        let f = KmerFilter::from_kmers([fwd, rc], 4, 10, 1);
        assert_eq!(f.len(), 1);
    }
}
