//! Content-addressed color-class store
//!
//! Deduplicates sample-set bitmaps behind a 128-bit fingerprint. Each
//! distinct bitmap receives a 1-based color-class id in first-seen order
//! and is placed into the bitmap buffer slot `id - 1`; repeats only bump
//! the abundance counter.

use crate::bitmap::{BitmapBuffer, SampleBitmap};
use crate::hasher::Fingerprint128;
use ahash::RandomState;
use std::collections::HashMap;

/// Value of the dedup map: assigned id and how many k-mers carry it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorEntry {
    /// 1-based color-class id
    pub id: u64,
    /// Number of k-mers seen with this sample set
    pub abundance: u64,
}

/// Fingerprint-keyed dedup map over color-class bitmaps
pub struct ColorClassStore {
    map: HashMap<u128, ColorEntry, RandomState>,
    fingerprinter: Fingerprint128,
}

impl ColorClassStore {
    /// Empty store
    pub fn new() -> Self {
        Self {
            map: HashMap::with_hasher(RandomState::with_seeds(11, 13, 17, 19)),
            fingerprinter: Fingerprint128::new(),
        }
    }

    /// Number of distinct color classes
    #[inline]
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    /// Whether no color class has been added yet
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Fingerprint a bitmap with the store's seeds
    #[inline]
    pub fn fingerprint(&self, bitmap: &SampleBitmap) -> u128 {
        self.fingerprinter.fingerprint(bitmap.words())
    }

    /// Deduplicate a bitmap: returns its color-class id and whether the
    /// class is new. New classes are placed into the buffer at `id - 1`.
    pub fn try_add(&mut self, bitmap: &SampleBitmap, buffer: &mut BitmapBuffer) -> (u64, bool) {
        let fp = self.fingerprint(bitmap);
        let next_id = self.map.len() as u64 + 1;
        match self.map.entry(fp) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.get_mut().abundance += 1;
                (e.get().id, false)
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(ColorEntry { id: next_id, abundance: 1 });
                buffer.place(next_id - 1, bitmap);
                (next_id, true)
            }
        }
    }

    /// Look up an entry by fingerprint
    pub fn get(&self, fingerprint: u128) -> Option<&ColorEntry> {
        self.map.get(&fingerprint)
    }

    /// Iterate (fingerprint, entry) pairs in arbitrary order
    pub fn iter(&self) -> impl Iterator<Item = (&u128, &ColorEntry)> {
        self.map.iter()
    }

    /// Reissue ids 1..n in decreasing-abundance order (ties broken by the
    /// old id, so the permutation is deterministic). This is the
    /// caller-side reorder between the sampling and full phases.
    pub fn reorder_by_abundance(&self) -> HashMap<u128, ColorEntry, RandomState> {
        let mut pairs: Vec<(u128, ColorEntry)> =
            self.map.iter().map(|(fp, e)| (*fp, *e)).collect();
        pairs.sort_by(|a, b| {
            b.1.abundance
                .cmp(&a.1.abundance)
                .then(a.1.id.cmp(&b.1.id))
        });
        let mut out = HashMap::with_capacity_and_hasher(
            pairs.len(),
            RandomState::with_seeds(11, 13, 17, 19),
        );
        for (rank, (fp, entry)) in pairs.into_iter().enumerate() {
            out.insert(fp, ColorEntry { id: rank as u64 + 1, abundance: entry.abundance });
        }
        out
    }

    /// Replace the map wholesale (used by the builder's reinit)
    pub fn replace(&mut self, map: HashMap<u128, ColorEntry, RandomState>) {
        self.map = map;
    }
}

impl Default for ColorClassStore {
    fn default() -> Self {
        Self::new()
    }
}
