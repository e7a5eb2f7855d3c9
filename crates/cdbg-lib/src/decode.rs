//! Color-class reconstruction from MST artifacts
//!
//! A color class is decoded by walking the spanning tree from its node to
//! the root and XOR-folding the delta lists along the path. Colors are
//! represented as sorted sample-index lists, so the fold is a linear
//! symmetric-difference merge and the walk stops early at any ancestor
//! already present in a cache.
//!
//! Two caches keep the merger's decode traffic affordable: a per-thread
//! LRU keyed by color id, and a fixed cache of the most-referenced ids
//! planned once before weighting and read-only afterwards. Every 20th
//! uncached decode additionally decodes the midpoint of the walked path
//! into the LRU, which amortises long path costs.

use crate::constants::{BOUNDARYBV_FILE, DELTABV_FILE, PARENTBV_FILE};
use crate::error::Result;
use crate::serialization::{read_bitvec, read_packed};
use ahash::RandomState;
use std::collections::HashMap;
use std::path::Path;
use sux::prelude::*;
use tracing::info;

/// One select sample per this many ones
const SELECT_SAMPLE_RATE: u64 = 64;
/// Decodes between sampling hints
const SAMPLE_EVERY: u64 = 20;

/// Bit vector with a sampled select1 structure
pub struct BoundarySelect {
    words: Vec<u64>,
    num_ones: u64,
    /// Bit position of the (k * SELECT_SAMPLE_RATE + 1)-th one
    samples: Vec<u64>,
}

impl BoundarySelect {
    /// Build the select structure by a single scan
    pub fn new(words: Vec<u64>, num_bits: u64) -> Self {
        let mut samples = Vec::new();
        let mut num_ones = 0u64;
        for (wi, &word) in words.iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let bit = wi as u64 * 64 + w.trailing_zeros() as u64;
                if bit >= num_bits {
                    break;
                }
                if num_ones % SELECT_SAMPLE_RATE == 0 {
                    samples.push(bit);
                }
                num_ones += 1;
                w &= w - 1;
            }
        }
        Self { words, num_ones, samples }
    }

    /// Number of set bits
    #[inline]
    pub fn num_ones(&self) -> u64 {
        self.num_ones
    }

    /// Position of the `rank`-th set bit (1-based rank)
    pub fn select1(&self, rank: u64) -> u64 {
        assert!(rank >= 1 && rank <= self.num_ones, "select1 rank {rank} out of range");
        let sample = (rank - 1) / SELECT_SAMPLE_RATE;
        let start = self.samples[sample as usize];
        let mut remaining = rank - sample * SELECT_SAMPLE_RATE;
        let mut word_idx = (start / 64) as usize;
        let mut w = self.words[word_idx] & (u64::MAX << (start % 64));
        loop {
            let ones = w.count_ones() as u64;
            if remaining <= ones {
                let mut w = w;
                for _ in 1..remaining {
                    w &= w - 1;
                }
                return word_idx as u64 * 64 + w.trailing_zeros() as u64;
            }
            remaining -= ones;
            word_idx += 1;
            w = self.words[word_idx];
        }
    }
}

/// Sorted symmetric difference of two sorted index lists
pub(crate) fn symmetric_difference(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Hamming distance between two sorted index lists, without materializing
/// the difference
pub(crate) fn hamming_distance_sorted(a: &[u64], b: &[u64]) -> u64 {
    let mut dist = 0u64;
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                i += 1;
                dist += 1;
            }
            std::cmp::Ordering::Greater => {
                j += 1;
                dist += 1;
            }
        }
    }
    dist + (a.len() - i) as u64 + (b.len() - j) as u64
}

/// Per-thread LRU over decoded colors. Eviction scans for the stalest
/// entry, which is cheap at the cache sizes used here.
pub struct LruColorCache {
    map: HashMap<u32, (Vec<u64>, u64), RandomState>,
    capacity: usize,
    clock: u64,
}

impl LruColorCache {
    /// Cache holding at most `capacity` colors
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            map: HashMap::with_capacity_and_hasher(capacity, RandomState::with_seeds(3, 5, 7, 9)),
            capacity,
            clock: 0,
        }
    }

    /// Fetch a color, refreshing its age
    pub fn get(&mut self, id: u32) -> Option<&Vec<u64>> {
        self.clock += 1;
        let clock = self.clock;
        match self.map.get_mut(&id) {
            Some((value, stamp)) => {
                *stamp = clock;
                Some(&*value)
            }
            None => None,
        }
    }

    /// Whether a color is cached (does not refresh its age)
    pub fn contains(&self, id: u32) -> bool {
        self.map.contains_key(&id)
    }

    /// Insert a color, evicting the stalest entry when full
    pub fn insert(&mut self, id: u32, value: Vec<u64>) {
        self.clock += 1;
        if self.map.len() >= self.capacity && !self.map.contains_key(&id) {
            if let Some(&stalest) = self
                .map
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(k, _)| k)
            {
                self.map.remove(&stalest);
            }
        }
        self.map.insert(id, (value, self.clock));
    }

    /// Number of cached colors
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Decode counters, reported after merging
#[derive(Debug, Default, Clone, Copy)]
pub struct DecodeStats {
    /// Walks answered from a cache
    pub cache_hits: u64,
    /// Walks that had to fold deltas
    pub cache_misses: u64,
}

/// A loaded spanning-tree encoding with its caches
pub struct MstDecoder {
    parents: BitFieldVec<usize>,
    boundary: BoundarySelect,
    deltas: BitFieldVec<usize>,
    num_nodes: u64,
    root: u32,
    fixed_cache: HashMap<u32, Vec<u64>, RandomState>,
}

impl MstDecoder {
    /// Load the parent, boundary and delta arrays from an index directory
    pub fn open(dir: &Path) -> Result<Self> {
        let parents = read_packed(&dir.join(PARENTBV_FILE))?;
        let (boundary_words, boundary_bits) = read_bitvec(&dir.join(BOUNDARYBV_FILE))?;
        let deltas = read_packed(&dir.join(DELTABV_FILE))?;
        let num_nodes = parents.len() as u64;
        let boundary = BoundarySelect::new(boundary_words, boundary_bits);
        assert_eq!(
            boundary.num_ones(),
            num_nodes,
            "boundary must mark one delta run per node"
        );
        info!(nodes = num_nodes, dir = %dir.display(), "loaded spanning-tree encoding");
        Ok(Self {
            parents,
            boundary,
            deltas,
            num_nodes,
            root: (num_nodes - 1) as u32,
            fixed_cache: HashMap::with_hasher(RandomState::with_seeds(3, 5, 7, 9)),
        })
    }

    /// Node count including the root
    #[inline]
    pub fn num_nodes(&self) -> u64 {
        self.num_nodes
    }

    /// 0-based id of the synthetic root
    #[inline]
    pub fn root(&self) -> u32 {
        self.root
    }

    /// Parent id of a node
    #[inline]
    pub fn parent(&self, node: u32) -> u32 {
        self.parents.get(node as usize) as u32
    }

    /// The delta run of a node: sorted sample indices differing from its
    /// parent
    pub fn delta_slice(&self, node: u32) -> Vec<u64> {
        let start = if node > 0 {
            self.boundary.select1(node as u64) + 1
        } else {
            0
        };
        let end = self.boundary.select1(node as u64 + 1);
        (start..=end)
            .map(|i| self.deltas.get(i as usize) as u64)
            .collect()
    }

    /// Decode a color without caches: fold every delta run on the path to
    /// the root. Iterative; the walk depth is bounded by the tree height.
    pub fn decode(&self, id: u32) -> Vec<u64> {
        let mut acc = Vec::new();
        let mut cur = id;
        while cur != self.root {
            acc = symmetric_difference(&acc, &self.delta_slice(cur));
            cur = self.parent(cur);
        }
        acc
    }

    /// Decode a color through the fixed cache and an LRU. The walk stops
    /// at the first cached ancestor; every 20th miss also decodes the
    /// midpoint of the walked path into the LRU.
    pub fn decode_cached(
        &self,
        id: u32,
        lru: &mut LruColorCache,
        stats: &mut DecodeStats,
    ) -> Vec<u64> {
        if id == self.root {
            return Vec::new();
        }
        if let Some(cached) = self.fixed_cache.get(&id) {
            stats.cache_hits += 1;
            return cached.clone();
        }
        if let Some(cached) = lru.get(id) {
            stats.cache_hits += 1;
            return cached.clone();
        }
        stats.cache_misses += 1;
        let try_sample = stats.cache_misses % SAMPLE_EVERY == 0;

        let mut path = Vec::new();
        let mut acc = Vec::new();
        let mut cur = id;
        let mut base: Option<Vec<u64>> = None;
        while cur != self.root {
            if let Some(cached) = self.fixed_cache.get(&cur) {
                base = Some(cached.clone());
                break;
            }
            if cur != id {
                if let Some(cached) = lru.get(cur) {
                    base = Some(cached.clone());
                    break;
                }
            }
            acc = symmetric_difference(&acc, &self.delta_slice(cur));
            path.push(cur);
            cur = self.parent(cur);
        }
        if let Some(base) = base {
            acc = symmetric_difference(&acc, &base);
        }
        lru.insert(id, acc.clone());

        // The midpoint hint halves future walks through this region.
        if try_sample && path.len() >= 2 {
            let hint = path[path.len() / 2];
            if !lru.contains(hint) && !self.fixed_cache.contains_key(&hint) {
                let decoded = self.decode(hint);
                lru.insert(hint, decoded);
            }
        }
        acc
    }

    /// Pin the most-demanded colors before weighting. `refs[node]` counts
    /// how many edge endpoints reference the node; demand is aggregated
    /// over subtrees and the cache is filled by a greatest-demand-first
    /// descent from the root, so a pinned node's parent is always pinned
    /// (or the root) and pinning itself is a single delta fold.
    pub fn plan_fixed_cache(&mut self, refs: &[u64], budget: usize) {
        assert_eq!(refs.len() as u64, self.num_nodes);
        if budget == 0 || self.num_nodes <= 1 {
            return;
        }

        let mut children: Vec<Vec<u32>> = vec![Vec::new(); self.num_nodes as usize];
        for node in 0..self.num_nodes as u32 {
            if node != self.root {
                children[self.parent(node) as usize].push(node);
            }
        }

        // Subtree demand, children before parents via a reverse BFS order.
        let mut order = Vec::with_capacity(self.num_nodes as usize);
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(self.root);
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &child in &children[node as usize] {
                queue.push_back(child);
            }
        }
        let mut demand = refs.to_vec();
        for &node in order.iter().rev() {
            for &child in &children[node as usize] {
                demand[node as usize] += demand[child as usize];
            }
        }

        // Greatest demand first; push children as their parent is pinned.
        let mut heap = std::collections::BinaryHeap::new();
        for &child in &children[self.root as usize] {
            heap.push((demand[child as usize], std::cmp::Reverse(child)));
        }
        self.fixed_cache.clear();
        while let Some((_, std::cmp::Reverse(node))) = heap.pop() {
            if self.fixed_cache.len() >= budget {
                break;
            }
            let parent = self.parent(node);
            let parent_set: &[u64] = if parent == self.root {
                &[]
            } else {
                &self.fixed_cache[&parent]
            };
            let decoded = symmetric_difference(parent_set, &self.delta_slice(node));
            self.fixed_cache.insert(node, decoded);
            for &child in &children[node as usize] {
                heap.push((demand[child as usize], std::cmp::Reverse(child)));
            }
        }
        info!(pinned = self.fixed_cache.len(), "planned fixed decode cache");
    }

    /// Number of pinned colors
    pub fn fixed_cache_len(&self) -> usize {
        self.fixed_cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ceil_log2;
    use crate::mst::MstArtifacts;

    #[test]
    fn test_symmetric_difference() {
        assert_eq!(symmetric_difference(&[], &[1, 3]), vec![1, 3]);
        assert_eq!(symmetric_difference(&[1, 3], &[3, 5]), vec![1, 5]);
        assert_eq!(symmetric_difference(&[1, 2, 3], &[1, 2, 3]), Vec::<u64>::new());
        assert_eq!(symmetric_difference(&[0, 7], &[1]), vec![0, 1, 7]);
    }

    #[test]
    fn test_hamming_distance_sorted() {
        assert_eq!(hamming_distance_sorted(&[1, 3], &[3, 5]), 2);
        assert_eq!(hamming_distance_sorted(&[], &[0, 1, 2]), 3);
        assert_eq!(hamming_distance_sorted(&[4], &[4]), 0);
    }

    #[test]
    fn test_boundary_select() {
        // bits 1, 2, 3 set (as in a 3-node tree with weights 2, 1, 1)
        let select = BoundarySelect::new(vec![0b1110], 4);
        assert_eq!(select.num_ones(), 3);
        assert_eq!(select.select1(1), 1);
        assert_eq!(select.select1(2), 2);
        assert_eq!(select.select1(3), 3);
    }

    #[test]
    fn test_boundary_select_across_words_and_samples() {
        // every third bit set over three words
        let num_bits = 180u64;
        let mut words = vec![0u64; 3];
        let mut expected = Vec::new();
        for bit in (0..num_bits).step_by(3) {
            words[(bit / 64) as usize] |= 1 << (bit % 64);
            expected.push(bit);
        }
        let select = BoundarySelect::new(words, num_bits);
        assert_eq!(select.num_ones(), expected.len() as u64);
        for (rank0, &bit) in expected.iter().enumerate() {
            assert_eq!(select.select1(rank0 as u64 + 1), bit, "rank {}", rank0 + 1);
        }
    }

    #[test]
    fn test_lru_evicts_stalest() {
        let mut lru = LruColorCache::new(2);
        lru.insert(1, vec![1]);
        lru.insert(2, vec![2]);
        lru.get(1); // refresh 1
        lru.insert(3, vec![3]); // evicts 2
        assert!(lru.contains(1));
        assert!(!lru.contains(2));
        assert!(lru.contains(3));
        assert_eq!(lru.len(), 2);
    }

    /// Tree: root 2, node 0 under root with bitmap {0,1}, node 1 under 0
    /// with bitmap {0}.
    fn tiny_decoder(dir: &Path) -> MstDecoder {
        let num_nodes = 3u64;
        let total_weight = 2 + 1 + 1u64;
        let mut parents = BitFieldVec::<usize>::new(ceil_log2(num_nodes).max(1), 3);
        parents.set(0, 2);
        parents.set(1, 0);
        parents.set(2, 2);
        // weights 2, 1, 1 -> boundary ones at bits 1, 2, 3
        let boundary_words = vec![0b1110u64];
        let mut deltas = BitFieldVec::<usize>::new(1, total_weight as usize);
        deltas.set(0, 0); // node 0: {0, 1}
        deltas.set(1, 1);
        deltas.set(2, 1); // node 1 differs from node 0 at sample 1
        deltas.set(3, 0); // root sentinel
        let artifacts = MstArtifacts {
            parents,
            boundary_words,
            boundary_bits: total_weight,
            deltas,
            total_weight,
            num_nodes,
        };
        artifacts.serialize(dir).unwrap();
        MstDecoder::open(dir).unwrap()
    }

    #[test]
    fn test_decode_folds_path() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = tiny_decoder(dir.path());
        assert_eq!(decoder.decode(0), vec![0, 1]);
        assert_eq!(decoder.decode(1), vec![0]);
        assert_eq!(decoder.decode(2), Vec::<u64>::new());
    }

    #[test]
    fn test_decode_cached_matches_plain() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = tiny_decoder(dir.path());
        let mut lru = LruColorCache::new(8);
        let mut stats = DecodeStats::default();
        for _ in 0..3 {
            assert_eq!(decoder.decode_cached(1, &mut lru, &mut stats), vec![0]);
            assert_eq!(decoder.decode_cached(0, &mut lru, &mut stats), vec![0, 1]);
        }
        assert!(stats.cache_hits >= 4);
        assert_eq!(stats.cache_misses, 2);
    }

    #[test]
    fn test_fixed_cache_plan_pins_demanded_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = tiny_decoder(dir.path());
        // node 0 referenced three times, node 1 once
        decoder.plan_fixed_cache(&[3, 1, 0], 1);
        assert_eq!(decoder.fixed_cache_len(), 1);
        let mut lru = LruColorCache::new(4);
        let mut stats = DecodeStats::default();
        assert_eq!(decoder.decode_cached(0, &mut lru, &mut stats), vec![0, 1]);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 0);
    }
}
