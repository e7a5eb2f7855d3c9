//! Merging two sealed indices' spanning trees
//!
//! The combined color space is given by a pair-index filter whose values
//! are dense new ids over co-occurring (first-index color, second-index
//! color) pairs, plus the `newID2oldIDs` sidecar listing the pair behind
//! each new id. Neither old bitmap table is materialised: edge weights
//! come from decoding both old spanning trees with cached decoders,
//!
//! `w((a1,a2),(b1,b2)) = d(dec1(a1), dec1(b1)) + d(dec2(a2), dec2(b2))`,
//!
//! and the merged delta lists are the first index's delta list followed by
//! the second's shifted by the first index's sample count. A fresh MST is
//! then built over the pair graph and written to the output directory.

use crate::constants::{
    ceil_log2, BV_BUF_LEN, FILTER_FILE, NEW_TO_OLD_IDS_FILE, SAMPLEID_FILE,
};
use crate::decode::{
    hamming_distance_sorted, symmetric_difference, DecodeStats, LruColorCache, MstDecoder,
};
use crate::edges::{build_edge_sets, Edge};
use crate::error::{CdbgError, Result};
use crate::filter::KmerFilter;
use crate::index::read_sample_names;
use crate::mst::{encode_tree, kruskal, MstArtifacts};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Mutex;
use sux::prelude::*;
use tracing::info;

/// LRU capacity per worker, per source tree
const MERGE_LRU_CAPACITY: usize = 1000;
/// Colors pinned per source tree before weighting
const FIXED_CACHE_BUDGET: usize = 10_000;

/// The two source-tree nodes behind one merged color id
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorPair {
    /// 0-based node in the first index's tree
    pub first: u32,
    /// 0-based node in the second index's tree
    pub second: u32,
}

/// Read `newID2oldIDs`: a count followed by (new id, old id 1, old id 2)
/// little-endian u64 triples. Old ids are 1-based with 0 meaning "absent",
/// which maps to that tree's root (the all-zero color).
pub fn read_new_to_old_ids(path: &Path, root1: u32, root2: u32) -> Result<Vec<ColorPair>> {
    let file = File::open(path).map_err(|e| CdbgError::io(path, e))?;
    let mut r = BufReader::new(file);
    let io = |e| CdbgError::io(path, e);
    let mut buf8 = [0u8; 8];
    r.read_exact(&mut buf8).map_err(io)?;
    let cnt = u64::from_le_bytes(buf8) as usize;

    let mut pairs = vec![ColorPair { first: root1, second: root2 }; cnt];
    let mut seen = vec![false; cnt];
    for _ in 0..cnt {
        r.read_exact(&mut buf8).map_err(io)?;
        let new_id = u64::from_le_bytes(buf8) as usize;
        r.read_exact(&mut buf8).map_err(io)?;
        let old1 = u64::from_le_bytes(buf8);
        r.read_exact(&mut buf8).map_err(io)?;
        let old2 = u64::from_le_bytes(buf8);
        if new_id >= cnt {
            return Err(CdbgError::CorruptFile {
                path: path.to_path_buf(),
                reason: format!("new id {new_id} outside [0, {cnt})"),
            });
        }
        pairs[new_id] = ColorPair {
            first: if old1 == 0 { root1 } else { (old1 - 1) as u32 },
            second: if old2 == 0 { root2 } else { (old2 - 1) as u32 },
        };
        seen[new_id] = true;
    }
    if let Some(missing) = seen.iter().position(|s| !s) {
        return Err(CdbgError::CorruptFile {
            path: path.to_path_buf(),
            reason: format!("new id {missing} has no pair entry"),
        });
    }
    Ok(pairs)
}

/// Merge the spanning trees of the indices at `dir1` and `dir2` into a
/// fresh tree for the pair index at `dir`.
///
/// `dir` must already hold the pair filter and `newID2oldIDs` (produced by
/// the external pair-construction step). The merged `sampleid.lst` is
/// written if missing.
pub fn merge_msts(
    dir: &Path,
    dir1: &Path,
    dir2: &Path,
    num_threads: usize,
) -> Result<MstArtifacts> {
    let samples1 = read_sample_names(dir1)?;
    let samples2 = read_sample_names(dir2)?;
    let num_samples1 = samples1.len() as u64;
    let total_samples = num_samples1 + samples2.len() as u64;
    info!(
        first = samples1.len(),
        second = samples2.len(),
        "merging spanning trees"
    );

    let mut dec1 = MstDecoder::open(dir1)?;
    let mut dec2 = MstDecoder::open(dir2)?;
    let pairs = read_new_to_old_ids(
        &dir.join(NEW_TO_OLD_IDS_FILE),
        dec1.root(),
        dec2.root(),
    )?;
    let num_pair_colors = pairs.len() as u64;
    info!(num_pair_colors, "loaded pair-color table");

    let pair_filter = KmerFilter::open(&dir.join(FILTER_FILE))?;
    let classes_per_buffer = (BV_BUF_LEN / total_samples).max(1);
    let mut edge_sets = build_edge_sets(
        &pair_filter,
        num_pair_colors,
        classes_per_buffer,
        num_threads,
        dir,
    )?;
    drop(pair_filter);
    let root = edge_sets.root;
    let num_nodes = edge_sets.num_nodes;

    let (root1, root2) = (dec1.root(), dec2.root());
    let pair_of = |node: u32| -> ColorPair {
        if node == root {
            ColorPair { first: root1, second: root2 }
        } else {
            pairs[node as usize]
        }
    };

    // Pin the most-referenced source colors before any decoding happens.
    {
        let mut refs1 = vec![0u64; dec1.num_nodes() as usize];
        let mut refs2 = vec![0u64; dec2.num_nodes() as usize];
        for cell in &edge_sets.buckets {
            for edge in cell {
                for endpoint in [edge.n1, edge.n2] {
                    let pair = pair_of(endpoint);
                    refs1[pair.first as usize] += 1;
                    refs2[pair.second as usize] += 1;
                }
            }
        }
        dec1.plan_fixed_cache(&refs1, FIXED_CACHE_BUDGET);
        dec2.plan_fixed_cache(&refs2, FIXED_CACHE_BUDGET);
    }

    // Weighting without pair bitmaps: decode through both source trees.
    info!("calculating edge weights from the source spanning trees");
    let buckets_mutex: Mutex<Vec<Vec<Edge>>> =
        Mutex::new(vec![Vec::new(); total_samples as usize]);
    let stats_mutex: Mutex<(DecodeStats, DecodeStats)> = Mutex::new(Default::default());
    for cell_idx in 0..edge_sets.buckets.len() {
        let cell = std::mem::take(&mut edge_sets.buckets[cell_idx]);
        if cell.is_empty() {
            continue;
        }
        let chunk = (cell.len() / num_threads.max(1)).max(100);
        cell.par_chunks(chunk).for_each(|edges| {
            let mut lru1 = LruColorCache::new(MERGE_LRU_CAPACITY);
            let mut lru2 = LruColorCache::new(MERGE_LRU_CAPACITY);
            let mut stats1 = DecodeStats::default();
            let mut stats2 = DecodeStats::default();
            let mut local: Vec<Vec<Edge>> = vec![Vec::new(); total_samples as usize];
            for edge in edges {
                let a = pair_of(edge.n1);
                let b = pair_of(edge.n2);
                let w1 = hamming_distance_sorted(
                    &dec1.decode_cached(a.first, &mut lru1, &mut stats1),
                    &dec1.decode_cached(b.first, &mut lru1, &mut stats1),
                );
                let w2 = hamming_distance_sorted(
                    &dec2.decode_cached(a.second, &mut lru2, &mut stats2),
                    &dec2.decode_cached(b.second, &mut lru2, &mut stats2),
                );
                let w = w1 + w2;
                assert!(
                    w > 0,
                    "hamming distance of 0 between pair colors {} and {}",
                    edge.n1,
                    edge.n2
                );
                local[(w - 1) as usize].push(*edge);
            }
            let mut shared = buckets_mutex.lock().unwrap();
            for (w, edges) in local.into_iter().enumerate() {
                shared[w].extend(edges);
            }
            let mut stats = stats_mutex.lock().unwrap();
            stats.0.cache_hits += stats1.cache_hits;
            stats.0.cache_misses += stats1.cache_misses;
            stats.1.cache_hits += stats2.cache_hits;
            stats.1.cache_misses += stats2.cache_misses;
        });
    }
    let weight_buckets = buckets_mutex.into_inner().unwrap();
    let stats = stats_mutex.into_inner().unwrap();
    info!(
        first_hits = stats.0.cache_hits,
        first_misses = stats.0.cache_misses,
        second_hits = stats.1.cache_hits,
        second_misses = stats.1.cache_misses,
        "decode cache statistics"
    );

    let (adjacency, total_weight) = kruskal(&weight_buckets, num_nodes);
    drop(weight_buckets);

    info!("encoding the merged tree");
    let encoding = encode_tree(&adjacency, num_nodes, root, total_weight);
    drop(adjacency);

    // Delta lists: first-tree deltas as is, second-tree deltas shifted by
    // the first index's sample count; the concatenation stays sorted.
    let delta_width = ceil_log2(total_samples).max(1);
    let deltas_mutex = Mutex::new(BitFieldVec::<usize>::new(
        delta_width,
        total_weight as usize,
    ));
    let nodes: Vec<u32> = (0..num_nodes as u32).filter(|&p| p != root).collect();
    let chunk = (nodes.len() / num_threads.max(1)).max(100);
    nodes.par_chunks(chunk).for_each(|slice| {
        let mut lru1 = LruColorCache::new(MERGE_LRU_CAPACITY);
        let mut lru2 = LruColorCache::new(MERGE_LRU_CAPACITY);
        let mut stats1 = DecodeStats::default();
        let mut stats2 = DecodeStats::default();
        let mut runs: Vec<(u64, Vec<u64>)> = Vec::with_capacity(slice.len());
        for &p in slice {
            let parent = encoding.parents.get(p as usize) as u32;
            let a = pair_of(p);
            let b = pair_of(parent);
            let first = symmetric_difference(
                &dec1.decode_cached(a.first, &mut lru1, &mut stats1),
                &dec1.decode_cached(b.first, &mut lru1, &mut stats1),
            );
            let second = symmetric_difference(
                &dec2.decode_cached(a.second, &mut lru2, &mut stats2),
                &dec2.decode_cached(b.second, &mut lru2, &mut stats2),
            );
            let mut values = first;
            values.extend(second.into_iter().map(|s| s + num_samples1));
            debug_assert_eq!(values.len() as u32, encoding.weights[p as usize]);
            runs.push((encoding.offsets[p as usize], values));
        }
        let mut deltas = deltas_mutex.lock().unwrap();
        for (start, values) in runs {
            for (idx, value) in values.into_iter().enumerate() {
                deltas.set(start as usize + idx, value as usize);
            }
        }
    });

    let artifacts = MstArtifacts {
        parents: encoding.parents,
        boundary_words: encoding.boundary_words,
        boundary_bits: total_weight,
        deltas: deltas_mutex.into_inner().unwrap(),
        total_weight,
        num_nodes,
    };
    artifacts.serialize(dir)?;

    // The merged sample listing is the two source listings concatenated.
    let sample_path = dir.join(SAMPLEID_FILE);
    if !sample_path.is_file() {
        let file = File::create(&sample_path).map_err(|e| CdbgError::io(&sample_path, e))?;
        let mut w = BufWriter::new(file);
        for (id, name) in samples1.iter().chain(samples2.iter()).enumerate() {
            writeln!(w, "{id} {name}").map_err(|e| CdbgError::io(&sample_path, e))?;
        }
        w.flush().map_err(|e| CdbgError::io(&sample_path, e))?;
    }

    Ok(artifacts)
}

/// Write a `newID2oldIDs` sidecar (count + LE u64 triples). The inverse of
/// [`read_new_to_old_ids`], used by the pair-construction tooling.
pub fn write_new_to_old_ids(path: &Path, pairs: &[(u64, u64, u64)]) -> Result<()> {
    let file = File::create(path).map_err(|e| CdbgError::io(path, e))?;
    let mut w = BufWriter::new(file);
    let io = |e| CdbgError::io(path, e);
    w.write_all(&(pairs.len() as u64).to_le_bytes()).map_err(io)?;
    for &(new_id, old1, old2) in pairs {
        w.write_all(&new_id.to_le_bytes()).map_err(io)?;
        w.write_all(&old1.to_le_bytes()).map_err(io)?;
        w.write_all(&old2.to_le_bytes()).map_err(io)?;
    }
    w.flush().map_err(io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_to_old_ids_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(NEW_TO_OLD_IDS_FILE);
        // ids 1-based on disk; 0 means absent
        write_new_to_old_ids(&path, &[(0, 1, 1), (1, 2, 0), (2, 0, 1)]).unwrap();

        let pairs = read_new_to_old_ids(&path, 7, 9).unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], ColorPair { first: 0, second: 0 });
        assert_eq!(pairs[1], ColorPair { first: 1, second: 9 }); // absent -> root2
        assert_eq!(pairs[2], ColorPair { first: 7, second: 0 }); // absent -> root1
    }

    #[test]
    fn test_new_to_old_ids_rejects_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(NEW_TO_OLD_IDS_FILE);
        let file = File::create(&path).unwrap();
        let mut w = BufWriter::new(file);
        w.write_all(&2u64.to_le_bytes()).unwrap();
        // only one triple for a declared count of two
        for v in [0u64, 1, 1] {
            w.write_all(&v.to_le_bytes()).unwrap();
        }
        w.flush().unwrap();
        assert!(read_new_to_old_ids(&path, 1, 1).is_err());
    }
}
