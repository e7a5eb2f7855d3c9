//! Minimum spanning tree over the color graph
//!
//! Three steps, mirroring the construction pipeline:
//!
//! 1. **Weighting**: for every bucket cell load (at most) two bitmap
//!    buffers and compute the Hamming weight of each edge, appending it to
//!    weight bucket `w - 1`. A zero weight between distinct ids means the
//!    dedup store produced duplicate color classes and is fatal.
//! 2. **Kruskal**: ascending weight buckets through a rank-based
//!    union-find with iterative path compression.
//! 3. **Encoding**: BFS from the synthetic root fills the parent array;
//!    delta-list boundaries are the prefix sums of the edge weights, and
//!    the delta array lists the differing sample indices per node.
//!
//! The parent and delta arrays are packed int vectors; the boundary is a
//! plain bit vector with one set bit per node.

use crate::bitmap::{eqclass_files, sidecar_header, BitmapSlab, SampleBitmap};
use crate::constants::{ceil_log2, BOUNDARYBV_FILE, DELTABV_FILE, FILTER_FILE, PARENTBV_FILE};
use crate::edges::{build_edge_sets, Edge, EdgeSets};
use crate::error::{CdbgError, Result};
use crate::filter::KmerFilter;
use crate::serialization::{write_bitvec, write_packed};
use rayon::prelude::*;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sux::prelude::*;
use tracing::info;

/// Union-find over color ids with union by rank and iterative
/// path compression
pub struct DisjointSets {
    parent: Vec<u32>,
    rank: Vec<u8>,
}

impl DisjointSets {
    /// `n` singleton sets
    pub fn new(n: u64) -> Self {
        Self {
            parent: (0..n as u32).collect(),
            rank: vec![0; n as usize],
        }
    }

    /// Representative of `u`'s set. Path compression is a second pass so
    /// the walk depth never recurses.
    pub fn find(&mut self, u: u32) -> u32 {
        let mut root = u;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        let mut cur = u;
        while self.parent[cur as usize] != root {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root;
            cur = next;
        }
        root
    }

    /// Merge the sets of `x` and `y`; returns false if already joined
    pub fn union(&mut self, x: u32, y: u32) -> bool {
        let (mut x, mut y) = (self.find(x), self.find(y));
        if x == y {
            return false;
        }
        if self.rank[x as usize] < self.rank[y as usize] {
            std::mem::swap(&mut x, &mut y);
        }
        self.parent[y as usize] = x;
        if self.rank[x as usize] == self.rank[y as usize] {
            self.rank[x as usize] += 1;
        }
        true
    }
}

/// The encoded spanning tree: parent, boundary and delta arrays
pub struct MstArtifacts {
    /// Parent color id per node; the root is its own parent
    pub parents: BitFieldVec<usize>,
    /// Boundary bits, one 1 at the end of each node's delta run
    pub boundary_words: Vec<u64>,
    /// Length of the boundary in bits (= total weight)
    pub boundary_bits: u64,
    /// Packed sample indices of all delta runs, in node-id order
    pub deltas: BitFieldVec<usize>,
    /// Sum of selected edge weights plus the root sentinel slot
    pub total_weight: u64,
    /// Node count including the root
    pub num_nodes: u64,
}

impl MstArtifacts {
    /// Write `parents.bv`, `boundaries.bv` and `deltas.bv` under `dir`
    pub fn serialize(&self, dir: &Path) -> Result<()> {
        write_packed(&dir.join(PARENTBV_FILE), &self.parents)?;
        write_bitvec(&dir.join(BOUNDARYBV_FILE), &self.boundary_words, self.boundary_bits)?;
        write_packed(&dir.join(DELTABV_FILE), &self.deltas)?;
        info!(
            nodes = self.num_nodes,
            total_weight = self.total_weight,
            "serialized parent, boundary and delta arrays"
        );
        Ok(())
    }
}

/// Hamming-weight every edge, bucketing by weight.
///
/// Cell `(i, j)` only needs buffers i and j in memory; edges touching the
/// root use the implicit all-zero bitmap. Workers process slices of a cell
/// with a one-entry cache keyed by the edge's first endpoint and commit
/// their local buckets under a single mutex.
pub fn calculate_weights(
    edge_sets: &mut EdgeSets,
    files: &[PathBuf],
    num_samples: u64,
    num_threads: usize,
) -> Result<Vec<Vec<Edge>>> {
    let num_buffers = edge_sets.num_buffers as usize;
    if edge_sets.num_nodes > 1 && files.len() != num_buffers {
        return Err(CdbgError::BadInput(format!(
            "expected {num_buffers} bitmap buffers, found {} sidecar files",
            files.len()
        )));
    }
    let root = edge_sets.root;
    let classes_per_buffer = edge_sets.classes_per_buffer;
    let zero_bitmap = SampleBitmap::new(num_samples);

    let buckets_mutex: Mutex<Vec<Vec<Edge>>> =
        Mutex::new(vec![Vec::new(); num_samples as usize]);

    info!("going over all the edges and calculating the weights");
    for i in 0..num_buffers {
        if files.is_empty() {
            break;
        }
        let slab_i = BitmapSlab::load(&files[i])?;
        for j in i..num_buffers {
            let slab_j = if j == i { None } else { Some(BitmapSlab::load(&files[j])?) };
            let cell = std::mem::take(&mut edge_sets.buckets[i * num_buffers + j]);
            if cell.is_empty() {
                continue;
            }

            let bitmap_of = |id: u32| -> SampleBitmap {
                if id == root {
                    return zero_bitmap.clone();
                }
                let buffer = id as u64 / classes_per_buffer;
                let offset = id as u64 % classes_per_buffer;
                if buffer == i as u64 {
                    slab_i.bitmap(offset)
                } else {
                    debug_assert_eq!(buffer, j as u64);
                    slab_j.as_ref().unwrap().bitmap(offset)
                }
            };

            // Lists shorter than the per-thread minimum are not worth
            // splitting.
            let chunk = (cell.len() / num_threads.max(1)).max(100);
            cell.par_chunks(chunk).for_each(|edges| {
                let mut local: Vec<Vec<Edge>> = vec![Vec::new(); num_samples as usize];
                let mut cached: Option<(u32, SampleBitmap)> = None;
                for edge in edges {
                    // Edges are sorted by first endpoint, so a one-entry
                    // cache absorbs the run-length repeats of n1.
                    let src = match cached.take() {
                        Some((id, bitmap)) if id == edge.n1 => bitmap,
                        _ => bitmap_of(edge.n1),
                    };
                    let dst = bitmap_of(edge.n2);
                    let w = src.hamming(&dst);
                    assert!(
                        w > 0,
                        "hamming distance of 0 between color ids {} and {}",
                        edge.n1,
                        edge.n2
                    );
                    debug_assert!(w <= num_samples, "weight {w} exceeds sample count");
                    local[(w - 1) as usize].push(*edge);
                    cached = Some((edge.n1, src));
                }
                let mut shared = buckets_mutex.lock().unwrap();
                for (w, edges) in local.into_iter().enumerate() {
                    shared[w].extend(edges);
                }
            });
        }
    }
    info!("calculated the weight for the edges");
    Ok(buckets_mutex.into_inner().unwrap())
}

/// Kruskal over ascending weight buckets. Returns the adjacency list of
/// the selected tree and the total weight (selected edge weights plus one
/// sentinel slot for the root).
pub fn kruskal(
    weight_buckets: &[Vec<Edge>],
    num_nodes: u64,
) -> (Vec<Vec<(u32, u32)>>, u64) {
    let mut ds = DisjointSets::new(num_nodes);
    let mut adjacency: Vec<Vec<(u32, u32)>> = vec![Vec::new(); num_nodes as usize];
    let mut total_weight = 0u64;
    let mut edge_count = 0u64;
    let mut selected = 0u64;

    for (bucket, edges) in weight_buckets.iter().enumerate() {
        let w = bucket as u32 + 1;
        for edge in edges {
            if ds.union(edge.n1, edge.n2) {
                adjacency[edge.n1 as usize].push((edge.n2, w));
                adjacency[edge.n2 as usize].push((edge.n1, w));
                total_weight += w as u64;
                selected += 1;
            }
            edge_count += 1;
        }
    }
    assert!(
        selected == num_nodes - 1,
        "spanning tree selected {selected} of {} edges; color graph is disconnected",
        num_nodes - 1
    );
    total_weight += 1; // one empty slot for the root
    info!(
        graph_edges = edge_count,
        mst_edges = selected,
        total_weight,
        "spanning tree construction finished"
    );
    (adjacency, total_weight)
}

/// BFS encoding of a spanning tree rooted at `root`
pub(crate) struct TreeEncoding {
    /// Parent id per node
    pub parents: BitFieldVec<usize>,
    /// Edge weight to the parent per node; the root holds the sentinel 1
    pub weights: Vec<u32>,
    /// Starting bit offset of each node's delta run
    pub offsets: Vec<u64>,
    /// Boundary bit vector words
    pub boundary_words: Vec<u64>,
}

pub(crate) fn encode_tree(
    adjacency: &[Vec<(u32, u32)>],
    num_nodes: u64,
    root: u32,
    total_weight: u64,
) -> TreeEncoding {
    let width = ceil_log2(num_nodes).max(1);
    let mut parents = BitFieldVec::<usize>::new(width, num_nodes as usize);
    let mut weights = vec![0u32; num_nodes as usize];
    let mut visited = vec![false; num_nodes as usize];

    let mut queue = VecDeque::new();
    queue.push_back(root);
    visited[root as usize] = true;
    parents.set(root as usize, root as usize);
    weights[root as usize] = 1; // dummy weight reserves the sentinel slot

    while let Some(node) = queue.pop_front() {
        for &(neighbor, w) in &adjacency[node as usize] {
            if !visited[neighbor as usize] {
                visited[neighbor as usize] = true;
                parents.set(neighbor as usize, node as usize);
                weights[neighbor as usize] = w;
                queue.push_back(neighbor);
            }
        }
    }

    let mut boundary_words = vec![0u64; crate::constants::words_for(total_weight)];
    let mut offsets = vec![0u64; num_nodes as usize];
    let mut offset = 0u64;
    for node in 0..num_nodes as usize {
        offsets[node] = offset;
        offset += weights[node] as u64;
        boundary_words[(offset - 1) as usize / 64] |= 1u64 << ((offset - 1) % 64);
    }
    debug_assert_eq!(offset, total_weight);

    TreeEncoding { parents, weights, offsets, boundary_words }
}

/// Build and persist the MST encoding of an index's color classes.
///
/// `edge_sets` is consumed cell by cell; `files` are the numbered bitmap
/// sidecars of the index.
pub fn build_mst(
    mut edge_sets: EdgeSets,
    files: &[PathBuf],
    num_samples: u64,
    num_threads: usize,
    out_dir: &Path,
) -> Result<MstArtifacts> {
    let num_nodes = edge_sets.num_nodes;
    let root = edge_sets.root;
    let num_buffers = edge_sets.num_buffers as usize;
    let classes_per_buffer = edge_sets.classes_per_buffer;

    // Weighting consumes the edge cells; the bucket geometry survives for
    // the delta pass, which walks (node, parent) pairs with the same cell
    // logic.
    let weight_buckets =
        calculate_weights(&mut edge_sets, files, num_samples, num_threads)?;
    let (adjacency, total_weight) = kruskal(&weight_buckets, num_nodes);
    drop(weight_buckets);

    info!("filling parent and boundary arrays");
    let encoding = encode_tree(&adjacency, num_nodes, root, total_weight);
    drop(adjacency);

    info!("filling delta array");
    let delta_width = ceil_log2(num_samples).max(1);
    let deltas_mutex = Mutex::new(BitFieldVec::<usize>::new(
        delta_width,
        total_weight as usize,
    ));
    let zero_bitmap = SampleBitmap::new(num_samples);

    for i in 0..num_buffers {
        if files.is_empty() {
            break;
        }
        let slab_i = BitmapSlab::load(&files[i])?;
        for j in i..num_buffers {
            let slab_j = if j == i { None } else { Some(BitmapSlab::load(&files[j])?) };

            let bitmap_of = |id: u32| -> SampleBitmap {
                if id == root {
                    return zero_bitmap.clone();
                }
                let buffer = id as u64 / classes_per_buffer;
                let offset = id as u64 % classes_per_buffer;
                if buffer == i as u64 {
                    slab_i.bitmap(offset)
                } else {
                    slab_j.as_ref().unwrap().bitmap(offset)
                }
            };

            let nodes: Vec<u32> = (0..num_nodes as u32)
                .filter(|&p| {
                    p != root
                        && edge_sets.bucket_id(p, encoding.parents.get(p as usize) as u32)
                            == i * num_buffers + j
                })
                .collect();

            let chunk = (nodes.len() / num_threads.max(1)).max(100);
            nodes.par_chunks(chunk).for_each(|slice| {
                let mut runs: Vec<(u64, Vec<u64>)> = Vec::with_capacity(slice.len());
                for &p in slice {
                    let parent = encoding.parents.get(p as usize) as u32;
                    let child_bitmap = bitmap_of(p);
                    let parent_bitmap = bitmap_of(parent);
                    let mut diff = Vec::new();
                    for (wi, (a, b)) in child_bitmap
                        .words()
                        .iter()
                        .zip(parent_bitmap.words())
                        .enumerate()
                    {
                        let mut x = a ^ b;
                        while x != 0 {
                            diff.push(wi as u64 * 64 + x.trailing_zeros() as u64);
                            x &= x - 1;
                        }
                    }
                    debug_assert_eq!(diff.len() as u32, encoding.weights[p as usize]);
                    runs.push((encoding.offsets[p as usize], diff));
                }
                let mut deltas = deltas_mutex.lock().unwrap();
                for (start, values) in runs {
                    for (idx, value) in values.into_iter().enumerate() {
                        deltas.set(start as usize + idx, value as usize);
                    }
                }
            });
        }
    }

    let artifacts = MstArtifacts {
        parents: encoding.parents,
        boundary_words: encoding.boundary_words,
        boundary_bits: total_weight,
        deltas: deltas_mutex.into_inner().unwrap(),
        total_weight,
        num_nodes,
    };
    artifacts.serialize(out_dir)?;
    Ok(artifacts)
}

/// Build and persist the MST encoding for a sealed index directory:
/// enumerate the color graph from the main filter, weight, span, encode.
pub fn build_mst_for_index(dir: &Path, num_threads: usize) -> Result<MstArtifacts> {
    let filter = KmerFilter::open(&dir.join(FILTER_FILE))?;
    let sample_names = crate::index::read_sample_names(dir)?;
    let files = eqclass_files(dir)?;

    let mut num_color_classes = 0u64;
    let mut classes_per_buffer = 1u64;
    for (serial, path) in files.iter().enumerate() {
        let (num_bitmaps, _) = sidecar_header(path)?;
        if serial == 0 {
            classes_per_buffer = num_bitmaps;
        }
        num_color_classes += num_bitmaps;
    }
    info!(
        samples = sample_names.len(),
        num_color_classes,
        buffers = files.len(),
        "building spanning tree for index"
    );

    let edge_sets = build_edge_sets(
        &filter,
        num_color_classes,
        classes_per_buffer,
        num_threads,
        dir,
    )?;
    drop(filter);
    build_mst(edge_sets, &files, sample_names.len() as u64, num_threads, dir)
}

/// Delete the raw bitmap sidecars once the spanning-tree encoding covers
/// them
pub fn remove_color_class_files(dir: &Path) -> Result<()> {
    for path in eqclass_files(dir)? {
        std::fs::remove_file(&path).map_err(|e| CdbgError::io(&path, e))?;
        info!(file = %path.display(), "removed bitmap sidecar");
    }
    Ok(())
}
