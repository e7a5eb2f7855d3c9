//! Color-graph edge enumeration
//!
//! Walks every k-mer of the sealed main filter and emits an undirected
//! edge between the color classes of de-Bruijn-adjacent k-mers. The hash
//! range is split into one contiguous sub-range per worker; each worker
//! spills its edge buffer to a private scratch file (u64 count header +
//! raw pairs) whenever it reaches its share of the scratch budget.
//! Reduction sorts and dedups each scratch file and distributes the edges
//! into (buffer x buffer) bucket cells so the weighting stage touches at
//! most two bitmap buffers per cell. Finally the synthetic all-zero root
//! is appended with an edge to every real color class.

use crate::constants::MAX_TMP_EDGES;
use crate::error::{CdbgError, Result};
use crate::filter::KmerFilter;
use crate::hasher::{hash64, hash64_inv};
use crate::kmer::Kmer;
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// An undirected color-graph edge, stored with `n1 < n2`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Edge {
    /// Smaller endpoint (0-based color id)
    pub n1: u32,
    /// Larger endpoint
    pub n2: u32,
}

impl Edge {
    /// Create an edge, normalizing endpoint order
    #[inline]
    pub fn new(a: u32, b: u32) -> Self {
        debug_assert_ne!(a, b, "self edges are not part of the color graph");
        if a < b {
            Self { n1: a, n2: b }
        } else {
            Self { n1: b, n2: a }
        }
    }
}

/// Deduplicated color-graph edges, bucketed by buffer pair
pub struct EdgeSets {
    /// `num_buffers^2` cells; cell `(i, j)` holds edges whose endpoints'
    /// bitmaps live in buffers i and j (i <= j)
    pub buckets: Vec<Vec<Edge>>,
    /// Total nodes including the synthetic root
    pub num_nodes: u64,
    /// 0-based id of the synthetic all-zero root
    pub root: u32,
    /// Number of bitmap buffers spanned by the real color classes
    pub num_buffers: u64,
    /// Color classes per buffer (`B`)
    pub classes_per_buffer: u64,
}

impl EdgeSets {
    /// Cell index for an edge between color ids `c1` and `c2`. Edges that
    /// touch the root land on the diagonal cell of the other endpoint's
    /// buffer, since the root has no stored bitmap.
    pub fn bucket_id(&self, c1: u32, c2: u32) -> usize {
        bucket_id(c1, c2, self.root, self.classes_per_buffer, self.num_buffers)
    }

    /// Total edge count over all cells
    pub fn num_edges(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

fn bucket_id(c1: u32, c2: u32, root: u32, classes_per_buffer: u64, num_buffers: u64) -> usize {
    let (mut c1, mut c2) = (c1, c2);
    if c1 == root || c1 > c2 {
        std::mem::swap(&mut c1, &mut c2);
    }
    let cb1 = c1 as u64 / classes_per_buffer;
    let cb2 = c2 as u64 / classes_per_buffer;
    if c2 == root {
        (cb1 * num_buffers + cb1) as usize
    } else {
        (cb1 * num_buffers + cb2) as usize
    }
}

struct WorkerOutput {
    scratch: PathBuf,
    num_edges: u64,
    num_kmers: u64,
    max_color: u32,
}

/// Enumerate the color graph of a sealed filter.
///
/// `num_color_classes` counts the real color classes (the filter's values
/// are 1-based ids up to this count); the returned edge sets include the
/// synthetic root as an extra node.
pub fn build_edge_sets(
    filter: &KmerFilter,
    num_color_classes: u64,
    classes_per_buffer: u64,
    num_threads: usize,
    scratch_dir: &Path,
) -> Result<EdgeSets> {
    let num_threads = num_threads.max(1);
    let k = filter.key_bits() / 2;
    info!(k, num_color_classes, num_threads, "building color-graph edge sets");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .map_err(|e| CdbgError::BadInput(format!("failed to create thread pool: {e}")))?;

    let outputs: Vec<WorkerOutput> = pool.install(|| {
        (0..num_threads)
            .into_par_iter()
            .map(|worker| scan_hash_range(filter, k, worker, num_threads, scratch_dir))
            .collect::<Result<Vec<_>>>()
    })?;

    let total_kmers: u64 = outputs.iter().map(|o| o.num_kmers).sum();
    let total_edges: u64 = outputs.iter().map(|o| o.num_edges).sum();
    let max_color = outputs.iter().map(|o| o.max_color).max().unwrap_or(0);
    info!(total_kmers, total_edges, "edge scan complete");
    debug_assert!(
        filter.is_empty() || (max_color as u64) < num_color_classes,
        "observed color id {max_color} outside [0, {num_color_classes})"
    );

    let root = num_color_classes as u32;
    let num_buffers = num_color_classes.div_ceil(classes_per_buffer).max(1);
    let mut buckets = vec![Vec::new(); (num_buffers * num_buffers) as usize];

    // Absorb each scratch file: sort, dedup, bucket, delete.
    for output in outputs {
        let edges = read_scratch(&output.scratch)?;
        std::fs::remove_file(&output.scratch)
            .map_err(|e| CdbgError::io(&output.scratch, e))?;
        let mut edges = edges;
        edges.sort_unstable();
        edges.dedup();
        debug!(
            file = %output.scratch.display(),
            edges = edges.len(),
            "absorbed scratch edges"
        );
        for edge in edges {
            buckets[bucket_id(edge.n1, edge.n2, root, classes_per_buffer, num_buffers)]
                .push(edge);
        }
    }
    // The same color pair can be emitted by k-mers scanned in different
    // hash ranges; dedup each cell across scratch files.
    for bucket in &mut buckets {
        bucket.sort_unstable();
        bucket.dedup();
    }

    info!(
        num_color_classes,
        "adding edges from the dummy root to each color class"
    );
    for c in 0..num_color_classes as u32 {
        let cell = bucket_id(c, root, root, classes_per_buffer, num_buffers);
        buckets[cell].push(Edge { n1: c, n2: root });
    }

    Ok(EdgeSets {
        buckets,
        num_nodes: num_color_classes + 1,
        root,
        num_buffers,
        classes_per_buffer,
    })
}

fn scan_hash_range(
    filter: &KmerFilter,
    k: u64,
    worker: usize,
    num_threads: usize,
    scratch_dir: &Path,
) -> Result<WorkerOutput> {
    let range = filter.range();
    let start = (worker as u128 * (range / num_threads as u128)) as u64;
    let end = if worker + 1 == num_threads {
        range
    } else {
        (worker as u128 + 1) * (range / num_threads as u128)
    };
    let mask = filter.key_mask();
    let spill_at = (MAX_TMP_EDGES / num_threads as u64).max(1) as usize;

    let scratch = scratch_dir.join(format!("edges_tmp{worker}"));
    let file = File::create(&scratch).map_err(|e| CdbgError::io(&scratch, e))?;
    let mut w = BufWriter::new(file);
    let io = |e| CdbgError::io(&scratch, e);
    w.write_all(&0u64.to_le_bytes()).map_err(io)?;

    let mut edges: Vec<Edge> = Vec::with_capacity(spill_at.min(1 << 20));
    let mut num_edges = 0u64;
    let mut num_kmers = 0u64;
    let mut max_color = 0u32;

    for entry in filter.iter_hash_range(start, end) {
        debug_assert!(entry.value > 0);
        let color = (entry.value - 1) as u32;
        max_color = max_color.max(color);
        let kmer = Kmer::new(hash64_inv(entry.key, mask), k as usize);
        for neighbor in kmer.neighbors() {
            let value = filter.query(hash64(neighbor.bits(), mask));
            if value == 0 {
                continue;
            }
            let neighbor_color = (value - 1) as u32;
            // The lower-color endpoint emits the edge.
            if color < neighbor_color {
                edges.push(Edge::new(color, neighbor_color));
            }
        }
        if edges.len() >= spill_at {
            num_edges += spill(&mut w, &mut edges).map_err(io)?;
        }
        num_kmers += 1;
    }
    num_edges += spill(&mut w, &mut edges).map_err(io)?;

    let mut file = w.into_inner().map_err(|e| CdbgError::io(&scratch, e.into_error()))?;
    file.seek(SeekFrom::Start(0)).map_err(io)?;
    file.write_all(&num_edges.to_le_bytes()).map_err(io)?;

    debug!(worker, num_kmers, num_edges, "worker scan done");
    Ok(WorkerOutput { scratch, num_edges, num_kmers, max_color })
}

fn spill(w: &mut impl Write, edges: &mut Vec<Edge>) -> std::io::Result<u64> {
    let n = edges.len() as u64;
    for edge in edges.drain(..) {
        w.write_all(&edge.n1.to_le_bytes())?;
        w.write_all(&edge.n2.to_le_bytes())?;
    }
    Ok(n)
}

fn read_scratch(path: &Path) -> Result<Vec<Edge>> {
    let file = File::open(path).map_err(|e| CdbgError::io(path, e))?;
    // SAFETY: the scratch file is private to this process
    let map = unsafe { Mmap::map(&file) }.map_err(|e| CdbgError::io(path, e))?;
    let corrupt = |reason: &str| CdbgError::CorruptFile {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if map.len() < 8 {
        return Err(corrupt("missing count header"));
    }
    let count = u64::from_le_bytes(map[0..8].try_into().unwrap()) as usize;
    if map.len() < 8 + count * 8 {
        return Err(corrupt("truncated edge table"));
    }
    let mut edges = Vec::with_capacity(count);
    for i in 0..count {
        let off = 8 + i * 8;
        let n1 = u32::from_le_bytes(map[off..off + 4].try_into().unwrap());
        let n2 = u32::from_le_bytes(map[off + 4..off + 8].try_into().unwrap());
        edges.push(Edge { n1, n2 });
    }
    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_index, BuildConfig, SampleSource};
    use crate::filter::KmerFilter;

    fn source(name: &str, kmers: &[&str]) -> SampleSource {
        let kmers: Vec<Kmer> = kmers.iter().map(|s| Kmer::from_str(s).unwrap()).collect();
        let key_bits = 2 * kmers[0].k() as u64;
        SampleSource {
            name: name.to_string(),
            filter: KmerFilter::from_kmers(kmers, 4, key_bits, 1),
        }
    }

    #[test]
    fn test_bucket_id_places_root_on_diagonal() {
        // B = 2, three real colors in two buffers, root id 3
        assert_eq!(bucket_id(0, 1, 3, 2, 2), 0); // both buffer 0
        assert_eq!(bucket_id(0, 2, 3, 2, 2), 1); // buffers 0 and 1
        assert_eq!(bucket_id(2, 0, 3, 2, 2), 1); // order independent
        assert_eq!(bucket_id(0, 3, 3, 2, 2), 0); // root -> diagonal of buffer 0
        assert_eq!(bucket_id(2, 3, 3, 2, 2), 3); // root -> diagonal of buffer 1
    }

    #[test]
    fn test_edges_between_adjacent_kmers() {
        let dir = tempfile::tempdir().unwrap();
        // AAC extends AAA to the right; different sample sets -> one edge.
        let sources = vec![
            source("s0", &["AAA"]),
            source("s1", &["AAA", "AAC"]),
        ];
        let config = BuildConfig { kmer_len: 3, qbits: 4, ..BuildConfig::default() };
        let builder = build_index(config, &sources, dir.path()).unwrap();
        assert_eq!(builder.num_color_classes(), 2);

        let edge_sets = build_edge_sets(
            builder.filter(),
            builder.num_color_classes(),
            builder.classes_per_buffer(),
            2,
            dir.path(),
        )
        .unwrap();

        assert_eq!(edge_sets.num_nodes, 3);
        assert_eq!(edge_sets.root, 2);
        // one real edge (0,1) and two root edges
        assert_eq!(edge_sets.num_edges(), 3);
        let all: Vec<Edge> = edge_sets.buckets.iter().flatten().copied().collect();
        assert!(all.contains(&Edge { n1: 0, n2: 1 }));
        assert!(all.contains(&Edge { n1: 0, n2: 2 }));
        assert!(all.contains(&Edge { n1: 1, n2: 2 }));
        // scratch files are gone
        assert!(!dir.path().join("edges_tmp0").exists());
        assert!(!dir.path().join("edges_tmp1").exists());
    }

    #[test]
    fn test_no_edges_between_same_color() {
        let dir = tempfile::tempdir().unwrap();
        // both k-mers in the same single sample: one color, no real edges
        let sources = vec![source("s0", &["AAA", "AAC"])];
        let config = BuildConfig { kmer_len: 3, qbits: 4, ..BuildConfig::default() };
        let builder = build_index(config, &sources, dir.path()).unwrap();
        assert_eq!(builder.num_color_classes(), 1);

        let edge_sets = build_edge_sets(
            builder.filter(),
            builder.num_color_classes(),
            builder.classes_per_buffer(),
            1,
            dir.path(),
        )
        .unwrap();
        // only the root edge
        assert_eq!(edge_sets.num_edges(), 1);
    }
}
