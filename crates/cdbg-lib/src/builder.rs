//! N-way merging constructor
//!
//! Builds the main index by merging N per-sample filters, all iterated in
//! ascending key-hash order, through a binary min-heap:
//!
//! 1. Sampling phase: merge until a configured number of k-mers has been
//!    consumed or the bitmap buffer fills. The dedup map is then reordered
//!    by decreasing abundance, ids are reissued, the buffer is reshuffled
//!    to the new slot order, and the main filter is reset.
//! 2. Full phase: with the reordered map seeded, the merge restarts from
//!    the beginning of every input and runs to exhaustion, flushing the
//!    buffer each time a new color class fills it.
//!
//! The merge is strictly sequential: color-class ids must be assigned
//! deterministically in first-seen order.

use crate::bitmap::{BitmapBuffer, SampleBitmap};
use crate::colorstore::{ColorClassStore, ColorEntry};
use crate::constants::{
    BV_BUF_LEN, DEFAULT_SEED, EQCLASS_DIST_FILE, FILTER_FILE, SAMPLEID_FILE, SAMPLE_SIZE,
};
use crate::error::{CdbgError, Result};
use crate::filter::{FilterIter, KmerFilter};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Construction parameters
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// log2 of the initial slot count of the main filter
    pub qbits: u64,
    /// K-mer length in bases; filter keys are 2k bits wide
    pub kmer_len: u64,
    /// Hash seed recorded in the filter
    pub seed: u32,
    /// Bit budget of one bitmap buffer
    pub bv_buf_len: u64,
    /// Number of k-mers consumed by the sampling phase
    pub sample_size: u64,
    /// Worker count for the MST stages (the merge itself is sequential)
    pub num_threads: usize,
    /// Dump (color id, abundance) pairs next to the index
    pub dump_eqclass_dist: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            qbits: 20,
            kmer_len: 23,
            seed: DEFAULT_SEED,
            bv_buf_len: BV_BUF_LEN,
            sample_size: SAMPLE_SIZE,
            num_threads: 1,
            dump_eqclass_dist: false,
        }
    }
}

impl BuildConfig {
    /// Validate parameter ranges
    pub fn validate(&self) -> Result<()> {
        if self.kmer_len < 1 || self.kmer_len > 32 {
            return Err(CdbgError::BadInput(format!(
                "k must be in [1, 32], got {}",
                self.kmer_len
            )));
        }
        if self.qbits >= 2 * self.kmer_len {
            return Err(CdbgError::BadInput(format!(
                "qbits {} must be below key width {}",
                self.qbits,
                2 * self.kmer_len
            )));
        }
        Ok(())
    }

    /// Key width in bits
    #[inline]
    pub fn key_bits(&self) -> u64 {
        2 * self.kmer_len
    }
}

/// One input sample: its name and its hash-ordered filter
pub struct SampleSource {
    /// Sample name written to `sampleid.lst`
    pub name: String,
    /// The sample's membership filter
    pub filter: KmerFilter,
}

impl SampleSource {
    /// Open a serialized per-sample filter; the sample name is the file stem
    pub fn open(path: &Path) -> Result<Self> {
        let filter = KmerFilter::open(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, filter })
    }

    /// Open every filter named in a list file, one path per line
    pub fn open_list(list_path: &Path) -> Result<Vec<Self>> {
        let file = File::open(list_path).map_err(|e| CdbgError::io(list_path, e))?;
        let mut sources = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| CdbgError::io(list_path, e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            sources.push(Self::open(Path::new(line))?);
        }
        if sources.is_empty() {
            return Err(CdbgError::BadInput(format!(
                "input list {} names no filters",
                list_path.display()
            )));
        }
        Ok(sources)
    }
}

struct Cursor<'a> {
    iter: FilterIter<'a>,
    current: u64,
    sample_id: u32,
}

impl PartialEq for Cursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.current == other.current && self.sample_id == other.sample_id
    }
}

impl Eq for Cursor<'_> {}

impl PartialOrd for Cursor<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.current
            .cmp(&other.current)
            .then(self.sample_id.cmp(&other.sample_id))
    }
}

/// Heap merge over N hash-ordered sample filters. Yields every distinct
/// key exactly once, together with the full sample-set bitmap, in
/// ascending key order. Shared by the sampling pass, the full pass and
/// both blocked-construction passes.
pub(crate) struct MergingIter<'a> {
    heap: BinaryHeap<Reverse<Cursor<'a>>>,
    num_samples: u64,
}

impl<'a> MergingIter<'a> {
    pub(crate) fn new(sources: &'a [SampleSource]) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (sample_id, source) in sources.iter().enumerate() {
            let mut iter = source.filter.iter();
            if let Some(first) = iter.next() {
                heap.push(Reverse(Cursor {
                    iter,
                    current: first.key,
                    sample_id: sample_id as u32,
                }));
            }
        }
        Self { heap, num_samples: sources.len() as u64 }
    }
}

impl Iterator for MergingIter<'_> {
    type Item = (u64, SampleBitmap);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.heap.peek()?.0.current;
        let mut bitmap = SampleBitmap::new(self.num_samples);
        // Collect every cursor sitting on this key before emitting, so each
        // distinct k-mer comes out exactly once with its complete sample set.
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.current != key {
                break;
            }
            let Reverse(mut cursor) = self.heap.pop().unwrap();
            bitmap.set(cursor.sample_id as u64);
            if let Some(entry) = cursor.iter.next() {
                cursor.current = entry.key;
                self.heap.push(Reverse(cursor));
            }
        }
        Some((key, bitmap))
    }
}

/// Phase outcome of one merge pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePhase {
    /// Bounded pass that stops on a full buffer or the k-mer budget
    Sampling,
    /// Unbounded pass that flushes full buffers and runs to exhaustion
    Full,
}

/// Builder for the colored index: main filter + color-class store + buffer
pub struct IndexBuilder {
    config: BuildConfig,
    out_dir: PathBuf,
    filter: KmerFilter,
    store: ColorClassStore,
    buffer: BitmapBuffer,
    sample_names: Vec<String>,
    num_samples: u64,
    num_serializations: u64,
}

impl IndexBuilder {
    /// Create a builder writing into `out_dir` (created if missing)
    pub fn new(config: BuildConfig, sample_names: Vec<String>, out_dir: &Path) -> Result<Self> {
        config.validate()?;
        if sample_names.is_empty() {
            return Err(CdbgError::BadInput("no input samples".to_string()));
        }
        std::fs::create_dir_all(out_dir).map_err(|e| CdbgError::io(out_dir, e))?;
        let num_samples = sample_names.len() as u64;
        let filter = KmerFilter::new(config.qbits, config.key_bits(), config.seed);
        let buffer = BitmapBuffer::new(num_samples, config.bv_buf_len);
        Ok(Self {
            config,
            out_dir: out_dir.to_path_buf(),
            filter,
            store: ColorClassStore::new(),
            buffer,
            sample_names,
            num_samples,
            num_serializations: 0,
        })
    }

    /// Color classes per buffer (`B`)
    #[inline]
    pub fn classes_per_buffer(&self) -> u64 {
        self.buffer.classes_per_buffer()
    }

    /// Number of distinct color classes so far
    #[inline]
    pub fn num_color_classes(&self) -> u64 {
        self.store.len()
    }

    /// Number of input samples
    #[inline]
    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    /// Sidecar files written so far
    #[inline]
    pub fn num_serializations(&self) -> u64 {
        self.num_serializations
    }

    /// The main filter under construction
    #[inline]
    pub fn filter(&self) -> &KmerFilter {
        &self.filter
    }

    fn check_sources(&self, sources: &[SampleSource]) -> Result<()> {
        if sources.len() as u64 != self.num_samples {
            return Err(CdbgError::BadInput(format!(
                "expected {} sources, got {}",
                self.num_samples,
                sources.len()
            )));
        }
        for source in sources {
            if source.filter.key_bits() != self.config.key_bits() {
                return Err(CdbgError::BadInput(format!(
                    "sample {} has key width {}, index expects {}",
                    source.name,
                    source.filter.key_bits(),
                    self.config.key_bits()
                )));
            }
        }
        Ok(())
    }

    /// Record one merged k-mer: deduplicate its color class and insert the
    /// (key -> id) pair into the main filter. Returns whether the color
    /// class is new. A key that is already present is a fatal corruption.
    fn add_kmer(&mut self, key: u64, bitmap: &SampleBitmap) -> bool {
        let (id, was_new) = self.store.try_add(bitmap, &mut self.buffer);
        let existing = self.filter.query(key);
        assert!(
            existing == 0,
            "k-mer {key:#x} was already present with color id {existing}"
        );
        self.filter.insert(key, id);
        was_new
    }

    /// Run one merge pass over the inputs. The sampling pass stops when
    /// the buffer fills or `sample_size` k-mers have been consumed and
    /// never flushes; the full pass flushes each filled buffer and runs
    /// to exhaustion.
    pub fn run_merge(&mut self, sources: &[SampleSource], phase: MergePhase) -> Result<u64> {
        self.check_sources(sources)?;
        let classes_per_buffer = self.classes_per_buffer();
        let mut counter = 0u64;
        let merge = MergingIter::new(sources);
        for (key, bitmap) in merge {
            let was_new = self.add_kmer(key, &bitmap);
            counter += 1;
            if counter % 10_000_000 == 0 {
                info!(
                    kmers = counter,
                    color_classes = self.store.len(),
                    "merging k-mers"
                );
            }
            if was_new && self.store.len() % classes_per_buffer == 0 {
                match phase {
                    MergePhase::Sampling => break,
                    MergePhase::Full => {
                        info!(
                            color_classes = self.store.len(),
                            "serializing full bitmap buffer"
                        );
                        self.flush_buffer(classes_per_buffer)?;
                    }
                }
            } else if phase == MergePhase::Sampling && counter >= self.config.sample_size {
                break;
            }
        }
        Ok(counter)
    }

    fn flush_buffer(&mut self, occupied: u64) -> Result<()> {
        self.buffer
            .flush(&self.out_dir, self.num_serializations, occupied)?;
        self.num_serializations += 1;
        Ok(())
    }

    /// Sampling phase: bounded merge, abundance reorder, reshuffle, filter
    /// reset. After this the builder is seeded for the full phase.
    pub fn run_sampling_phase(&mut self, sources: &[SampleSource]) -> Result<()> {
        info!(
            sample_size = self.config.sample_size,
            "sampling color-class abundances"
        );
        let consumed = self.run_merge(sources, MergePhase::Sampling)?;
        info!(
            kmers = consumed,
            color_classes = self.store.len(),
            "sampling phase done, reordering by abundance"
        );
        let reordered = self.store.reorder_by_abundance();
        self.reinit(reordered)
    }

    /// Full phase: restart the merge from the beginning of every input
    pub fn run_full_phase(&mut self, sources: &[SampleSource]) -> Result<()> {
        let consumed = self.run_merge(sources, MergePhase::Full)?;
        info!(
            kmers = consumed,
            color_classes = self.store.len(),
            "full merge phase done"
        );
        Ok(())
    }

    /// Install a reordered dedup map: rebuild the buffer in the new slot
    /// order, swap the map in, and reset the main filter so the full phase
    /// starts from scratch. Every fingerprint of the new map must already
    /// be known; a miss means the sampling state is corrupt.
    pub fn reinit(
        &mut self,
        map: std::collections::HashMap<u128, ColorEntry, ahash::RandomState>,
    ) -> Result<()> {
        let mut new_buffer = BitmapBuffer::new(self.num_samples, self.config.bv_buf_len);
        for (fingerprint, new_entry) in &map {
            let old_entry = self
                .store
                .get(*fingerprint)
                .unwrap_or_else(|| panic!("fingerprint missing during reshuffle"));
            let slot = (old_entry.id - 1) % self.buffer.classes_per_buffer();
            let bitmap = self.buffer.read_slot(slot);
            new_buffer.place(new_entry.id - 1, &bitmap);
        }
        self.buffer = new_buffer;
        self.store.replace(map);
        self.filter = KmerFilter::new(self.config.qbits, self.config.key_bits(), self.config.seed);

        // The sampling phase may have stopped on an exactly-full buffer;
        // it must go to disk before the full phase reuses the slots.
        if self.store.len() > 0 && self.store.len() % self.classes_per_buffer() == 0 {
            info!(
                color_classes = self.store.len(),
                "serializing bitmap buffer filled during sampling"
            );
            self.flush_buffer(self.classes_per_buffer())?;
        }
        Ok(())
    }

    /// Seal the index: write the main filter, the trailing partial buffer
    /// and the sample listing (plus the abundance dump when configured).
    pub fn serialize(&mut self) -> Result<()> {
        let filter_path = self.out_dir.join(FILTER_FILE);
        self.filter.serialize(&filter_path)?;

        let trailing = self.store.len() % self.classes_per_buffer();
        if trailing > 0 {
            self.flush_buffer(trailing)?;
        }

        let sample_path = self.out_dir.join(SAMPLEID_FILE);
        let file = File::create(&sample_path).map_err(|e| CdbgError::io(&sample_path, e))?;
        let mut w = BufWriter::new(file);
        for (id, name) in self.sample_names.iter().enumerate() {
            writeln!(w, "{id} {name}").map_err(|e| CdbgError::io(&sample_path, e))?;
        }
        w.flush().map_err(|e| CdbgError::io(&sample_path, e))?;

        if self.config.dump_eqclass_dist {
            let dist_path = self.out_dir.join(EQCLASS_DIST_FILE);
            let file = File::create(&dist_path).map_err(|e| CdbgError::io(&dist_path, e))?;
            let mut w = BufWriter::new(file);
            for (_, entry) in self.store.iter() {
                writeln!(w, "{} {}", entry.id, entry.abundance)
                    .map_err(|e| CdbgError::io(&dist_path, e))?;
            }
            w.flush().map_err(|e| CdbgError::io(&dist_path, e))?;
        }

        info!(
            color_classes = self.store.len(),
            buffers = self.num_serializations,
            "index sealed"
        );
        Ok(())
    }
}

/// Build a complete index from per-sample filters: sampling phase, full
/// phase, then seal.
pub fn build_index(
    config: BuildConfig,
    sources: &[SampleSource],
    out_dir: &Path,
) -> Result<IndexBuilder> {
    let names = sources.iter().map(|s| s.name.clone()).collect();
    let mut builder = IndexBuilder::new(config, names, out_dir)?;
    builder.run_sampling_phase(sources)?;
    builder.run_full_phase(sources)?;
    builder.serialize()?;
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::hash64;
    use crate::kmer::Kmer;

    fn source(name: &str, kmers: &[&str], k: u64) -> SampleSource {
        let kmers: Vec<Kmer> = kmers.iter().map(|s| Kmer::from_str(s).unwrap()).collect();
        assert!(kmers.iter().all(|kmer| kmer.k() as u64 == k));
        SampleSource {
            name: name.to_string(),
            filter: KmerFilter::from_kmers(kmers, 4, 2 * k, DEFAULT_SEED),
        }
    }

    fn config(k: u64) -> BuildConfig {
        BuildConfig { kmer_len: k, qbits: 4, ..BuildConfig::default() }
    }

    #[test]
    fn test_merging_iter_groups_ties() {
        let sources = vec![
            source("s0", &["AAACA", "AAGTC"], 5),
            source("s1", &["AAACA", "ACCGA"], 5),
        ];
        let merged: Vec<(u64, SampleBitmap)> = MergingIter::new(&sources).collect();
        // three distinct canonical k-mers, keys ascending
        assert_eq!(merged.len(), 3);
        assert!(merged.windows(2).all(|w| w[0].0 < w[1].0));
        let shared_key = hash64(
            Kmer::from_str("AAACA").unwrap().canonical().bits(),
            (1u64 << 10) - 1,
        );
        let shared = merged.iter().find(|(key, _)| *key == shared_key).unwrap();
        assert_eq!(shared.1.set_positions(), vec![0, 1]);
    }

    #[test]
    fn test_build_assigns_ids_first_seen() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![
            source("s0", &["AAACA", "AAGTC"], 5),
            source("s1", &["AAACA", "CCTAG"], 5),
        ];
        let builder = build_index(config(5), &sources, dir.path()).unwrap();
        // {s0,s1}, {s0}, {s1} are the distinct sample sets
        assert_eq!(builder.num_color_classes(), 3);
        // every stored value is a valid 1-based color id
        for entry in builder.filter().iter() {
            assert!(entry.value >= 1 && entry.value <= 3);
        }
    }

    #[test]
    fn test_build_flushes_on_buffer_boundary() {
        let dir = tempfile::tempdir().unwrap();
        // S = 2, bv_buf_len = 4 -> B = 2; five distinct colors follow
        let sources = vec![
            source("s0", &["AAACA", "AAGTC", "ACCGA", "ATAGC", "AACCC"], 5),
            source("s1", &["AAACA", "AAGTC", "CCTAG", "ATAGC", "TTGGA"], 5),
        ];
        // distinct sample sets: {0,1} (AAACA, AAGTC, ATAGC), {0} (ACCGA, AACCC), {1} (CCTAG, TTGGA)
        let cfg = BuildConfig { bv_buf_len: 4, ..config(5) };
        let builder = build_index(cfg, &sources, dir.path()).unwrap();
        assert_eq!(builder.num_color_classes(), 3);
        // 3 colors with B = 2: one full flush plus the trailing partial
        assert_eq!(builder.num_serializations(), 2);
        let files = crate::bitmap::eqclass_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        let first = crate::bitmap::BitmapSlab::load(&files[0]).unwrap();
        let second = crate::bitmap::BitmapSlab::load(&files[1]).unwrap();
        assert_eq!(first.num_bitmaps(), 2);
        assert_eq!(second.num_bitmaps(), 1);
    }

    #[test]
    fn test_sampling_reorder_puts_abundant_first() {
        let dir = tempfile::tempdir().unwrap();
        // {s0,s1} appears twice, {s0} once
        let sources = vec![
            source("s0", &["AAACA", "AAGTC", "ACCGA"], 5),
            source("s1", &["AAACA", "AAGTC"], 5),
        ];
        let mut builder =
            IndexBuilder::new(config(5), vec!["s0".into(), "s1".into()], dir.path()).unwrap();
        builder.run_sampling_phase(&sources).unwrap();
        // after the reorder, the most abundant class holds id 1
        let mut shared = SampleBitmap::new(2);
        shared.set(0);
        shared.set(1);
        let fp = {
            let fingerprinter = crate::hasher::Fingerprint128::new();
            fingerprinter.fingerprint(shared.words())
        };
        let store_entry = builder.store.get(fp).unwrap();
        assert_eq!(store_entry.id, 1);
        assert_eq!(store_entry.abundance, 2);
        // the reshuffled buffer holds the bitmap at the new slot
        assert_eq!(builder.buffer.read_slot(0), shared);
        // the filter was reset for the full phase
        assert_eq!(builder.filter().len(), 0);

        builder.run_full_phase(&sources).unwrap();
        assert_eq!(builder.num_color_classes(), 2);
        assert_eq!(builder.filter().len(), 3);
        builder.serialize().unwrap();
        assert!(dir.path().join(FILTER_FILE).exists());
        assert!(dir.path().join(SAMPLEID_FILE).exists());
    }

    #[test]
    fn test_single_sample_single_color() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![source("only", &["AAACA", "AAGTC", "ACCGA"], 5)];
        let builder = build_index(config(5), &sources, dir.path()).unwrap();
        // one sample: every bitmap is the single bit {0}
        assert_eq!(builder.num_color_classes(), 1);
        for entry in builder.filter().iter() {
            assert_eq!(entry.value, 1);
        }
    }
}
