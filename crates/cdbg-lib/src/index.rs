//! Sealed-index query surface
//!
//! Opens a per-index directory (main filter, sample listing, bitmap
//! sidecars) and answers batch k-mer queries: which samples contain which
//! of the queried k-mers. Colors are resolved either from the buffered
//! bitmaps or, when the spanning-tree encoding is present, through a
//! [`MstDecoder`]. Nothing here mutates the index.

use crate::bitmap::{eqclass_files, sidecar_header, BitmapSlab};
use crate::constants::{FILTER_FILE, PARENTBV_FILE, SAMPLEID_FILE};
use crate::decode::{DecodeStats, LruColorCache, MstDecoder};
use crate::error::{CdbgError, Result};
use crate::filter::KmerFilter;
use crate::hasher::hash64;
use crate::kmer::Kmer;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::info;

/// Parse `sampleid.lst`: lines of `<id> <name>`, returned in id order
pub fn read_sample_names(dir: &Path) -> Result<Vec<String>> {
    let path = dir.join(SAMPLEID_FILE);
    let file = File::open(&path).map_err(|e| CdbgError::io(&path, e))?;
    let mut names: Vec<(u64, String)> = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| CdbgError::io(&path, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (id, name) = line.split_once(' ').ok_or_else(|| {
            CdbgError::BadInput(format!("malformed sample line: {line}"))
        })?;
        let id: u64 = id.parse().map_err(|_| {
            CdbgError::BadInput(format!("malformed sample id in line: {line}"))
        })?;
        names.push((id, name.to_string()));
    }
    names.sort_by_key(|(id, _)| *id);
    for (expected, (id, _)) in names.iter().enumerate() {
        if *id != expected as u64 {
            return Err(CdbgError::BadInput(format!(
                "sample ids are not dense: expected {expected}, found {id}"
            )));
        }
    }
    Ok(names.into_iter().map(|(_, name)| name).collect())
}

/// Check that the files a sealed index requires exist under `dir`
pub fn data_exists(dir: &Path) -> bool {
    dir.join(FILTER_FILE).is_file() && dir.join(SAMPLEID_FILE).is_file()
}

/// A sealed, queryable index
pub struct ColoredIndex {
    dir: PathBuf,
    filter: KmerFilter,
    sample_names: Vec<String>,
    sidecars: Vec<PathBuf>,
    classes_per_buffer: u64,
    num_color_classes: u64,
}

impl ColoredIndex {
    /// Open the index stored under `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        if !data_exists(dir) {
            return Err(CdbgError::BadInput(format!(
                "no index found at {}",
                dir.display()
            )));
        }
        let filter = KmerFilter::open(&dir.join(FILTER_FILE))?;
        let sample_names = read_sample_names(dir)?;
        let sidecars = eqclass_files(dir)?;
        let mut num_color_classes = 0u64;
        let mut classes_per_buffer = 1u64;
        for (serial, path) in sidecars.iter().enumerate() {
            let (num_bitmaps, num_samples) = sidecar_header(path)?;
            if num_samples != sample_names.len() as u64 {
                return Err(CdbgError::CorruptFile {
                    path: path.clone(),
                    reason: format!(
                        "sidecar holds {num_samples}-sample bitmaps, index has {}",
                        sample_names.len()
                    ),
                });
            }
            if serial == 0 {
                classes_per_buffer = num_bitmaps;
            }
            num_color_classes += num_bitmaps;
        }
        info!(
            dir = %dir.display(),
            samples = sample_names.len(),
            color_classes = num_color_classes,
            buffers = sidecars.len(),
            "opened index"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            filter,
            sample_names,
            sidecars,
            classes_per_buffer,
            num_color_classes,
        })
    }

    /// Index directory
    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The sealed main filter
    #[inline]
    pub fn filter(&self) -> &KmerFilter {
        &self.filter
    }

    /// Sample names in id order
    #[inline]
    pub fn sample_names(&self) -> &[String] {
        &self.sample_names
    }

    /// Number of samples
    #[inline]
    pub fn num_samples(&self) -> u64 {
        self.sample_names.len() as u64
    }

    /// Number of distinct color classes
    #[inline]
    pub fn num_color_classes(&self) -> u64 {
        self.num_color_classes
    }

    /// Color classes per bitmap buffer
    #[inline]
    pub fn classes_per_buffer(&self) -> u64 {
        self.classes_per_buffer
    }

    /// Bitmap sidecar files in serial order
    #[inline]
    pub fn sidecar_files(&self) -> &[PathBuf] {
        &self.sidecars
    }

    /// K-mer length of the index
    #[inline]
    pub fn kmer_len(&self) -> u64 {
        self.filter.key_bits() / 2
    }

    /// Whether the spanning-tree encoding has been built for this index
    pub fn has_mst(&self) -> bool {
        self.dir.join(PARENTBV_FILE).is_file()
    }

    /// 1-based color-class id of a k-mer; 0 when absent
    pub fn query_color(&self, kmer: &Kmer) -> u64 {
        let key = hash64(kmer.canonical().bits(), self.filter.key_mask());
        self.filter.query(key)
    }

    /// Aggregate query k-mers per color class: color id -> hit count
    pub fn color_hits(&self, kmers: &[Kmer]) -> HashMap<u64, u64> {
        let mut hits: HashMap<u64, u64> = HashMap::new();
        for kmer in kmers {
            let color = self.query_color(kmer);
            if color > 0 {
                *hits.entry(color).or_insert(0) += 1;
            }
        }
        hits
    }

    /// Per-sample hit counts over a k-mer batch, resolved through the
    /// buffered bitmaps. Absent k-mers contribute nothing.
    pub fn find_samples(&self, kmers: &[Kmer]) -> Result<Vec<u64>> {
        let hits = self.color_hits(kmers);
        let mut counts = vec![0u64; self.sample_names.len()];
        let mut slabs: Vec<Option<BitmapSlab>> = (0..self.sidecars.len()).map(|_| None).collect();
        for (color, count) in hits {
            for sample in self.color_samples(color, &mut slabs)? {
                counts[sample as usize] += count;
            }
        }
        Ok(counts)
    }

    /// The sample-index list of every color hit by the batch
    pub fn find_sample_sets(&self, kmers: &[Kmer]) -> Result<HashMap<u64, Vec<u64>>> {
        let hits = self.color_hits(kmers);
        let mut out = HashMap::with_capacity(hits.len());
        let mut slabs: Vec<Option<BitmapSlab>> = (0..self.sidecars.len()).map(|_| None).collect();
        for color in hits.into_keys() {
            let samples = self.color_samples(color, &mut slabs)?;
            out.insert(color, samples);
        }
        Ok(out)
    }

    /// Per-sample hit counts resolved through the spanning-tree decoder
    /// instead of the buffered bitmaps
    pub fn find_samples_mst(&self, kmers: &[Kmer], decoder: &MstDecoder) -> Vec<u64> {
        let hits = self.color_hits(kmers);
        let mut counts = vec![0u64; self.sample_names.len()];
        let mut lru = LruColorCache::new(10_000);
        let mut stats = DecodeStats::default();
        for (color, count) in hits {
            // 1-based filter value to 0-based tree node
            let samples = decoder.decode_cached((color - 1) as u32, &mut lru, &mut stats);
            for sample in samples {
                counts[sample as usize] += count;
            }
        }
        counts
    }

    /// Sample indices of one 1-based color id, read from the sidecars
    fn color_samples(
        &self,
        color: u64,
        slabs: &mut [Option<BitmapSlab>],
    ) -> Result<Vec<u64>> {
        if self.sidecars.is_empty() {
            return Err(CdbgError::BadInput(format!(
                "index {} has no bitmap sidecars; resolve colors through the spanning tree",
                self.dir.display()
            )));
        }
        debug_assert!(color >= 1 && color <= self.num_color_classes);
        let idx0 = color - 1;
        let buffer = (idx0 / self.classes_per_buffer) as usize;
        let offset = idx0 % self.classes_per_buffer;
        if slabs[buffer].is_none() {
            slabs[buffer] = Some(BitmapSlab::load(&self.sidecars[buffer])?);
        }
        Ok(slabs[buffer].as_ref().unwrap().bitmap(offset).set_positions())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_index, BuildConfig, SampleSource};

    fn source(name: &str, kmers: &[&str]) -> SampleSource {
        let kmers: Vec<Kmer> = kmers.iter().map(|s| Kmer::from_str(s).unwrap()).collect();
        let key_bits = 2 * kmers[0].k() as u64;
        SampleSource {
            name: name.to_string(),
            filter: KmerFilter::from_kmers(kmers, 4, key_bits, 1),
        }
    }

    #[test]
    fn test_open_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![
            source("alpha", &["AAACA", "AAGTC"]),
            source("beta", &["AAACA", "ACCGA"]),
        ];
        let config = BuildConfig { kmer_len: 5, qbits: 4, ..BuildConfig::default() };
        build_index(config, &sources, dir.path()).unwrap();

        let index = ColoredIndex::open(dir.path()).unwrap();
        assert_eq!(index.num_samples(), 2);
        assert_eq!(index.sample_names(), &["alpha".to_string(), "beta".to_string()]);
        assert_eq!(index.num_color_classes(), 3);
        assert_eq!(index.kmer_len(), 5);
        assert!(!index.has_mst());

        // the shared k-mer resolves to both samples
        let shared = Kmer::from_str("AAACA").unwrap();
        let sets = index.find_sample_sets(&[shared]).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets.values().next().unwrap(), &vec![0, 1]);
    }

    #[test]
    fn test_absent_kmer_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![source("only", &["AAACA"])];
        let config = BuildConfig { kmer_len: 5, qbits: 4, ..BuildConfig::default() };
        build_index(config, &sources, dir.path()).unwrap();

        let index = ColoredIndex::open(dir.path()).unwrap();
        let absent = Kmer::from_str("CCTAG").unwrap();
        assert_eq!(index.query_color(&absent), 0);
        let counts = index.find_samples(&[absent]).unwrap();
        assert_eq!(counts, vec![0]);
    }

    #[test]
    fn test_find_samples_counts_hits() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![
            source("a", &["AAACA", "AAGTC"]),
            source("b", &["AAACA"]),
        ];
        let config = BuildConfig { kmer_len: 5, qbits: 4, ..BuildConfig::default() };
        build_index(config, &sources, dir.path()).unwrap();

        let index = ColoredIndex::open(dir.path()).unwrap();
        let kmers = vec![
            Kmer::from_str("AAACA").unwrap(),
            Kmer::from_str("AAGTC").unwrap(),
            Kmer::from_str("CCTAG").unwrap(), // absent
        ];
        let counts = index.find_samples(&kmers).unwrap();
        assert_eq!(counts, vec![2, 1]);
    }

    #[test]
    fn test_read_sample_names_rejects_gaps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SAMPLEID_FILE), "0 a\n2 b\n").unwrap();
        assert!(read_sample_names(dir.path()).is_err());
    }
}
