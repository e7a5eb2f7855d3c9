// cdbg: a compressed, queryable colored de Bruijn graph index.
//
// Maps each canonical k-mer to the set of input samples containing it,
// deduplicates the sample-set bitmaps into color classes, and compresses
// color storage with a minimum spanning tree over the color graph.

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod bitmap;
pub mod blocked;
pub mod builder;
pub mod colorstore;
pub mod constants;
pub mod decode;
pub mod edges;
pub mod encoding;
pub mod error;
pub mod filter;
pub mod hasher;
pub mod index;
pub mod kmer;
pub mod merge;
pub mod mst;
pub mod serialization;

// Re-export the main entry points at the crate root
pub use builder::{build_index, BuildConfig, IndexBuilder, SampleSource};
pub use decode::{DecodeStats, LruColorCache, MstDecoder};
pub use error::{CdbgError, Result};
pub use filter::KmerFilter;
pub use index::ColoredIndex;
pub use kmer::Kmer;
pub use merge::merge_msts;
pub use mst::{build_mst_for_index, remove_color_class_files, MstArtifacts};

/// Version information
pub fn version() -> (u8, u8, u8) {
    (0, 1, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let (major, minor, patch) = version();
        assert_eq!(major, 0);
        assert_eq!(minor, 1);
        assert_eq!(patch, 0);
    }
}
