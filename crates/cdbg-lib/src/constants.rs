//! Constants and configuration shared across the index.
//!
//! Buffer geometry, sampling bounds and the on-disk file names live here so
//! that the builder, the MST compressor and the query surface agree on them.

/// Invalid value sentinel
pub const INVALID_UINT64: u64 = u64::MAX;

/// Default seed for the invertible key hash
pub const DEFAULT_SEED: u32 = 2038074743;

/// Seed pair for the 128-bit color-class fingerprint
pub const FINGERPRINT_SEED_A: u64 = 2038074743;
/// Second fingerprint seed
pub const FINGERPRINT_SEED_B: u64 = 2038074751;

/// Bit budget of one in-memory bitmap buffer. The number of color classes
/// per buffer is `BV_BUF_LEN / num_samples`.
pub const BV_BUF_LEN: u64 = 20_000_000;

/// Number of k-mers consumed by the sampling phase of construction
pub const SAMPLE_SIZE: u64 = 1 << 26;

/// Cap on in-memory scratch edges across all edge-enumeration workers
pub const MAX_TMP_EDGES: u64 = 31_250_000;

/// Maximum number of k-mers assigned to one block of a blocked filter
pub const BLOCK_KMER_THRESHOLD: u64 = 100_000_000;

/// Minimizer length in bases for the blocked-filter mode
pub const MINIMIZER_LEN: u64 = 8;

/// Serialized main filter
pub const FILTER_FILE: &str = "dbg_cqf.ser";
/// Sample id to sample name listing
pub const SAMPLEID_FILE: &str = "sampleid.lst";
/// Suffix of the numbered, compressed bitmap buffer sidecars
pub const EQCLASS_SUFFIX: &str = "eqclass_rrr.cls";
/// Packed parent ids of the color MST
pub const PARENTBV_FILE: &str = "parents.bv";
/// Bit vector marking the end of each delta run
pub const BOUNDARYBV_FILE: &str = "boundaries.bv";
/// Packed sample indices of the delta runs
pub const DELTABV_FILE: &str = "deltas.bv";
/// Merger input: new pair-color id to the two source color ids
pub const NEW_TO_OLD_IDS_FILE: &str = "newID2oldIDs";
/// Blocked-filter mode: flat u64 minimizer-to-block map
pub const MINIMIZER_BOUNDARY_FILE: &str = "minimizer_boundary";
/// Optional dump of (color id, abundance) pairs
pub const EQCLASS_DIST_FILE: &str = "eqclass_dist.lst";

/// Compute ceil(log2(x)): the minimum number of bits needed to represent
/// values in [0, x). Returns 0 for x <= 1.
#[inline]
pub const fn ceil_log2(x: u64) -> usize {
    if x <= 1 {
        0
    } else {
        64 - (x - 1).leading_zeros() as usize
    }
}

/// Number of 64-bit words needed for `bits` bits
#[inline]
pub const fn words_for(bits: u64) -> usize {
    bits.div_ceil(64) as usize
}
