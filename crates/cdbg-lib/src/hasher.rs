//! Key hashing for the filter and content fingerprints for color classes.
//!
//! Filter keys live in hash space: a k-mer is hashed with an invertible
//! mix masked to the key width before insertion, so iteration over the
//! filter is hash-ordered while the original k-mer remains recoverable.
//! Color-class bitmaps are fingerprinted to 128 bits with a seeded ahash
//! pair for content-addressed deduplication.

use crate::constants::{FINGERPRINT_SEED_A, FINGERPRINT_SEED_B};
use ahash::RandomState;
use std::hash::{BuildHasher, Hasher};

/// Invertible 64-bit mix over a `2^b - 1` mask
///
/// Additions and multiplications are reduced modulo the mask width at each
/// step; the xor-shift steps need no reduction because the operand already
/// fits the mask.
#[inline]
pub fn hash64(key: u64, mask: u64) -> u64 {
    let mut key = key;
    key = (!key).wrapping_add(key << 21) & mask;
    key ^= key >> 24;
    key = key.wrapping_add(key << 3).wrapping_add(key << 8) & mask; // * 265
    key ^= key >> 14;
    key = key.wrapping_add(key << 2).wrapping_add(key << 4) & mask; // * 21
    key ^= key >> 28;
    key = key.wrapping_add(key << 31) & mask;
    key
}

/// Exact inverse of [`hash64`] over the same mask
#[inline]
pub fn hash64_inv(key: u64, mask: u64) -> u64 {
    let mut key = key;
    let mut tmp: u64;

    // Invert key = key + (key << 31)
    tmp = key.wrapping_sub(key << 31);
    key = key.wrapping_sub(tmp << 31) & mask;

    // Invert key = key ^ (key >> 28)
    tmp = key ^ key >> 28;
    key ^= tmp >> 28;

    // Invert key *= 21
    key = key.wrapping_mul(14933078535860113213) & mask;

    // Invert key = key ^ (key >> 14)
    tmp = key ^ key >> 14;
    tmp = key ^ tmp >> 14;
    tmp = key ^ tmp >> 14;
    key ^= tmp >> 14;

    // Invert key *= 265
    key = key.wrapping_mul(15244667743933553977) & mask;

    // Invert key = key ^ (key >> 24)
    tmp = key ^ key >> 24;
    key ^= tmp >> 24;

    // Invert key = (~key) + (key << 21)
    tmp = !key;
    tmp = !(key.wrapping_sub(tmp << 21));
    tmp = !(key.wrapping_sub(tmp << 21));
    key = !(key.wrapping_sub(tmp << 21)) & mask;

    key
}

/// Deterministic 128-bit content fingerprint over bitmap words
///
/// Two independently seeded ahash states; the two 64-bit digests are
/// concatenated. Collisions are assumed unique within one build.
#[derive(Clone)]
pub struct Fingerprint128 {
    state_a: RandomState,
    state_b: RandomState,
}

impl Fingerprint128 {
    /// Create the fingerprinter with the crate's fixed seed pair
    pub fn new() -> Self {
        Self {
            state_a: RandomState::with_seeds(
                FINGERPRINT_SEED_A,
                !FINGERPRINT_SEED_A,
                FINGERPRINT_SEED_A,
                !FINGERPRINT_SEED_A,
            ),
            state_b: RandomState::with_seeds(
                FINGERPRINT_SEED_B,
                !FINGERPRINT_SEED_B,
                FINGERPRINT_SEED_B,
                !FINGERPRINT_SEED_B,
            ),
        }
    }

    /// Fingerprint a word slice
    pub fn fingerprint(&self, words: &[u64]) -> u128 {
        let hi = digest(&self.state_a, words);
        let lo = digest(&self.state_b, words);
        ((hi as u128) << 64) | lo as u128
    }
}

impl Default for Fingerprint128 {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn digest(state: &RandomState, words: &[u64]) -> u64 {
    let mut hasher = state.build_hasher();
    for &w in words {
        hasher.write_u64(w);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash64_roundtrip() {
        for key_bits in [10u32, 21, 40, 62, 64] {
            let mask = if key_bits == 64 { u64::MAX } else { (1u64 << key_bits) - 1 };
            for key in [0u64, 1, 2, 41, 1021, 0xDEAD, (1 << 9) + 7] {
                let key = key & mask;
                let h = hash64(key, mask);
                assert!(h <= mask);
                assert_eq!(hash64_inv(h, mask), key, "key_bits={key_bits} key={key}");
            }
        }
    }

    #[test]
    fn test_hash64_injective_on_small_domain() {
        let mask = (1u64 << 16) - 1;
        let mut seen = vec![false; 1 << 16];
        for key in 0..(1u64 << 16) {
            let h = hash64(key, mask) as usize;
            assert!(!seen[h], "collision at key {key}");
            seen[h] = true;
        }
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let fp1 = Fingerprint128::new();
        let fp2 = Fingerprint128::new();
        let words = [0xABCDu64, 0, 42];
        assert_eq!(fp1.fingerprint(&words), fp2.fingerprint(&words));
    }

    #[test]
    fn test_fingerprint_distinguishes_contents() {
        let fp = Fingerprint128::new();
        assert_ne!(fp.fingerprint(&[1, 0]), fp.fingerprint(&[0, 1]));
        assert_ne!(fp.fingerprint(&[1]), fp.fingerprint(&[1, 0]));
        assert_ne!(fp.fingerprint(&[]), fp.fingerprint(&[0]));
    }
}
