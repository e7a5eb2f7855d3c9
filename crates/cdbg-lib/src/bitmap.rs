//! Sample-set bitmaps and the flushing bitmap buffer
//!
//! A color class is an S-bit sample-set bitmap. During construction
//! bitmaps accumulate in a fixed-budget in-memory buffer holding exactly
//! `B = bv_buf_len / S` of them; each full buffer is compressed and
//! written as a numbered sidecar `<n>_eqclass_rrr.cls`, and the trailing
//! partial buffer is flushed when the index is sealed. Buffer slots are
//! bit-packed back to back, so bitmap `i` of a buffer starts at bit
//! `i * S` regardless of word alignment.

use crate::constants::{words_for, EQCLASS_SUFFIX};
use crate::error::{CdbgError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic bytes of a compressed bitmap sidecar
const EQCLASS_MAGIC: &[u8; 8] = b"CDBGEQC1";
/// zstd level for sidecar streams
const SIDECAR_ZSTD_LEVEL: i32 = 12;

/// Read `len` (<= 64) bits starting at `bit_off` from a word array
#[inline]
pub(crate) fn get_int(words: &[u64], bit_off: u64, len: u64) -> u64 {
    debug_assert!(len >= 1 && len <= 64);
    let word = (bit_off / 64) as usize;
    let shift = bit_off % 64;
    let mask = if len == 64 { u64::MAX } else { (1u64 << len) - 1 };
    let mut out = words[word] >> shift;
    if shift + len > 64 {
        out |= words[word + 1] << (64 - shift);
    }
    out & mask
}

/// Write `len` (<= 64) bits of `value` starting at `bit_off`
#[inline]
pub(crate) fn set_int(words: &mut [u64], bit_off: u64, value: u64, len: u64) {
    debug_assert!(len >= 1 && len <= 64);
    let mask = if len == 64 { u64::MAX } else { (1u64 << len) - 1 };
    let value = value & mask;
    let word = (bit_off / 64) as usize;
    let shift = bit_off % 64;
    words[word] = (words[word] & !(mask << shift)) | (value << shift);
    if shift + len > 64 {
        let hi_bits = shift + len - 64;
        let hi_mask = (1u64 << hi_bits) - 1;
        words[word + 1] = (words[word + 1] & !hi_mask) | (value >> (64 - shift));
    }
}

/// A fixed-width sample-set bitmap; bit i set means sample i contains the
/// k-mer. Bits past `num_bits` in the last word stay zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleBitmap {
    words: Vec<u64>,
    num_bits: u64,
}

impl SampleBitmap {
    /// All-zero bitmap over `num_bits` samples
    pub fn new(num_bits: u64) -> Self {
        Self { words: vec![0; words_for(num_bits)], num_bits }
    }

    /// Build from backing words (trailing bits are masked off)
    pub fn from_words(mut words: Vec<u64>, num_bits: u64) -> Self {
        assert_eq!(words.len(), words_for(num_bits));
        if num_bits % 64 != 0 {
            if let Some(last) = words.last_mut() {
                *last &= (1u64 << (num_bits % 64)) - 1;
            }
        }
        Self { words, num_bits }
    }

    /// Number of sample slots
    #[inline]
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Backing words
    #[inline]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Set bit `i`
    #[inline]
    pub fn set(&mut self, i: u64) {
        debug_assert!(i < self.num_bits);
        self.words[(i / 64) as usize] |= 1u64 << (i % 64);
    }

    /// Test bit `i`
    #[inline]
    pub fn get(&self, i: u64) -> bool {
        debug_assert!(i < self.num_bits);
        (self.words[(i / 64) as usize] >> (i % 64)) & 1 == 1
    }

    /// Number of set bits
    #[inline]
    pub fn popcount(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Hamming distance to another bitmap of the same width
    pub fn hamming(&self, other: &SampleBitmap) -> u64 {
        debug_assert_eq!(self.num_bits, other.num_bits);
        self.words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| (a ^ b).count_ones() as u64)
            .sum()
    }

    /// Sorted indices of set bits
    pub fn set_positions(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.popcount() as usize);
        for (wi, &word) in self.words.iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let bit = w.trailing_zeros() as u64;
                out.push(wi as u64 * 64 + bit);
                w &= w - 1;
            }
        }
        out
    }

    /// Zero every bit
    pub fn clear(&mut self) {
        self.words.fill(0);
    }
}

/// In-memory table of `B` bit-packed sample bitmaps with periodic flush
pub struct BitmapBuffer {
    words: Vec<u64>,
    num_samples: u64,
    classes_per_buffer: u64,
}

impl BitmapBuffer {
    /// Allocate a buffer of `bv_buf_len / num_samples` bitmap slots
    pub fn new(num_samples: u64, bv_buf_len: u64) -> Self {
        assert!(num_samples > 0, "need at least one sample");
        let classes_per_buffer = bv_buf_len / num_samples;
        assert!(
            classes_per_buffer > 0,
            "buffer bit budget {bv_buf_len} below one bitmap of {num_samples} bits"
        );
        Self {
            words: vec![0; words_for(classes_per_buffer * num_samples)],
            num_samples,
            classes_per_buffer,
        }
    }

    /// Bitmap slots per buffer (`B`)
    #[inline]
    pub fn classes_per_buffer(&self) -> u64 {
        self.classes_per_buffer
    }

    /// Sample count (`S`)
    #[inline]
    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    /// Copy a bitmap into the slot of 0-based color id `id0`, word-wise.
    /// The slot within the current buffer is `id0 % B`.
    pub fn place(&mut self, id0: u64, bitmap: &SampleBitmap) {
        debug_assert_eq!(bitmap.num_bits(), self.num_samples);
        let slot = id0 % self.classes_per_buffer;
        let start = slot * self.num_samples;
        let mut i = 0u64;
        while i < self.num_samples {
            let len = (self.num_samples - i).min(64);
            let word = get_int(bitmap.words(), i, len);
            set_int(&mut self.words, start + i, word, len);
            i += len;
        }
    }

    /// Read back the bitmap in slot `slot` of the current buffer
    pub fn read_slot(&self, slot: u64) -> SampleBitmap {
        debug_assert!(slot < self.classes_per_buffer);
        let start = slot * self.num_samples;
        let mut bitmap = SampleBitmap::new(self.num_samples);
        let mut i = 0u64;
        while i < self.num_samples {
            let len = (self.num_samples - i).min(64);
            let word = get_int(&self.words, start + i, len);
            set_int(&mut bitmap.words, i, word, len);
            i += len;
        }
        bitmap
    }

    /// Compress the first `occupied` bitmaps into sidecar file number
    /// `serial` under `dir`, then zero the buffer.
    pub fn flush(&mut self, dir: &Path, serial: u64, occupied: u64) -> Result<PathBuf> {
        debug_assert!(occupied >= 1 && occupied <= self.classes_per_buffer);
        let path = dir.join(format!("{serial}_{EQCLASS_SUFFIX}"));
        let file = File::create(&path).map_err(|e| CdbgError::io(&path, e))?;
        let mut w = BufWriter::new(file);
        let io = |e| CdbgError::io(&path, e);
        w.write_all(EQCLASS_MAGIC).map_err(io)?;
        w.write_all(&occupied.to_le_bytes()).map_err(io)?;
        w.write_all(&self.num_samples.to_le_bytes()).map_err(io)?;

        let occupied_words = words_for(occupied * self.num_samples);
        let mut enc = zstd::stream::write::Encoder::new(w, SIDECAR_ZSTD_LEVEL)
            .map_err(io)?;
        for &word in &self.words[..occupied_words] {
            enc.write_all(&word.to_le_bytes()).map_err(io)?;
        }
        enc.finish().map_err(io)?.flush().map_err(io)?;

        debug!(file = %path.display(), bitmaps = occupied, "flushed bitmap buffer");
        self.words.fill(0);
        Ok(path)
    }
}

/// A decompressed sidecar: read-only view of one buffer's bitmaps
pub struct BitmapSlab {
    words: Vec<u64>,
    num_bitmaps: u64,
    num_samples: u64,
}

impl BitmapSlab {
    /// Load and decompress a sidecar file
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| CdbgError::io(path, e))?;
        let mut r = BufReader::new(file);
        let io = |e| CdbgError::io(path, e);
        let corrupt = |reason: &str| CdbgError::CorruptFile {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let mut magic = [0u8; 8];
        r.read_exact(&mut magic).map_err(io)?;
        if &magic != EQCLASS_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let mut buf8 = [0u8; 8];
        r.read_exact(&mut buf8).map_err(io)?;
        let num_bitmaps = u64::from_le_bytes(buf8);
        r.read_exact(&mut buf8).map_err(io)?;
        let num_samples = u64::from_le_bytes(buf8);

        let expected_words = words_for(num_bitmaps * num_samples);
        let mut dec = zstd::stream::read::Decoder::new(r).map_err(io)?;
        let mut raw = Vec::with_capacity(expected_words * 8);
        dec.read_to_end(&mut raw).map_err(io)?;
        if raw.len() != expected_words * 8 {
            return Err(corrupt("decompressed size mismatch"));
        }
        let words = raw
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Ok(Self { words, num_bitmaps, num_samples })
    }

    /// Number of bitmaps stored in this buffer
    #[inline]
    pub fn num_bitmaps(&self) -> u64 {
        self.num_bitmaps
    }

    /// Sample count
    #[inline]
    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    /// The bitmap at in-buffer offset `offset` (0-based)
    pub fn bitmap(&self, offset: u64) -> SampleBitmap {
        assert!(offset < self.num_bitmaps, "bitmap offset {offset} out of buffer");
        let start = offset * self.num_samples;
        let mut bitmap = SampleBitmap::new(self.num_samples);
        let mut i = 0u64;
        while i < self.num_samples {
            let len = (self.num_samples - i).min(64);
            let word = get_int(&self.words, start + i, len);
            set_int(&mut bitmap.words, i, word, len);
            i += len;
        }
        bitmap
    }
}

/// Read only the header of a sidecar: (num_bitmaps, num_samples)
pub fn sidecar_header(path: &Path) -> Result<(u64, u64)> {
    let file = File::open(path).map_err(|e| CdbgError::io(path, e))?;
    let mut r = BufReader::new(file);
    let io = |e| CdbgError::io(path, e);
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).map_err(io)?;
    if &magic != EQCLASS_MAGIC {
        return Err(CdbgError::CorruptFile {
            path: path.to_path_buf(),
            reason: "bad magic".to_string(),
        });
    }
    let mut buf8 = [0u8; 8];
    r.read_exact(&mut buf8).map_err(io)?;
    let num_bitmaps = u64::from_le_bytes(buf8);
    r.read_exact(&mut buf8).map_err(io)?;
    let num_samples = u64::from_le_bytes(buf8);
    Ok((num_bitmaps, num_samples))
}

/// Discover the sidecar files under `dir`, sorted by their numeric prefix
pub fn eqclass_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut numbered: Vec<(u64, PathBuf)> = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| CdbgError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| CdbgError::io(dir, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(prefix) = name.strip_suffix(&format!("_{EQCLASS_SUFFIX}")) {
            let serial: u64 = prefix.parse().map_err(|_| CdbgError::BadInput(
                format!("sidecar file name {name} does not start with a number"),
            ))?;
            numbered.push((serial, entry.path()));
        }
    }
    numbered.sort_by_key(|(serial, _)| *serial);
    Ok(numbered.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_int_cross_word() {
        let mut words = vec![0u64; 3];
        set_int(&mut words, 60, 0b1011, 4); // spans words 0 and 1
        assert_eq!(get_int(&words, 60, 4), 0b1011);
        set_int(&mut words, 100, u64::MAX, 64);
        assert_eq!(get_int(&words, 100, 64), u64::MAX);
        // neighbours untouched
        assert_eq!(get_int(&words, 0, 60), 0);
    }

    #[test]
    fn test_bitmap_basics() {
        let mut bm = SampleBitmap::new(70);
        bm.set(0);
        bm.set(69);
        assert!(bm.get(0) && bm.get(69) && !bm.get(33));
        assert_eq!(bm.popcount(), 2);
        assert_eq!(bm.set_positions(), vec![0, 69]);
    }

    #[test]
    fn test_bitmap_hamming() {
        let mut a = SampleBitmap::new(10);
        let mut b = SampleBitmap::new(10);
        a.set(1);
        a.set(3);
        b.set(3);
        b.set(7);
        assert_eq!(a.hamming(&b), 2);
        assert_eq!(a.hamming(&a), 0);
    }

    #[test]
    fn test_last_word_masked_on_from_words() {
        let bm = SampleBitmap::from_words(vec![u64::MAX], 10);
        assert_eq!(bm.popcount(), 10);
    }

    #[test]
    fn test_place_and_read_unaligned_samples() {
        // S = 5 gives slots that straddle word boundaries
        let mut buffer = BitmapBuffer::new(5, 100); // B = 20
        assert_eq!(buffer.classes_per_buffer(), 20);
        for id0 in 0..20u64 {
            let mut bm = SampleBitmap::new(5);
            bm.set(id0 % 5);
            buffer.place(id0, &bm);
        }
        for slot in 0..20u64 {
            let bm = buffer.read_slot(slot);
            assert_eq!(bm.set_positions(), vec![slot % 5], "slot {slot}");
        }
    }

    #[test]
    fn test_flush_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = BitmapBuffer::new(130, 1000); // B = 7, S % 64 != 0
        let mut expected = Vec::new();
        for id0 in 0..7u64 {
            let mut bm = SampleBitmap::new(130);
            bm.set(id0);
            bm.set(129);
            buffer.place(id0, &bm);
            expected.push(bm);
        }
        buffer.flush(dir.path(), 0, 7).unwrap();

        let slab = BitmapSlab::load(&dir.path().join(format!("0_{EQCLASS_SUFFIX}"))).unwrap();
        assert_eq!(slab.num_bitmaps(), 7);
        assert_eq!(slab.num_samples(), 130);
        for (offset, bm) in expected.iter().enumerate() {
            assert_eq!(&slab.bitmap(offset as u64), bm);
        }
    }

    #[test]
    fn test_flush_partial_and_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = BitmapBuffer::new(3, 6); // B = 2
        let mut bm = SampleBitmap::new(3);
        bm.set(2);
        buffer.place(0, &bm);
        buffer.flush(dir.path(), 0, 1).unwrap();
        buffer.place(1, &bm);
        buffer.flush(dir.path(), 1, 1).unwrap();

        let files = eqclass_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].file_name().unwrap().to_string_lossy().starts_with("0_"));
        assert!(files[1].file_name().unwrap().to_string_lossy().starts_with("1_"));
    }

    #[test]
    fn test_buffer_zeroed_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = BitmapBuffer::new(4, 16); // B = 4
        let mut bm = SampleBitmap::new(4);
        bm.set(0);
        bm.set(3);
        for id0 in 0..4u64 {
            buffer.place(id0, &bm);
        }
        buffer.flush(dir.path(), 0, 4).unwrap();
        for slot in 0..4u64 {
            assert_eq!(buffer.read_slot(slot).popcount(), 0);
        }
    }
}
