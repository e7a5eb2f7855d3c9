//! On-disk formats for the MST artifacts
//!
//! Two small formats cover everything the MST stage persists:
//!
//! **Packed int vector** (`parents.bv`, `deltas.bv`):
//! ```text
//! magic "CDBGPIV1" | bit_width: u64 | len: u64 | packed values, LE u64 words
//! ```
//!
//! **Bit vector** (`boundaries.bv`):
//! ```text
//! magic "CDBGBIV1" | num_bits: u64 | words, LE u64
//! ```
//!
//! Values are packed back to back at `bit_width` bits each, low bits first,
//! so the reader can slice them back out with plain word arithmetic.

use crate::bitmap::get_int;
use crate::error::{CdbgError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use sux::prelude::*;

const PACKED_MAGIC: &[u8; 8] = b"CDBGPIV1";
const BITVEC_MAGIC: &[u8; 8] = b"CDBGBIV1";

/// Write a packed int vector to `path`
pub fn write_packed(path: &Path, vec: &BitFieldVec<usize>) -> Result<()> {
    let file = File::create(path).map_err(|e| CdbgError::io(path, e))?;
    let mut w = BufWriter::new(file);
    let io = |e| CdbgError::io(path, e);
    let width = vec.bit_width() as u64;
    let len = vec.len() as u64;
    w.write_all(PACKED_MAGIC).map_err(io)?;
    w.write_all(&width.to_le_bytes()).map_err(io)?;
    w.write_all(&len.to_le_bytes()).map_err(io)?;

    let mut acc = 0u64;
    let mut nbits = 0u64;
    for i in 0..vec.len() {
        let v = vec.get(i) as u64;
        acc |= v.wrapping_shl(nbits as u32);
        nbits += width;
        if nbits >= 64 {
            w.write_all(&acc.to_le_bytes()).map_err(io)?;
            nbits -= 64;
            acc = if nbits > 0 { v >> (width - nbits) } else { 0 };
        }
    }
    if nbits > 0 {
        w.write_all(&acc.to_le_bytes()).map_err(io)?;
    }
    w.flush().map_err(io)?;
    Ok(())
}

/// Read a packed int vector from `path`
pub fn read_packed(path: &Path) -> Result<BitFieldVec<usize>> {
    let file = File::open(path).map_err(|e| CdbgError::io(path, e))?;
    let mut r = BufReader::new(file);
    let io = |e| CdbgError::io(path, e);
    let corrupt = |reason: &str| CdbgError::CorruptFile {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).map_err(io)?;
    if &magic != PACKED_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let mut buf8 = [0u8; 8];
    r.read_exact(&mut buf8).map_err(io)?;
    let width = u64::from_le_bytes(buf8);
    r.read_exact(&mut buf8).map_err(io)?;
    let len = u64::from_le_bytes(buf8);
    if width == 0 || width > 64 {
        return Err(corrupt("bad bit width"));
    }

    let num_words = crate::constants::words_for(width * len);
    let mut raw = vec![0u8; num_words * 8];
    r.read_exact(&mut raw).map_err(io)?;
    let words: Vec<u64> = raw
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();

    let mut vec = BitFieldVec::<usize>::new(width as usize, len as usize);
    for i in 0..len {
        vec.set(i as usize, get_int(&words, i * width, width) as usize);
    }
    Ok(vec)
}

/// Write a plain bit vector to `path`
pub fn write_bitvec(path: &Path, words: &[u64], num_bits: u64) -> Result<()> {
    debug_assert_eq!(words.len(), crate::constants::words_for(num_bits));
    let file = File::create(path).map_err(|e| CdbgError::io(path, e))?;
    let mut w = BufWriter::new(file);
    let io = |e| CdbgError::io(path, e);
    w.write_all(BITVEC_MAGIC).map_err(io)?;
    w.write_all(&num_bits.to_le_bytes()).map_err(io)?;
    for &word in words {
        w.write_all(&word.to_le_bytes()).map_err(io)?;
    }
    w.flush().map_err(io)?;
    Ok(())
}

/// Read a plain bit vector from `path`, returning (words, num_bits)
pub fn read_bitvec(path: &Path) -> Result<(Vec<u64>, u64)> {
    let file = File::open(path).map_err(|e| CdbgError::io(path, e))?;
    let mut r = BufReader::new(file);
    let io = |e| CdbgError::io(path, e);
    let corrupt = |reason: &str| CdbgError::CorruptFile {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).map_err(io)?;
    if &magic != BITVEC_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let mut buf8 = [0u8; 8];
    r.read_exact(&mut buf8).map_err(io)?;
    let num_bits = u64::from_le_bytes(buf8);

    let num_words = crate::constants::words_for(num_bits);
    let mut raw = vec![0u8; num_words * 8];
    r.read_exact(&mut raw).map_err(io)?;
    let words = raw
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Ok((words, num_bits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ints.bv");

        for width in [1usize, 5, 17, 33, 64] {
            let max = if width == 64 { usize::MAX } else { (1usize << width) - 1 };
            let values = [0usize, 1, max, max / 2, 3, max, 0, 7 & max];
            let mut vec = BitFieldVec::<usize>::new(width, values.len());
            for (i, &v) in values.iter().enumerate() {
                vec.set(i, v);
            }
            write_packed(&path, &vec).unwrap();
            let back = read_packed(&path).unwrap();
            assert_eq!(back.len(), values.len(), "width {width}");
            for (i, &v) in values.iter().enumerate() {
                assert_eq!(back.get(i), v, "width {width}, index {i}");
            }
        }
    }

    #[test]
    fn test_bitvec_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bits.bv");

        let words = vec![0b1011u64, u64::MAX, 0];
        write_bitvec(&path, &words, 130).unwrap();
        let (back, num_bits) = read_bitvec(&path).unwrap();
        assert_eq!(num_bits, 130);
        assert_eq!(back, words);
    }

    #[test]
    fn test_packed_rejects_wrong_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bits.bv");
        write_bitvec(&path, &[0], 1).unwrap();
        assert!(read_packed(&path).is_err());
    }
}
