//! Error types for index construction and querying.
//!
//! Only recoverable failures are represented here: unusable inputs and I/O.
//! Invariant violations (inserting a k-mer twice, a missing fingerprint
//! during the sampling reshuffle, a zero-weight color edge) indicate a
//! corrupted build and panic instead; a failed build leaves partial files
//! behind and is rerun from scratch.

use std::path::PathBuf;
use thiserror::Error;

/// Error type for index operations
#[derive(Error, Debug)]
pub enum CdbgError {
    /// A required input is missing or malformed
    #[error("bad input: {0}")]
    BadInput(String),

    /// An I/O failure, annotated with the path involved
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The file or directory the operation touched
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// A serialized filter or sidecar file failed validation
    #[error("corrupt file {path}: {reason}")]
    CorruptFile {
        /// The offending file
        path: PathBuf,
        /// What failed to validate
        reason: String,
    },

    /// A DNA string could not be 2-bit encoded
    #[error(transparent)]
    Encoding(#[from] crate::encoding::EncodingError),
}

impl CdbgError {
    /// Wrap an I/O error with the path it occurred on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CdbgError::Io { path: path.into(), source }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CdbgError>;
