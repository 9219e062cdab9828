//! Deduplication Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Only problems that stop the whole
//! pass are errors; a file that cannot be hashed or removed is recorded in the
//! [`DedupReport`](crate::DedupReport) instead.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A deduplication error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for deduplication operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The external hashing command could not be compiled or resolved.
    #[display("invalid hasher command")]
    Hasher,
    /// Discovery found none of the known hashing programs on `PATH`.
    #[display("no hashing program found on PATH")]
    NoHasher,
    /// The scratch index could not be created, written or read back.
    #[display("could not use scratch index in {}", _0.display())]
    Scratch(#[error(not(source))] PathBuf),
    /// The manifest could not be created before the pass started.
    #[display("could not write manifest to {}", _0.display())]
    Manifest(#[error(not(source))] PathBuf),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Scratch(_) | Self::Manifest(_))
    }
}
