//! Source Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Enumeration failures are always
//! fatal to the run that requested them.

use derive_more::{Display, Error};

/// An enumeration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for enumeration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The source (directory, glob pattern, list file or stdin) could not be
    /// read. The underlying I/O or pattern error is attached as a child.
    #[display("source unavailable: {_0}")]
    SourceUnavailable(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
