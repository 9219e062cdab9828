//! Configuration Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Every configuration error is fatal
//! and is reported before any work starts.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A file given explicitly on the command line does not exist.
    #[display("configuration file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    #[display("unsupported configuration format (expected .toml, .yaml, .yml or .json): {}", _0.display())]
    UnsupportedFormat(#[error(not(source))] PathBuf),
    /// The merged configuration could not be deserialized.
    #[display("invalid configuration")]
    Load,
    #[display("timeout must be at least one second")]
    InvalidTimeout,
    #[display("invalid preset `{_0}`")]
    InvalidPreset(#[error(not(source))] String),
    #[display("unknown preset `{_0}`")]
    UnknownPreset(#[error(not(source))] String),
    #[display("preset `{name}` takes {expected} parameter(s) but {given} were given")]
    PresetParameters { name: String, expected: usize, given: usize },
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
