//! Template Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Template errors are fatal: they are
//! raised before any item is dispatched.

use derive_more::{Display, Error};

/// A template error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for template operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The command has no program element.
    #[display("command template is empty")]
    Empty,
    /// An element failed to compile.
    #[display("malformed template in argument {_0}")]
    Syntax(#[error(not(source))] usize),
    /// The command is required to reference `{{ item }}` but never does.
    #[display("command template never references {{{{ item }}}}")]
    MissingItem,
    /// An element could not be rendered for an item (usually an undefined
    /// variable or a positional parameter that was not supplied).
    #[display("cannot resolve argument {position} for item `{item}`")]
    Unresolved { position: usize, item: String },
    /// The program element rendered to an empty string.
    #[display("program resolved to an empty string for item `{_0}`")]
    EmptyProgram(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
