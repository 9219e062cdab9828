//! Binary Error Types
//!
//! Anything that surfaces here stops the command before (or instead of)
//! dispatching work, and maps to exit status 2.

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not enumerate work items")]
    Source,
    #[display("invalid command template")]
    Template,
    #[display("could not set up the hasher")]
    Hasher,
    #[display("deduplication failed")]
    Dedup,
}
