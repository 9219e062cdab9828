use serde::Serialize;
use std::fmt::{self, Display};
use std::path::Path;

/// A single unit of input, processed independently of every other item.
///
/// The `value` is opaque to the dispatcher: a path, a hostname, a URL. The
/// `index` records the position the item was enumerated at, and is the only
/// ordering that report normalization and duplicate retention ever use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WorkItem {
    index: usize,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
}

impl WorkItem {
    pub fn new(index: usize, value: impl Into<String>) -> Self {
        Self { index, value: value.into(), size: None }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Position of this item in enumeration order.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Size in bytes, when the enumerator had file metadata at hand.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Interprets the item value as a filesystem path.
    pub fn as_path(&self) -> &Path {
        Path::new(&self.value)
    }
}

impl Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl AsRef<Path> for WorkItem {
    fn as_ref(&self) -> &Path {
        self.as_path()
    }
}
