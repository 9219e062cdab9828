//! Work item enumeration.
//!
//! Turns a source descriptor into a finite, order-stable sequence of
//! [`WorkItem`]s:
//!
//! - **Directories** are walked either one level deep ([`Depth::Children`]),
//!   fully ([`Depth::Recursive`]), or to an explicit depth
//!   ([`Depth::Limit`]). Entries are sorted by name within each directory.
//! - **Glob patterns** are matched with the [`glob`] crate, which yields paths
//!   in alphabetical order.
//! - **Line lists** (a file, or stdin) yield one item per non-blank line, in
//!   the order they appear.
//!
//! An empty match is an empty sequence, never an error. A source that cannot
//! be read at all is [`SourceUnavailable`](error::ErrorKind::SourceUnavailable).

pub mod error;
mod item;
mod walk;

pub use crate::item::WorkItem;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use futures::StreamExt;
use std::fmt::{self, Display};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::instrument;

/// How far below a root directory enumeration is allowed to go.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Depth {
    /// Immediate children of the root only.
    #[default]
    Children,
    /// The whole tree.
    Recursive,
    /// At most this many levels below the root (`1` is the same as
    /// [`Children`](Self::Children)).
    Limit(NonZeroUsize),
}
impl Depth {
    pub(crate) fn max(self) -> Option<usize> {
        match self {
            Self::Children => Some(1),
            Self::Recursive => None,
            Self::Limit(n) => Some(n.get()),
        }
    }
}

/// Where work items come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Directory { root: PathBuf, depth: Depth },
    Glob(String),
    Lines(PathBuf),
    Stdin,
}

impl Source {
    /// Interprets a command-line source descriptor.
    ///
    /// | Descriptor      | Source                  |
    /// |-----------------|-------------------------|
    /// | `-`             | [`Source::Stdin`]       |
    /// | `@hosts.txt`    | [`Source::Lines`]       |
    /// | `photos/*.jpg`  | [`Source::Glob`]        |
    /// | anything else   | [`Source::Directory`]   |
    ///
    /// A descriptor naming an existing directory is always a directory, even
    /// when it contains `*`, `?` or `[`.
    pub fn parse(descriptor: &str, depth: Depth) -> Self {
        if descriptor == "-" {
            return Self::Stdin;
        }
        if let Some(path) = descriptor.strip_prefix('@') {
            return Self::Lines(PathBuf::from(path));
        }
        if descriptor.contains(['*', '?', '[']) && !Path::new(descriptor).is_dir() {
            return Self::Glob(descriptor.to_string());
        }
        Self::Directory { root: PathBuf::from(descriptor), depth }
    }
}

impl Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory { root, depth: Depth::Children } => write!(f, "directory {}", root.display()),
            Self::Directory { root, depth: Depth::Recursive } => write!(f, "directory {} (recursive)", root.display()),
            Self::Directory { root, depth: Depth::Limit(n) } => write!(f, "directory {} (depth {n})", root.display()),
            Self::Glob(pattern) => write!(f, "glob {pattern}"),
            Self::Lines(path) => write!(f, "list {}", path.display()),
            Self::Stdin => f.write_str("stdin"),
        }
    }
}

/// Filters applied to filesystem sources. Line sources ignore them.
#[derive(Clone, Debug)]
pub struct EnumerateOptions {
    /// Emit directories as items as well as files.
    pub include_dirs: bool,
    /// Emit entries whose name starts with a dot.
    pub include_hidden: bool,
}
impl Default for EnumerateOptions {
    fn default() -> Self {
        Self { include_dirs: false, include_hidden: true }
    }
}

/// Enumerates every item in `source`, assigning indices in enumeration order.
#[instrument(skip_all, fields(%source))]
pub async fn enumerate(source: &Source, options: &EnumerateOptions) -> Result<Vec<WorkItem>> {
    let items = match source {
        Source::Directory { root, depth } => enumerate_directory(root, *depth, options).await?,
        Source::Glob(pattern) => enumerate_glob(pattern, options)?,
        Source::Lines(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .or_raise(|| ErrorKind::SourceUnavailable(path.display().to_string()))?;
            read_lines(file, &path.display().to_string()).await?
        },
        Source::Stdin => read_lines(tokio::io::stdin(), "stdin").await?,
    };
    tracing::debug!(count = items.len(), "Enumeration complete");
    Ok(items)
}

async fn enumerate_directory(root: &Path, depth: Depth, options: &EnumerateOptions) -> Result<Vec<WorkItem>> {
    let mut entries = std::pin::pin!(walk::walk(root, depth, options));
    let mut items = Vec::new();
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        let item = WorkItem::new(items.len(), entry.path.to_string_lossy());
        items.push(match entry.size {
            Some(size) => item.with_size(size),
            None => item,
        });
    }
    Ok(items)
}

fn enumerate_glob(pattern: &str, options: &EnumerateOptions) -> Result<Vec<WorkItem>> {
    let match_options = glob::MatchOptions {
        require_literal_leading_dot: !options.include_hidden,
        ..glob::MatchOptions::new()
    };
    let paths = glob::glob_with(pattern, match_options).or_raise(|| ErrorKind::SourceUnavailable(pattern.to_string()))?;
    let mut items = Vec::new();
    for path in paths {
        let path = match path {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(path = %e.path().display(), error = %e.error(), "Skipping unreadable glob match");
                continue;
            },
        };
        let Ok(meta) = std::fs::metadata(&path) else {
            continue;
        };
        if meta.is_dir() && !options.include_dirs {
            continue;
        }
        let item = WorkItem::new(items.len(), path.to_string_lossy());
        items.push(if meta.is_file() { item.with_size(meta.len()) } else { item });
    }
    Ok(items)
}

async fn read_lines<R: AsyncRead + Unpin>(reader: R, name: &str) -> Result<Vec<WorkItem>> {
    let mut lines = BufReader::new(reader).lines();
    let mut items = Vec::new();
    while let Some(line) = lines.next_line().await.or_raise(|| ErrorKind::SourceUnavailable(name.to_string()))? {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        items.push(WorkItem::new(items.len(), line));
    }
    Ok(items)
}
