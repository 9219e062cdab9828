//! Directory enumeration.
//!
//! Walks a directory depth-first, pre-order, with entries sorted by file name
//! inside each directory so that the resulting sequence is stable across runs
//! and platforms. Depth is counted from the root: immediate children are at
//! depth 1.

use crate::error::{ErrorKind, Result};
use crate::{Depth, EnumerateOptions};
use async_stream::stream;
use exn::ResultExt;
use futures::Stream;
use std::path::{Path, PathBuf};
use tokio::fs;

/// A filesystem entry selected for enumeration.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) path: PathBuf,
    pub(crate) size: Option<u64>,
}

enum Node {
    /// A directory whose entries still need to be read.
    Read { path: PathBuf, depth: usize },
    /// An entry that has been listed but not yet classified.
    Visit { path: PathBuf, depth: usize },
}

enum Visited {
    File(Entry),
    Directory { entry: Entry, descend: bool },
    Skip,
}

fn is_hidden(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with('.'))
}

/// Streams the entries under `root` according to `depth` and `options`.
///
/// Failing to read the root directory itself yields a single
/// [`SourceUnavailable`](ErrorKind::SourceUnavailable) error and ends the
/// stream. Anything unreadable deeper in the tree is logged and skipped.
pub(crate) fn walk<'a>(
    root: &'a Path,
    depth: Depth,
    options: &'a EnumerateOptions,
) -> impl Stream<Item = Result<Entry>> + 'a {
    let max_depth = depth.max();
    stream!({
        match fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {},
            Ok(_) => {
                yield Err(exn::Exn::from(ErrorKind::SourceUnavailable(format!(
                    "{} is not a directory",
                    root.display()
                ))));
                return;
            },
            Err(e) => {
                yield Err::<Entry, _>(e).or_raise(|| ErrorKind::SourceUnavailable(root.display().to_string()));
                return;
            },
        }

        let mut stack = vec![Node::Read { path: root.to_path_buf(), depth: 0 }];
        while let Some(node) = stack.pop() {
            match node {
                Node::Read { path, depth } => match read_sorted(&path).await {
                    Ok(children) => {
                        // Reversed so that popping yields them in name order.
                        stack.extend(children.into_iter().rev().map(|path| Node::Visit { path, depth: depth + 1 }));
                    },
                    Err(e) if depth == 0 => {
                        yield Err(e);
                        return;
                    },
                    Err(e) => tracing::warn!(path = %path.display(), error = ?e, "Skipping unreadable directory"),
                },
                Node::Visit { path, depth } => match visit(path, depth, max_depth, options).await {
                    Visited::File(entry) => yield Ok(entry),
                    Visited::Directory { entry, descend } => {
                        if descend {
                            stack.push(Node::Read { path: entry.path.clone(), depth });
                        }
                        if options.include_dirs {
                            yield Ok(entry);
                        }
                    },
                    Visited::Skip => {},
                },
            }
        }
    })
}

async fn read_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let unavailable = || ErrorKind::SourceUnavailable(dir.display().to_string());
    let mut entries = fs::read_dir(dir).await.or_raise(unavailable)?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.or_raise(unavailable)? {
        paths.push(entry.path());
    }
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths)
}

async fn visit(path: PathBuf, depth: usize, max_depth: Option<usize>, options: &EnumerateOptions) -> Visited {
    if !options.include_hidden && is_hidden(&path) {
        return Visited::Skip;
    }
    let link = match fs::symlink_metadata(&path).await {
        Ok(meta) => meta.file_type().is_symlink(),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Entry vanished during enumeration");
            return Visited::Skip;
        },
    };
    // Symlinks are followed for classification but never descended into.
    let meta = match fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Skipping broken symlink");
            return Visited::Skip;
        },
    };
    if meta.is_file() {
        return Visited::File(Entry { path, size: Some(meta.len()) });
    }
    if meta.is_dir() {
        let descend = !link && max_depth.is_none_or(|max| depth < max);
        return Visited::Directory { entry: Entry { path, size: None }, descend };
    }
    Visited::Skip
}
