//! Content-based deduplication.
//!
//! Files are fingerprinted in parallel on a [`Dispatcher`], grouped by
//! fingerprint, and every group is reduced to its first-enumerated member.
//! Grouping and removal happen on a single task once every fingerprint is
//! known, so the result never depends on which hash finished first.
//!
//! [`dedup_sorted_lines`] is the other, much simpler, flavour: it removes
//! adjacent duplicate lines from already-sorted text files, one file per job.
//!
//! [`Dispatcher`]: fanout_dispatch::Dispatcher

mod content;
pub mod error;
mod fingerprint;
mod lines;

pub use crate::content::{DedupOptions, DedupReport, DuplicateGroup, RemovalFailure, dedup_content, group_duplicates};
pub use crate::fingerprint::{Blake3Task, ExternalHasher, ExternalTask, Fingerprint, Fingerprinter, parse_digest};
pub use crate::lines::{UniqTask, dedup_sorted_lines, squeeze};

use fanout_dispatch::{FailureKind, TaskOutput};
use fanout_source::WorkItem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Raised on drop. A blocking job keeps running after its future is dropped
/// by a timeout or cancellation, so it reads this flag before committing any
/// side effect.
struct Abandon(Arc<AtomicBool>);

impl Drop for Abandon {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Runs blocking file work off the async runtime, turning I/O errors into
/// per-item failures.
///
/// `work` receives a flag that becomes `true` once nobody is waiting for its
/// result any more.
pub(crate) async fn offload<T, F>(item: &WorkItem, work: F) -> TaskOutput<T>
where
    T: Send + 'static,
    F: FnOnce(&AtomicBool) -> std::io::Result<T> + Send + 'static,
{
    let abandoned = Arc::new(AtomicBool::new(false));
    let _guard = Abandon(Arc::clone(&abandoned));
    match tokio::task::spawn_blocking(move || work(&abandoned)).await {
        Ok(Ok(output)) => TaskOutput::success(output),
        Ok(Err(e)) => TaskOutput::failed(FailureKind::Io(format!("{item}: {e}"))),
        Err(e) => TaskOutput::failed(FailureKind::Panicked(e.to_string())),
    }
}
