use async_trait::async_trait;
use fanout_dispatch::{Dispatcher, JobContext, RunReport, Task, TaskOutput};
use fanout_source::WorkItem;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::NamedTempFile;
use tracing::instrument;

/// Drops every line equal to the line before it. Returns the remaining text
/// and how many lines were dropped.
///
/// Only adjacent lines are compared, so the input is expected to be sorted. A
/// final line without a trailing newline still equals the same line with one.
pub fn squeeze(text: &[u8]) -> (Vec<u8>, usize) {
    let mut output = Vec::with_capacity(text.len());
    let mut previous: Option<&[u8]> = None;
    let mut dropped = 0;
    for line in text.split_inclusive(|&b| b == b'\n') {
        let content = line.strip_suffix(b"\n").unwrap_or(line);
        if previous == Some(content) {
            dropped += 1;
            continue;
        }
        output.extend_from_slice(line);
        previous = Some(content);
    }
    (output, dropped)
}

/// Rewrites the file only if something was dropped. The new content goes to a
/// temporary file next to the original which then replaces it, so a reader
/// never sees a half-written file.
///
/// Once `abandoned` is set the rewrite is discarded instead of replacing the
/// original. The flag is read right before the rename.
fn squeeze_file(path: &Path, abandoned: &AtomicBool) -> std::io::Result<usize> {
    let text = std::fs::read(path)?;
    let (output, dropped) = squeeze(&text);
    if dropped == 0 {
        return Ok(0);
    }
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&output)?;
    tmp.as_file().set_permissions(std::fs::metadata(path)?.permissions())?;
    tmp.as_file().sync_all()?;
    if abandoned.load(Ordering::Acquire) {
        return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "rewrite abandoned"));
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(dropped)
}

/// Removes adjacent duplicate lines from one sorted text file. The output is
/// the number of lines removed.
#[derive(Clone, Copy, Debug, Default)]
pub struct UniqTask;

#[async_trait]
impl Task for UniqTask {
    type Job = WorkItem;
    type Output = usize;

    async fn run(&self, job: &WorkItem, _ctx: &JobContext) -> TaskOutput<usize> {
        let path = job.as_path().to_path_buf();
        crate::offload(job, move |abandoned| squeeze_file(&path, abandoned)).await
    }
}

/// Runs [`UniqTask`] over every item. Files are handled independently; lines
/// are never compared across files.
#[instrument(skip_all, fields(items = items.len()))]
pub async fn dedup_sorted_lines(items: &[WorkItem], dispatcher: &Dispatcher) -> RunReport<usize> {
    dispatcher.run(items.to_vec(), Arc::new(UniqTask)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::num::NonZeroUsize;

    #[rstest]
    #[case("a\na\nb\nc\nc\nc\n", "a\nb\nc\n", 3)]
    #[case("a\nb\na\n", "a\nb\na\n", 0)]
    #[case("x\nx", "x\n", 1)]
    #[case("", "", 0)]
    #[case("\n\n\nq\n", "\nq\n", 2)]
    #[case("same\r\nsame\r\n", "same\r\n", 1)]
    fn test_squeeze(#[case] input: &str, #[case] expected: &str, #[case] dropped: usize) {
        let (output, count) = squeeze(input.as_bytes());
        assert_eq!(String::from_utf8(output).unwrap(), expected);
        assert_eq!(count, dropped);
    }

    #[tokio::test]
    async fn test_files_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.txt");
        let second = dir.path().join("second.txt");
        std::fs::write(&first, "apple\napple\nbanana\n").unwrap();
        std::fs::write(&second, "banana\ncherry\n").unwrap();
        let items = vec![WorkItem::new(0, first.to_string_lossy()), WorkItem::new(1, second.to_string_lossy())];

        let report = dedup_sorted_lines(&items, &Dispatcher::new(NonZeroUsize::new(2).unwrap())).await;
        assert!(report.success());
        let counts: Vec<usize> = report.outputs().map(|(_, n)| *n).collect();
        assert_eq!(counts, vec![1, 0]);
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "apple\nbanana\n");
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "banana\ncherry\n");
        // No temporary files left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_abandoned_rewrite_leaves_the_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sorted.txt");
        std::fs::write(&path, "a\na\nb\n").unwrap();

        let err = squeeze_file(&path, &AtomicBool::new(true)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\na\nb\n");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        assert_eq!(squeeze_file(&path, &AtomicBool::new(false)).unwrap(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }

    #[tokio::test]
    async fn test_missing_file_is_an_io_failure() {
        let items = vec![WorkItem::new(0, "/nonexistent/fanout/lines.txt")];
        let report = dedup_sorted_lines(&items, &Dispatcher::new(NonZeroUsize::MIN)).await;
        assert_eq!(report.failed(), 1);
        assert!(matches!(report.failures[0].outcome.failure(), Some(fanout_dispatch::FailureKind::Io(_))));
    }
}
