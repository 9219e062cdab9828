use crate::error::{ErrorKind, Result};
use crate::fingerprint::{Fingerprint, Fingerprinter};
use exn::{OptionExt, ResultExt};
use fanout_dispatch::{Dispatcher, FailureKind, RunReport, RunStatus};
use fanout_source::WorkItem;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::instrument;

#[derive(Clone, Debug, Default)]
pub struct DedupOptions {
    /// Report what would be removed without touching anything.
    pub dry_run: bool,
    /// Directory that holds the fingerprint index while the pass runs.
    /// Groups are then built from that index instead of from memory. The
    /// file is unlinked from the start, so it never shows up in the directory
    /// and never outlives the process.
    pub scratch_dir: Option<PathBuf>,
    /// Where to write the duplicate groups as JSON once the pass is done. The
    /// file is created before anything is fingerprinted or removed.
    pub manifest: Option<PathBuf>,
}

/// Items sharing one fingerprint, in enumeration order.
#[derive(Clone, Debug, Serialize)]
pub struct DuplicateGroup {
    pub fingerprint: Fingerprint,
    /// The first-enumerated member. Never removed.
    pub keeper: WorkItem,
    pub duplicates: Vec<WorkItem>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RemovalFailure {
    pub item: WorkItem,
    pub error: FailureKind,
}

#[derive(Debug)]
pub struct DedupReport {
    pub fingerprinting: RunReport<Fingerprint>,
    pub groups: Vec<DuplicateGroup>,
    pub removed: Vec<WorkItem>,
    pub removal_failures: Vec<RemovalFailure>,
    pub dry_run: bool,
    /// Set when the manifest could be created but not written. Removals have
    /// already happened by then, so the report is returned regardless.
    pub manifest_error: Option<String>,
}

impl DedupReport {
    /// Number of items selected for removal across all groups.
    pub fn duplicates(&self) -> usize {
        self.groups.iter().map(|g| g.duplicates.len()).sum()
    }

    pub fn success(&self) -> bool {
        self.fingerprinting.success() && self.removal_failures.is_empty() && self.manifest_error.is_none()
    }
}

impl Display for DedupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} groups, {} duplicates", self.groups.len(), self.duplicates())?;
        if self.dry_run {
            f.write_str(" (dry run, nothing removed)")?;
        } else {
            write!(f, ", {} removed", self.removed.len())?;
        }
        if !self.removal_failures.is_empty() {
            write!(f, ", {} could not be removed", self.removal_failures.len())?;
        }
        if self.fingerprinting.failed() > 0 {
            write!(f, ", {} could not be fingerprinted", self.fingerprinting.failed())?;
        }
        if self.manifest_error.is_some() {
            f.write_str(", manifest not written")?;
        }
        Ok(())
    }
}

/// Groups fingerprinted items, keeping only fingerprints shared by two or more
/// distinct items.
///
/// The keeper of each group is the member with the lowest enumeration index,
/// so the input order (which is usually completion order) does not matter.
/// Groups are returned ordered by their keeper. The same item listed twice is
/// counted once.
pub fn group_duplicates(fingerprints: impl IntoIterator<Item = (WorkItem, Fingerprint)>) -> Vec<DuplicateGroup> {
    let mut buckets: HashMap<Fingerprint, Vec<WorkItem>> = HashMap::new();
    for (item, fingerprint) in fingerprints {
        buckets.entry(fingerprint).or_default().push(item);
    }
    let mut groups: Vec<DuplicateGroup> = buckets
        .into_iter()
        .filter_map(|(fingerprint, mut members)| {
            members.sort_by_key(WorkItem::index);
            let mut seen = HashSet::new();
            members.retain(|m| seen.insert(m.value().to_string()));
            let mut members = members.into_iter();
            let keeper = members.next()?;
            let duplicates: Vec<WorkItem> = members.collect();
            (!duplicates.is_empty()).then_some(DuplicateGroup { fingerprint, keeper, duplicates })
        })
        .collect();
    groups.sort_by_key(|g| g.keeper.index());
    groups
}

/// An anonymous file holding one `fingerprint<TAB>position` line per
/// fingerprinted item. It has no name on disk and is released when dropped.
struct ScratchIndex {
    dir: PathBuf,
    file: File,
}

impl ScratchIndex {
    fn create(dir: &Path) -> Result<Self> {
        let file = tempfile::tempfile_in(dir).or_raise(|| ErrorKind::Scratch(dir.to_path_buf()))?;
        tracing::debug!(dir = %dir.display(), "Created scratch index");
        Ok(Self { dir: dir.to_path_buf(), file })
    }

    fn record<'a>(&mut self, fingerprints: impl Iterator<Item = &'a Fingerprint>) -> Result<()> {
        let scratch = || ErrorKind::Scratch(self.dir.clone());
        let mut writer = BufWriter::new(&self.file);
        for (position, fingerprint) in fingerprints.enumerate() {
            writeln!(writer, "{fingerprint}\t{position}").or_raise(scratch)?;
        }
        writer.flush().or_raise(scratch)
    }

    /// Reads the index back, pairing each line with `items[position]`.
    fn read_back(&mut self, items: &[&WorkItem]) -> Result<Vec<(WorkItem, Fingerprint)>> {
        let scratch = || ErrorKind::Scratch(self.dir.clone());
        self.file.rewind().or_raise(scratch)?;
        let mut entries = Vec::with_capacity(items.len());
        for line in BufReader::new(&self.file).lines() {
            let line = line.or_raise(scratch)?;
            let entry = line.split_once('\t').and_then(|(hex, position)| {
                let item = items.get(position.parse::<usize>().ok()?)?;
                Some(((*item).clone(), Fingerprint::from_hex(hex)?))
            });
            entries.push(entry.ok_or_raise(scratch)?);
        }
        Ok(entries)
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    generated_at: String,
    dry_run: bool,
    groups: &'a [DuplicateGroup],
    removed: &'a [WorkItem],
    removal_failures: &'a [RemovalFailure],
}

fn create_manifest(path: &Path) -> Result<File> {
    File::create(path).or_raise(|| ErrorKind::Manifest(path.to_path_buf()))
}

fn write_manifest(file: File, path: &Path, report: &DedupReport) -> Result<()> {
    let manifest_error = || ErrorKind::Manifest(path.to_path_buf());
    let manifest = Manifest {
        generated_at: OffsetDateTime::now_utc().format(&Rfc3339).or_raise(manifest_error)?,
        dry_run: report.dry_run,
        groups: &report.groups,
        removed: &report.removed,
        removal_failures: &report.removal_failures,
    };
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &manifest).or_raise(manifest_error)?;
    writer.flush().or_raise(manifest_error)
}

/// Whether two paths name the same file once symlinks and relative segments
/// are resolved.
async fn same_file(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Deletes every duplicate, one at a time, stopping early if the dispatcher's
/// run is cancelled.
async fn remove_duplicates(groups: &[DuplicateGroup], dispatcher: &Dispatcher) -> (Vec<WorkItem>, Vec<RemovalFailure>) {
    let mut removed = Vec::new();
    let mut failures = Vec::new();
    for group in groups {
        for duplicate in &group.duplicates {
            if dispatcher.cancellation().is_cancelled() {
                tracing::warn!("Cancelled; stopping removals");
                return (removed, failures);
            }
            if same_file(duplicate.as_path(), group.keeper.as_path()).await {
                tracing::warn!(item = %duplicate, keeper = %group.keeper, "Duplicate is the keeper itself; skipping");
                continue;
            }
            match tokio::fs::remove_file(duplicate.as_path()).await {
                Ok(()) => {
                    tracing::info!(item = %duplicate, keeper = %group.keeper, "Removed duplicate");
                    removed.push(duplicate.clone());
                },
                Err(e) => {
                    tracing::warn!(item = %duplicate, error = %e, "Could not remove duplicate");
                    failures.push(RemovalFailure {
                        item: duplicate.clone(),
                        error: FailureKind::RemovalFailure(format!("{duplicate}: {e}")),
                    });
                },
            }
        }
    }
    (removed, failures)
}

/// Removes every content duplicate among `items`, keeping the first of each
/// group in enumeration order.
///
/// Fingerprints are computed in parallel on `dispatcher`. An item whose
/// fingerprint could not be computed is never grouped and never removed.
/// Removal runs sequentially afterwards; a file that cannot be removed is
/// recorded and the pass carries on. When fingerprinting was cancelled nothing
/// is removed.
///
/// The scratch index and the manifest are both created before any work
/// starts, so failing to create either stops the pass with nothing removed.
#[instrument(skip_all, fields(items = items.len(), hasher = %fingerprinter, dry_run = options.dry_run))]
pub async fn dedup_content(
    items: &[WorkItem],
    fingerprinter: &Fingerprinter,
    dispatcher: &Dispatcher,
    options: &DedupOptions,
) -> Result<DedupReport> {
    let mut scratch = options.scratch_dir.as_deref().map(ScratchIndex::create).transpose()?;
    let manifest =
        options.manifest.as_deref().map(|path| create_manifest(path).map(|file| (file, path))).transpose()?;

    let fingerprinting = fingerprinter.fingerprint(items, dispatcher).await?;
    let groups = match scratch.as_mut() {
        Some(scratch) => {
            scratch.record(fingerprinting.outputs().map(|(_, fp)| fp))?;
            let fingerprinted: Vec<&WorkItem> = fingerprinting.outputs().map(|(item, _)| item).collect();
            group_duplicates(scratch.read_back(&fingerprinted)?)
        },
        None => group_duplicates(fingerprinting.outputs().map(|(item, fp)| (item.clone(), fp.clone()))),
    };
    tracing::info!(groups = groups.len(), failed = fingerprinting.failed(), "Fingerprinting finished");

    let cancelled = fingerprinting.status == RunStatus::Cancelled;
    if cancelled && !options.dry_run {
        tracing::warn!("Fingerprinting was cancelled; nothing will be removed");
    }
    let (removed, removal_failures) = if options.dry_run || cancelled {
        (Vec::new(), Vec::new())
    } else {
        remove_duplicates(&groups, dispatcher).await
    };

    let mut report = DedupReport {
        fingerprinting,
        groups,
        removed,
        removal_failures,
        dry_run: options.dry_run,
        manifest_error: None,
    };
    if let Some((file, path)) = manifest {
        match write_manifest(file, path, &report) {
            Ok(()) => tracing::info!(path = %path.display(), "Wrote manifest"),
            Err(e) => {
                tracing::error!(path = %path.display(), error = ?e, "Could not write manifest");
                report.manifest_error = Some(e.to_string());
            },
        }
    }
    drop(scratch);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_source::{Depth, EnumerateOptions, Source, enumerate};
    use rstest::rstest;
    use std::num::NonZeroUsize;
    use tempfile::TempDir;

    fn fingerprint(content: &str) -> Fingerprint {
        Fingerprint::from(blake3::hash(content.as_bytes()))
    }

    fn populate(files: &[(&str, &str)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    async fn items(dir: &Path) -> Vec<WorkItem> {
        let source = Source::Directory { root: dir.to_path_buf(), depth: Depth::Children };
        enumerate(&source, &EnumerateOptions::default()).await.unwrap()
    }

    fn remaining(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn dispatcher(k: usize) -> Dispatcher {
        Dispatcher::new(NonZeroUsize::new(k).unwrap())
    }

    #[rstest]
    #[case(vec![0, 1, 2])]
    #[case(vec![2, 1, 0])]
    #[case(vec![1, 2, 0])]
    fn test_keeper_is_first_enumerated(#[case] completion_order: Vec<usize>) {
        let all = [
            (WorkItem::new(0, "A"), fingerprint("same")),
            (WorkItem::new(1, "B"), fingerprint("other")),
            (WorkItem::new(2, "C"), fingerprint("same")),
        ];
        let groups = group_duplicates(completion_order.into_iter().map(|i| all[i].clone()));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].keeper.value(), "A");
        assert_eq!(groups[0].duplicates.iter().map(WorkItem::value).collect::<Vec<_>>(), vec!["C"]);
    }

    #[test]
    fn test_item_listed_twice_is_not_its_own_duplicate() {
        let groups = group_duplicates([
            (WorkItem::new(0, "A"), fingerprint("x")),
            (WorkItem::new(1, "A"), fingerprint("x")),
        ]);
        assert!(groups.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_two_identical_out_of_five() {
        let dir = populate(&[("a.txt", "one"), ("b.txt", "two"), ("c.txt", "three"), ("d.txt", "two"), ("e.txt", "five")]);
        let items = items(dir.path()).await;
        let report =
            dedup_content(&items, &Fingerprinter::Blake3, &dispatcher(3), &DedupOptions::default()).await.unwrap();
        assert!(report.success());
        assert_eq!(report.removed.len(), 1);
        assert!(report.removed[0].value().ends_with("d.txt"));
        assert_eq!(remaining(dir.path()), vec!["a.txt", "b.txt", "c.txt", "e.txt"]);
    }

    #[tokio::test]
    async fn test_second_run_removes_nothing() {
        let dir = populate(&[("a", "x"), ("b", "x"), ("c", "x"), ("d", "y"), ("e", "y")]);
        let first = dedup_content(&items(dir.path()).await, &Fingerprinter::Blake3, &dispatcher(2), &DedupOptions::default())
            .await
            .unwrap();
        assert_eq!(first.removed.len(), 3);
        assert_eq!(remaining(dir.path()), vec!["a", "d"]);

        let second = dedup_content(&items(dir.path()).await, &Fingerprinter::Blake3, &dispatcher(2), &DedupOptions::default())
            .await
            .unwrap();
        assert!(second.groups.is_empty());
        assert!(second.removed.is_empty());
        assert_eq!(remaining(dir.path()), vec!["a", "d"]);
    }

    #[tokio::test]
    async fn test_dry_run_removes_nothing() {
        let dir = populate(&[("a", "x"), ("b", "x")]);
        let options = DedupOptions { dry_run: true, ..Default::default() };
        let report = dedup_content(&items(dir.path()).await, &Fingerprinter::Blake3, &dispatcher(2), &options).await.unwrap();
        assert_eq!(report.duplicates(), 1);
        assert!(report.removed.is_empty());
        assert_eq!(remaining(dir.path()), vec!["a", "b"]);
        assert_eq!(report.to_string(), "1 groups, 1 duplicates (dry run, nothing removed)");
    }

    #[tokio::test]
    async fn test_unhashable_items_are_never_removed() {
        let dir = populate(&[("a", "x"), ("b", "x")]);
        let mut items = items(dir.path()).await;
        items.push(WorkItem::new(2, dir.path().join("gone").to_string_lossy()));
        let report = dedup_content(&items, &Fingerprinter::Blake3, &dispatcher(2), &DedupOptions::default()).await.unwrap();
        assert_eq!(report.fingerprinting.failed(), 1);
        assert_eq!(report.removed.len(), 1);
        assert!(!report.success());
    }

    #[tokio::test]
    async fn test_removal_failure_does_not_stop_the_pass() {
        let dir = populate(&[("a", "x"), ("c", "x")]);
        let path = |name: &str| dir.path().join(name).to_string_lossy().into_owned();
        let group = DuplicateGroup {
            fingerprint: fingerprint("x"),
            keeper: WorkItem::new(0, path("a")),
            duplicates: vec![WorkItem::new(1, path("vanished")), WorkItem::new(2, path("c"))],
        };
        let (removed, failures) = remove_duplicates(&[group], &dispatcher(1)).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].error, FailureKind::RemovalFailure(_)));
        assert_eq!(remaining(dir.path()), vec!["a"]);
    }

    #[tokio::test]
    async fn test_scratch_index_is_removed_after_success() {
        let dir = populate(&[("a", "x"), ("b", "x")]);
        let scratch = tempfile::tempdir().unwrap();
        let options = DedupOptions { scratch_dir: Some(scratch.path().to_path_buf()), ..Default::default() };
        dedup_content(&items(dir.path()).await, &Fingerprinter::Blake3, &dispatcher(2), &options).await.unwrap();
        assert!(remaining(scratch.path()).is_empty());
    }

    #[tokio::test]
    async fn test_unwritable_manifest_stops_the_pass_before_removal() {
        let dir = populate(&[("a", "x"), ("b", "x")]);
        let scratch = tempfile::tempdir().unwrap();
        let options = DedupOptions {
            scratch_dir: Some(scratch.path().to_path_buf()),
            manifest: Some(scratch.path().join("missing").join("manifest.json")),
            ..Default::default()
        };
        let err = dedup_content(&items(dir.path()).await, &Fingerprinter::Blake3, &dispatcher(2), &options)
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Manifest(_)));
        assert_eq!(remaining(dir.path()), vec!["a", "b"]);
        assert!(remaining(scratch.path()).is_empty());
    }

    #[test]
    fn test_scratch_index_has_no_name_and_reads_back() {
        let scratch = tempfile::tempdir().unwrap();
        let mut index = ScratchIndex::create(scratch.path()).unwrap();
        assert!(remaining(scratch.path()).is_empty());

        let a = WorkItem::new(0, "a");
        let b = WorkItem::new(7, "b");
        index.record([fingerprint("x"), fingerprint("y")].iter()).unwrap();
        let entries = index.read_back(&[&a, &b]).unwrap();
        assert_eq!(entries, vec![(a, fingerprint("x")), (b, fingerprint("y"))]);
        assert!(remaining(scratch.path()).is_empty());
    }

    #[tokio::test]
    async fn test_scratch_index_groups_like_memory() {
        let dir = populate(&[("a", "x"), ("b", "y"), ("c", "x"), ("d", "y"), ("e", "z")]);
        let scratch = tempfile::tempdir().unwrap();
        let items = items(dir.path()).await;
        let in_memory = DedupOptions { dry_run: true, ..Default::default() };
        let on_disk = DedupOptions { scratch_dir: Some(scratch.path().to_path_buf()), ..in_memory.clone() };

        let expected = dedup_content(&items, &Fingerprinter::Blake3, &dispatcher(2), &in_memory).await.unwrap();
        let actual = dedup_content(&items, &Fingerprinter::Blake3, &dispatcher(2), &on_disk).await.unwrap();
        let keepers = |r: &DedupReport| r.groups.iter().map(|g| g.keeper.index()).collect::<Vec<_>>();
        assert_eq!(keepers(&actual), keepers(&expected));
        assert_eq!(actual.duplicates(), 2);
    }

    #[tokio::test]
    async fn test_manifest() {
        let dir = populate(&[("a", "x"), ("b", "x"), ("c", "z")]);
        let out = tempfile::tempdir().unwrap();
        let manifest = out.path().join("manifest.json");
        let options = DedupOptions { dry_run: true, manifest: Some(manifest.clone()), ..Default::default() };
        dedup_content(&items(dir.path()).await, &Fingerprinter::Blake3, &dispatcher(1), &options).await.unwrap();

        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(manifest).unwrap()).unwrap();
        assert_eq!(json["dry_run"], true);
        assert_eq!(json["groups"].as_array().unwrap().len(), 1);
        assert_eq!(json["groups"][0]["fingerprint"], fingerprint("x").to_string());
        assert_eq!(json["groups"][0]["keeper"]["index"], 0);
        assert_eq!(json["groups"][0]["duplicates"][0]["index"], 1);
    }

    #[tokio::test]
    async fn test_external_hasher_agrees_with_blake3() {
        if which::which("sha256sum").is_err() {
            return;
        }
        let dir = populate(&[("a", "x"), ("b", "y"), ("c", "x")]);
        let hasher = Fingerprinter::select("sha256sum").unwrap();
        let report = dedup_content(&items(dir.path()).await, &hasher, &dispatcher(2), &DedupOptions::default()).await.unwrap();
        assert_eq!(report.removed.len(), 1);
        assert_eq!(remaining(dir.path()), vec!["a", "b"]);
    }
}
