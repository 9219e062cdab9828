use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::ResultExt;
use fanout_dispatch::{Dispatcher, FailureKind, JobContext, Outcome, RunReport, Task, TaskOutput};
use fanout_source::WorkItem;
use fanout_template::{CommandSpec, Invocation};
use serde::{Serialize, Serializer};
use std::fmt::{self, Display};
use std::fs::File;
use std::sync::Arc;

/// Hashing programs tried by [`ExternalHasher::discover`], most preferred
/// first. Each prints the digest as the first token of its output.
const KNOWN_HASHERS: &[&[&str]] = &[
    &["b3sum", "--", "{{ item }}"],
    &["sha256sum", "--", "{{ item }}"],
    &["shasum", "-a", "256", "--", "{{ item }}"],
    &["md5sum", "--", "{{ item }}"],
];

/// A content digest. Only ever compared for equality and rendered as
/// lowercase hex.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(Box<[u8]>);

impl Fingerprint {
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.is_empty() || hex.len() % 2 != 0 || !hex.is_ascii() {
            return None;
        }
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
            .collect::<Option<Box<[u8]>>>()
            .map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<blake3::Hash> for Fingerprint {
    fn from(hash: blake3::Hash) -> Self {
        Self(Box::from(hash.as_bytes().as_slice()))
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Extracts the digest from the output of a `*sum`-style program: the first
/// whitespace-separated token, as hex.
///
/// GNU tools prefix the line with `\` when the file name needed escaping.
pub fn parse_digest(output: &str) -> Option<Fingerprint> {
    let token = output.split_whitespace().next()?;
    Fingerprint::from_hex(token.strip_prefix('\\').unwrap_or(token))
}

/// Hashes file contents in-process with BLAKE3, on the blocking thread pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct Blake3Task;

#[async_trait]
impl Task for Blake3Task {
    type Job = WorkItem;
    type Output = Fingerprint;

    async fn run(&self, job: &WorkItem, _ctx: &JobContext) -> TaskOutput<Fingerprint> {
        let path = job.as_path().to_path_buf();
        crate::offload(job, move |_| {
            let mut hasher = blake3::Hasher::new();
            hasher.update_reader(File::open(&path)?)?;
            Ok(hasher.finalize().into())
        })
        .await
    }
}

/// Splits a command line on whitespace, keeping every `{{ ... }}` expression
/// inside a single argument.
fn split_command_line(line: &str) -> Vec<String> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_expression = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if !in_expression && chars.peek() == Some(&'{') => {
                chars.next();
                in_expression = true;
                current.push_str("{{");
            },
            '}' if in_expression && chars.peek() == Some(&'}') => {
                chars.next();
                in_expression = false;
                current.push_str("}}");
            },
            c if c.is_whitespace() && !in_expression => {
                if !current.is_empty() {
                    argv.push(std::mem::take(&mut current));
                }
            },
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        argv.push(current);
    }
    argv
}

/// A hashing program run once per file.
#[derive(Debug)]
pub struct ExternalHasher {
    spec: CommandSpec,
}

impl ExternalHasher {
    /// The command must reference `{{ item }}`.
    pub fn new(spec: CommandSpec) -> Result<Self> {
        let spec = spec.require_item().or_raise(|| ErrorKind::Hasher)?;
        Ok(Self { spec })
    }

    /// Builds a hasher from a command line such as `sha1sum` or
    /// `openssl dgst -r {{ item }}`. The item is appended when the command
    /// does not place it itself.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut argv = split_command_line(line);
        let spec = CommandSpec::new(argv.clone()).or_raise(|| ErrorKind::Hasher)?;
        if spec.references_item() {
            return Self::new(spec);
        }
        argv.push("{{ item }}".to_string());
        Self::new(CommandSpec::new(argv).or_raise(|| ErrorKind::Hasher)?)
    }

    /// Picks the first well-known hashing program present on `PATH`.
    pub fn discover() -> Result<Self> {
        for argv in KNOWN_HASHERS {
            match which::which(argv[0]) {
                Ok(path) => {
                    tracing::debug!(program = %path.display(), "Discovered hashing program");
                    return Self::new(CommandSpec::new(argv.iter().copied()).or_raise(|| ErrorKind::Hasher)?);
                },
                Err(_) => tracing::trace!(program = argv[0], "Hashing program not found"),
            }
        }
        exn::bail!(ErrorKind::NoHasher)
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }
}

/// Runs one [`Invocation`] of an external hasher and parses its output.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExternalTask;

#[async_trait]
impl Task for ExternalTask {
    type Job = Invocation;
    type Output = Fingerprint;

    async fn run(&self, job: &Invocation, ctx: &JobContext) -> TaskOutput<Fingerprint> {
        let TaskOutput { outcome, exit_code, stdout, stderr, .. } = fanout_dispatch::execute(job, ctx.output_limit).await;
        let mut result = TaskOutput { outcome, exit_code, stdout, stderr, output: None };
        if result.outcome.is_success() {
            let digest = parse_digest(&result.stdout.lossy());
            match digest {
                Some(digest) => result.output = Some(digest),
                None => {
                    let detail = format!("`{}` printed no digest", job.program());
                    result.outcome = Outcome::Failed(FailureKind::MalformedOutput(detail));
                },
            }
        }
        result
    }
}

/// How file contents are turned into [`Fingerprint`]s.
#[derive(Debug)]
pub enum Fingerprinter {
    Blake3,
    External(ExternalHasher),
}

impl Fingerprinter {
    /// Resolves a hasher setting: `blake3`, `auto` (an external program if one
    /// is installed, BLAKE3 otherwise) or a command line.
    pub fn select(name: &str) -> Result<Self> {
        match name.trim() {
            "" | "blake3" => Ok(Self::Blake3),
            "auto" => match ExternalHasher::discover() {
                Ok(hasher) => Ok(Self::External(hasher)),
                Err(e) if matches!(&*e, ErrorKind::NoHasher) => Ok(Self::Blake3),
                Err(e) => Err(e),
            },
            line => ExternalHasher::from_command_line(line).map(Self::External),
        }
    }

    /// Fingerprints every item. Items that cannot be hashed end up in the
    /// report's failures.
    pub async fn fingerprint(&self, items: &[WorkItem], dispatcher: &Dispatcher) -> Result<RunReport<Fingerprint>> {
        match self {
            Self::Blake3 => Ok(dispatcher.run(items.to_vec(), Arc::new(Blake3Task)).await),
            Self::External(hasher) => {
                let jobs = hasher.spec.resolve_all(items).or_raise(|| ErrorKind::Hasher)?;
                Ok(dispatcher.run(jobs, Arc::new(ExternalTask)).await)
            },
        }
    }
}

impl Display for Fingerprinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blake3 => f.write_str("blake3"),
            Self::External(hasher) => f.write_str(&hasher.spec.raw().join(" ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::num::NonZeroUsize;

    #[rstest]
    #[case("d41d8cd98f00b204e9800998ecf8427e  empty.txt", Some("d41d8cd98f00b204e9800998ecf8427e"))]
    #[case("\\0a1b  weird\\nname", Some("0a1b"))]
    #[case("ABCD\n", Some("abcd"))]
    #[case("", None)]
    #[case("   \n", None)]
    #[case("xyz  file", None)]
    #[case("abc  odd-length", None)]
    fn test_parse_digest(#[case] output: &str, #[case] expected: Option<&str>) {
        assert_eq!(parse_digest(output).map(|d| d.to_string()).as_deref(), expected);
    }

    #[test]
    fn test_blake3_hex() {
        let fingerprint = Fingerprint::from(blake3::hash(b"hello"));
        assert_eq!(fingerprint.to_string(), blake3::hash(b"hello").to_hex().as_str());
        assert_eq!(Fingerprint::from_hex(&fingerprint.to_string()), Some(fingerprint));
    }

    #[rstest]
    #[case("sha1sum", "sha1sum {{ item }}")]
    #[case("openssl dgst -r {{ item }}", "openssl dgst -r {{ item }}")]
    #[case("sha256sum {{item}}", "sha256sum {{item}}")]
    #[case("  sha256sum  --  {{ item }} ", "sha256sum -- {{ item }}")]
    #[case("blake3", "blake3")]
    fn test_select(#[case] setting: &str, #[case] expected: &str) {
        assert_eq!(Fingerprinter::select(setting).unwrap().to_string(), expected);
    }

    #[rstest]
    #[case("openssl dgst -r {{ item }}", &["openssl", "dgst", "-r", "{{ item }}"])]
    #[case("xxhsum {{ item|name }}", &["xxhsum", "{{ item|name }}"])]
    #[case("sum {{ with_ext(item, \"gz\") }}", &["sum", "{{ with_ext(item, \"gz\") }}"])]
    #[case("cat {{ item }}.sha256", &["cat", "{{ item }}.sha256"])]
    #[case("cmd {{ args.0 }}:{{ item }}", &["cmd", "{{ args.0 }}:{{ item }}"])]
    #[case("\t sha1sum\n", &["sha1sum"])]
    #[case("", &[])]
    fn test_split_command_line(#[case] line: &str, #[case] expected: &[&str]) {
        assert_eq!(split_command_line(line), expected);
    }

    #[test]
    fn test_unterminated_expression_is_a_hasher_error() {
        let err = Fingerprinter::select("sha256sum {{ item").unwrap_err();
        assert!(matches!(&*err, ErrorKind::Hasher));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_line_hasher_places_the_item() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fakesum");
        std::fs::write(&script, "#!/bin/sh\n[ -f \"$1\" ] && printf '0a1b  %s\\n' \"$1\"\n").unwrap();
        let path = dir.path().join("a b.txt");
        std::fs::write(&path, b"hello").unwrap();

        let hasher = Fingerprinter::select(&format!("sh {} {{{{ item }}}}", script.display())).unwrap();
        let items = vec![WorkItem::new(0, path.to_string_lossy())];
        let report = hasher.fingerprint(&items, &Dispatcher::new(NonZeroUsize::MIN)).await.unwrap();
        let outputs: Vec<_> = report.outputs().map(|(_, fp)| fp.to_string()).collect();
        assert_eq!(outputs, ["0a1b"]);
    }

    #[tokio::test]
    async fn test_blake3_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let items = vec![
            WorkItem::new(0, path.to_string_lossy()),
            WorkItem::new(1, dir.path().join("missing").to_string_lossy()),
        ];
        let report = Fingerprinter::Blake3.fingerprint(&items, &Dispatcher::new(NonZeroUsize::MIN)).await.unwrap();
        let outputs: Vec<_> = report.outputs().map(|(_, fp)| fp.clone()).collect();
        assert_eq!(outputs, vec![Fingerprint::from(blake3::hash(b"hello"))]);
        assert!(matches!(report.failures[0].outcome, Outcome::Failed(FailureKind::Io(_))));
    }

    #[tokio::test]
    async fn test_external_hasher_output_must_contain_a_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let spec = CommandSpec::new(["sh", "-c", "echo not-a-digest", "{{ item }}"]).unwrap();
        let hasher = Fingerprinter::External(ExternalHasher::new(spec).unwrap());
        let items = vec![WorkItem::new(0, path.to_string_lossy())];
        let report = hasher.fingerprint(&items, &Dispatcher::new(NonZeroUsize::MIN)).await.unwrap();
        assert_eq!(report.failed(), 1);
        assert!(matches!(report.failures[0].outcome, Outcome::Failed(FailureKind::MalformedOutput(_))));
    }

    #[test]
    fn test_external_hasher_needs_item() {
        let spec = CommandSpec::new(["sha256sum"]).unwrap();
        assert!(matches!(&*ExternalHasher::new(spec).unwrap_err(), ErrorKind::Hasher));
    }
}
