use derive_more::Display;
use fanout_source::WorkItem;
use serde::Serialize;
use std::borrow::Cow;
use std::time::Duration;

/// Why a single job failed. None of these abort the run.
#[derive(Clone, Debug, Display, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureKind {
    /// The program could not be found or started.
    #[display("launch failure: {_0}")]
    LaunchFailure(String),
    /// The program ran and reported failure. `None` means it was killed by a
    /// signal.
    #[display("{}", describe_exit(*_0))]
    NonZeroExit(Option<i32>),
    /// The job did not finish within the configured timeout and was stopped.
    #[display("timed out after {_0:?}")]
    Timeout(Duration),
    /// A duplicate selected for removal could not be deleted.
    #[display("removal failure: {_0}")]
    RemovalFailure(String),
    /// An in-process job could not read or write its file.
    #[display("I/O error: {_0}")]
    Io(String),
    /// The program succeeded but its output could not be interpreted.
    #[display("malformed output: {_0}")]
    MalformedOutput(String),
    /// The job panicked. The worker that ran it carries on.
    #[display("job panicked: {_0}")]
    Panicked(String),
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {code}"),
        None => "terminated by signal".to_string(),
    }
}

#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum Outcome {
    #[display("ok")]
    Success,
    #[display("{_0}")]
    Failed(FailureKind),
    /// Stopped by cancellation before it could finish.
    #[display("cancelled")]
    Cancelled,
}
impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn failure(&self) -> Option<&FailureKind> {
        match self {
            Self::Failed(kind) => Some(kind),
            _ => None,
        }
    }
}

/// Output captured from one stream of a child process, capped in size.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// More output was produced than was kept.
    pub truncated: bool,
}
impl Captured {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// What a [`Task`](crate::Task) hands back for one job.
#[derive(Debug)]
pub struct TaskOutput<O> {
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub stdout: Captured,
    pub stderr: Captured,
    pub output: Option<O>,
}
impl<O> TaskOutput<O> {
    pub fn success(output: O) -> Self {
        Self {
            outcome: Outcome::Success,
            exit_code: None,
            stdout: Captured::default(),
            stderr: Captured::default(),
            output: Some(output),
        }
    }

    pub fn failed(kind: FailureKind) -> Self {
        Self::from_outcome(Outcome::Failed(kind))
    }

    pub fn cancelled() -> Self {
        Self::from_outcome(Outcome::Cancelled)
    }

    fn from_outcome(outcome: Outcome) -> Self {
        Self { outcome, exit_code: None, stdout: Captured::default(), stderr: Captured::default(), output: None }
    }

    /// Swaps the payload while keeping status and captured output, e.g. to
    /// turn a finished process into a parsed digest.
    pub fn map<P>(self, f: impl FnOnce(O) -> P) -> TaskOutput<P> {
        TaskOutput {
            outcome: self.outcome,
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
            output: self.output.map(f),
        }
    }
}

/// The record of one completed job. Immutable once created.
#[derive(Debug)]
pub struct JobResult<O = ()> {
    pub item: WorkItem,
    /// Worker slot (`0..K`) that ran the job.
    pub slot: usize,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub stdout: Captured,
    pub stderr: Captured,
    pub duration: Duration,
    pub output: Option<O>,
}
impl<O> JobResult<O> {
    pub(crate) fn new(item: WorkItem, slot: usize, output: TaskOutput<O>, duration: Duration) -> Self {
        Self {
            item,
            slot,
            outcome: output.outcome,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration,
            output: output.output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(FailureKind::NonZeroExit(Some(2)), "exited with code 2")]
    #[case(FailureKind::NonZeroExit(None), "terminated by signal")]
    #[case(FailureKind::LaunchFailure("nope: not found".into()), "launch failure: nope: not found")]
    #[case(FailureKind::Timeout(Duration::from_millis(1500)), "timed out after 1.5s")]
    fn test_failure_display(#[case] kind: FailureKind, #[case] expected: &str) {
        assert_eq!(kind.to_string(), expected);
    }

    #[test]
    fn test_map_keeps_status() {
        let mut output = TaskOutput::success("deadbeef");
        output.exit_code = Some(0);
        let mapped = output.map(str::len);
        assert!(mapped.outcome.is_success());
        assert_eq!(mapped.exit_code, Some(0));
        assert_eq!(mapped.output, Some(8));
    }
}
