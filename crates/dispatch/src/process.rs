//! Child process execution for a single [`Invocation`].

use crate::outcome::{Captured, FailureKind, Outcome, TaskOutput};
use fanout_template::Invocation;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

const CHUNK: usize = 8192;

/// Finds the program on `PATH` (relative to the invocation's working
/// directory, if it has one).
fn locate(invocation: &Invocation) -> Result<PathBuf, which::Error> {
    match invocation.cwd() {
        Some(cwd) => which::which_in(invocation.program(), std::env::var_os("PATH"), cwd),
        None => which::which(invocation.program()),
    }
}

/// Keeps at most `limit` bytes, but always drains the pipe so that a chatty
/// child can never block on a full pipe buffer.
async fn capture<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> Captured {
    let Some(mut reader) = reader else {
        return Captured::default();
    };
    let mut captured = Captured::default();
    let mut buffer = [0u8; CHUNK];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.bytes.len());
                if n > room {
                    captured.truncated = true;
                }
                captured.bytes.extend_from_slice(&buffer[..n.min(room)]);
            },
            Err(e) => {
                tracing::debug!(error = %e, "Output pipe closed with error");
                break;
            },
        }
    }
    captured
}

/// Runs the invocation to completion, capturing bounded stdout and stderr.
///
/// Stdin is closed. The child is killed if the returned future is dropped
/// before it resolves, which is how timeouts and cancellation stop it.
pub async fn execute(invocation: &Invocation, output_limit: usize) -> TaskOutput<()> {
    let program = match locate(invocation) {
        Ok(program) => program,
        Err(e) => {
            return TaskOutput::failed(FailureKind::LaunchFailure(format!("{}: {e}", invocation.program())));
        },
    };
    let mut command = Command::new(&program);
    command
        .args(invocation.args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = invocation.cwd() {
        command.current_dir(cwd);
    }
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return TaskOutput::failed(FailureKind::LaunchFailure(format!("{}: {e}", program.display())));
        },
    };
    tracing::trace!(pid = child.id(), command = %invocation, "Spawned");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr, status) =
        tokio::join!(capture(stdout, output_limit), capture(stderr, output_limit), child.wait());
    let status = match status {
        Ok(status) => status,
        Err(e) => {
            return TaskOutput {
                stdout,
                stderr,
                ..TaskOutput::failed(FailureKind::Io(format!("waiting for {}: {e}", program.display())))
            };
        },
    };
    let outcome = if status.success() {
        Outcome::Success
    } else {
        Outcome::Failed(FailureKind::NonZeroExit(status.code()))
    };
    TaskOutput {
        outcome,
        exit_code: status.code(),
        stdout,
        stderr,
        output: status.success().then_some(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_source::WorkItem;

    fn invocation(program: &str, args: &[&str]) -> Invocation {
        Invocation::new(WorkItem::new(0, "x"), program, args.iter().map(|s| s.to_string()).collect(), None)
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let output = execute(&invocation("sh", &["-c", "printf out; printf err >&2"]), 1024).await;
        assert!(output.outcome.is_success());
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout.bytes, b"out");
        assert_eq!(output.stderr.bytes, b"err");
        assert!(!output.stdout.truncated);
    }

    #[tokio::test]
    async fn test_truncates_but_drains() {
        // 200 KiB is well past a pipe buffer; the child must not block.
        let output = execute(&invocation("sh", &["-c", "head -c 204800 /dev/zero"]), 16).await;
        assert!(output.outcome.is_success());
        assert_eq!(output.stdout.bytes.len(), 16);
        assert!(output.stdout.truncated);
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let output = execute(&invocation("sh", &["-c", "echo boom >&2; exit 3"]), 1024).await;
        assert_eq!(output.outcome, Outcome::Failed(FailureKind::NonZeroExit(Some(3))));
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stderr.lossy(), "boom\n");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let output = execute(&invocation("definitely-not-a-real-program-fanout", &[]), 1024).await;
        assert!(matches!(output.outcome, Outcome::Failed(FailureKind::LaunchFailure(_))));
    }

    #[tokio::test]
    async fn test_arguments_are_not_split() {
        let output = execute(&invocation("printf", &["%s|", "a b", "c;d", "$HOME"]), 1024).await;
        assert_eq!(output.stdout.lossy(), "a b|c;d|$HOME|");
    }

    #[tokio::test]
    async fn test_working_directory() {
        let dir = std::env::temp_dir();
        let invocation = Invocation::new(WorkItem::new(0, "x"), "pwd", vec![], Some(dir.clone()));
        let output = execute(&invocation, 1024).await;
        let printed = std::path::PathBuf::from(output.stdout.lossy().trim());
        assert_eq!(printed.canonicalize().unwrap(), dir.canonicalize().unwrap());
    }
}
