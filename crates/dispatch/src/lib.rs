//! Bounded-concurrency dispatch.
//!
//! A [`Dispatcher`] owns `K` worker slots and runs a [`Task`] once per job,
//! never more than `K` at a time, regardless of how many jobs there are. Each
//! job is one independent unit: a failure (a program that cannot be launched,
//! a non-zero exit, a timeout) is recorded against that job and every other
//! job still runs.
//!
//! Results flow out of [`Dispatcher::stream`] as [`DispatchEvent`]s in
//! completion order, and are folded by an [`Aggregator`] into a
//! [`RunReport`] normalized to enumeration order. [`Dispatcher::run`] does
//! both in one call.
//!
//! [`CommandTask`] runs resolved [`Invocation`](fanout_template::Invocation)s
//! as child processes. Other crates implement [`Task`] for in-process work.

mod dispatcher;
mod outcome;
mod process;
mod report;
mod task;

pub use crate::dispatcher::{DEFAULT_OUTPUT_LIMIT, DispatchEvent, Dispatcher};
pub use crate::outcome::{Captured, FailureKind, JobResult, Outcome, TaskOutput};
pub use crate::process::execute;
pub use crate::report::{Aggregator, RunReport, RunStatus};
pub use crate::task::{CommandTask, Job, JobContext, Task};
pub use tokio_util::sync::CancellationToken;
