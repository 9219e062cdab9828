use crate::outcome::TaskOutput;
use async_trait::async_trait;
use fanout_source::WorkItem;
use fanout_template::Invocation;

/// Anything the dispatcher can schedule: it only needs to know which
/// [`WorkItem`] a job belongs to.
pub trait Job: Send + Sync + 'static {
    fn item(&self) -> &WorkItem;
}
impl Job for WorkItem {
    fn item(&self) -> &WorkItem {
        self
    }
}
impl Job for Invocation {
    fn item(&self) -> &WorkItem {
        Invocation::item(self)
    }
}

/// Per-job settings handed to [`Task::run`].
#[derive(Clone, Copy, Debug)]
pub struct JobContext {
    /// Worker slot (`0..K`) running the job.
    pub slot: usize,
    /// Maximum bytes to keep from each of stdout and stderr.
    pub output_limit: usize,
}

/// The unit of work run once per job.
///
/// Timeouts and cancellation are enforced by the dispatcher by dropping the
/// future returned from [`run`](Self::run), so implementations must release
/// their resources on drop (child processes are spawned with
/// `kill_on_drop`).
#[async_trait]
pub trait Task: Send + Sync + 'static {
    type Job: Job;
    type Output: Send + 'static;

    async fn run(&self, job: &Self::Job, ctx: &JobContext) -> TaskOutput<Self::Output>;
}

/// Runs each [`Invocation`] as a child process.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandTask;

#[async_trait]
impl Task for CommandTask {
    type Job = Invocation;
    type Output = ();

    async fn run(&self, job: &Invocation, ctx: &JobContext) -> TaskOutput<()> {
        crate::process::execute(job, ctx.output_limit).await
    }
}
