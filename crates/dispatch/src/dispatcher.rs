use crate::outcome::{FailureKind, JobResult, Outcome, TaskOutput};
use crate::report::{Aggregator, RunReport, RunStatus};
use crate::task::{Job, JobContext, Task};
use async_stream::stream;
use futures::{FutureExt, Stream, StreamExt};
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Bytes kept from each of stdout and stderr unless configured otherwise.
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Progress events emitted by [`Dispatcher::stream`].
///
/// Events follow a strict ordering:
/// 1. [`Started`](Self::Started), exactly once.
/// 2. [`Finished`](Self::Finished), once per job that was claimed, in
///    completion order.
/// 3. [`Complete`](Self::Complete), exactly once, after every worker has
///    stopped.
pub enum DispatchEvent<O = ()> {
    /// Workers have been started. `workers` never exceeds the concurrency
    /// limit (nor the number of jobs).
    Started { total: usize, workers: usize },
    /// A job has finished, successfully or not.
    Finished(JobResult<O>),
    /// All workers have stopped.
    Complete { status: RunStatus, peak_concurrency: usize },
}

/// Counts jobs in flight and remembers the highest count seen.
#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}
impl Gauge {
    fn enter(&self) -> GaugeGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard(self)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}
struct GaugeGuard<'a>(&'a Gauge);
impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A fixed-size pool of `K` worker slots.
///
/// Each slot claims the next unclaimed job through a shared counter, runs it
/// to an outcome, and claims again until no jobs remain. A failing job never
/// stops its worker, so one bad item cannot prevent any other from running.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    concurrency: NonZeroUsize,
    timeout: Option<Duration>,
    output_limit: usize,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(concurrency: NonZeroUsize) -> Self {
        Self {
            concurrency,
            timeout: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops any single job that runs longer than `timeout`, recording it as
    /// [`FailureKind::Timeout`].
    pub fn with_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.timeout = timeout.into();
        self
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = bytes;
        self
    }

    /// Cancelling `token` stops claiming new jobs and stops the ones running.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn concurrency(&self) -> NonZeroUsize {
        self.concurrency
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Streams [`DispatchEvent`]s while running `task` once for every job.
    ///
    /// Dropping the stream early aborts the workers, which in turn stops any
    /// child processes they were waiting on.
    pub fn stream<T: Task>(
        &self,
        jobs: Vec<T::Job>,
        task: Arc<T>,
    ) -> impl Stream<Item = DispatchEvent<T::Output>> + Send + 'static {
        let jobs: Arc<[T::Job]> = jobs.into();
        let settings = self.clone();
        stream!({
            let total = jobs.len();
            let workers = settings.concurrency.get().min(total);
            yield DispatchEvent::Started { total, workers };

            let claim = Arc::new(AtomicUsize::new(0));
            let gauge = Arc::new(Gauge::default());
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut pool = JoinSet::new();
            for slot in 0..workers {
                let worker = Worker {
                    slot,
                    jobs: Arc::clone(&jobs),
                    task: Arc::clone(&task),
                    claim: Arc::clone(&claim),
                    gauge: Arc::clone(&gauge),
                    settings: settings.clone(),
                    results: tx.clone(),
                };
                pool.spawn(worker.run().instrument(tracing::debug_span!("worker", slot)));
            }
            // Only the workers hold senders now; the channel closes once they all stop.
            drop(tx);

            let mut finished = 0;
            let mut stopped = 0;
            while let Some(result) = rx.recv().await {
                finished += 1;
                if result.outcome == Outcome::Cancelled {
                    stopped += 1;
                }
                yield DispatchEvent::Finished(result);
            }
            while let Some(joined) = pool.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Worker stopped abnormally");
                }
            }

            let status = if finished < total || stopped > 0 {
                RunStatus::Cancelled
            } else {
                RunStatus::Complete
            };
            yield DispatchEvent::Complete { status, peak_concurrency: gauge.peak() };
        })
    }

    /// Runs `task` once for every job and returns the aggregated report.
    pub async fn run<T: Task>(&self, jobs: Vec<T::Job>, task: Arc<T>) -> RunReport<T::Output> {
        let mut aggregator = Aggregator::new();
        let mut events = std::pin::pin!(self.stream(jobs, task));
        while let Some(event) = events.next().await {
            aggregator.record(event);
        }
        aggregator.finish()
    }
}

struct Worker<T: Task> {
    slot: usize,
    jobs: Arc<[T::Job]>,
    task: Arc<T>,
    claim: Arc<AtomicUsize>,
    gauge: Arc<Gauge>,
    settings: Dispatcher,
    results: mpsc::UnboundedSender<JobResult<T::Output>>,
}

impl<T: Task> Worker<T> {
    async fn run(self) {
        let context = JobContext { slot: self.slot, output_limit: self.settings.output_limit };
        loop {
            if self.settings.cancel.is_cancelled() {
                break;
            }
            let index = self.claim.fetch_add(1, Ordering::SeqCst);
            let Some(job) = self.jobs.get(index) else {
                break;
            };
            let item = job.item();
            tracing::debug!(index = item.index(), item = %item, "Claimed job");

            let started = Instant::now();
            let output = {
                let _active = self.gauge.enter();
                self.execute(job, &context).await
            };
            let result = JobResult::new(item.clone(), self.slot, output, started.elapsed());
            match result.outcome.failure() {
                None if result.outcome.is_success() => {
                    tracing::debug!(item = %result.item, elapsed = ?result.duration, "Job succeeded")
                },
                None => tracing::info!(item = %result.item, "Job cancelled"),
                Some(kind) => tracing::warn!(item = %result.item, error = %kind, "Job failed"),
            }
            if self.results.send(result).is_err() {
                // Nobody is listening any more.
                break;
            }
        }
    }

    async fn execute(&self, job: &T::Job, context: &JobContext) -> TaskOutput<T::Output> {
        let deadline = async {
            match self.settings.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        let work = AssertUnwindSafe(self.task.run(job, context)).catch_unwind();
        tokio::select! {
            biased;
            () = self.settings.cancel.cancelled() => TaskOutput::cancelled(),
            output = work => output.unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                TaskOutput::failed(FailureKind::Panicked(message))
            }),
            () = deadline => {
                // Infallible: this branch only completes when a timeout is set.
                TaskOutput::failed(FailureKind::Timeout(self.settings.timeout.unwrap_or_default()))
            },
        }
    }
}
