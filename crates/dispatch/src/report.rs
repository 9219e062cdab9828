use crate::dispatcher::DispatchEvent;
use crate::outcome::{JobResult, Outcome};
use fanout_source::WorkItem;
use std::fmt::{self, Display};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// Every job was claimed and ran to an outcome.
    Complete,
    /// The run was cancelled: some jobs were stopped or never started. The
    /// results that were produced are still valid.
    Cancelled,
}

/// The terminal summary of one dispatch.
///
/// Results are normalized to enumeration order (ascending
/// [`WorkItem::index`]), regardless of the order in which they completed.
#[derive(Debug)]
pub struct RunReport<O = ()> {
    pub status: RunStatus,
    pub total: usize,
    pub successes: Vec<JobResult<O>>,
    pub failures: Vec<JobResult<O>>,
    /// Items that were running when cancellation stopped them.
    pub cancelled: Vec<WorkItem>,
    /// Jobs that were never claimed.
    pub not_started: usize,
    /// Highest number of jobs observed running at once.
    pub peak_concurrency: usize,
}

impl<O> RunReport<O> {
    pub fn succeeded(&self) -> usize {
        self.successes.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Jobs that ran to an outcome, successful or not.
    pub fn attempted(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    /// `true` when the run completed and nothing failed.
    pub fn success(&self) -> bool {
        self.status == RunStatus::Complete && self.failures.is_empty()
    }

    /// Successful items alongside the output their task produced.
    pub fn outputs(&self) -> impl Iterator<Item = (&WorkItem, &O)> {
        self.successes.iter().filter_map(|r| r.output.as_ref().map(|o| (&r.item, o)))
    }
}

impl<O> Display for RunReport<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} total, {} succeeded, {} failed", self.total, self.succeeded(), self.failed())?;
        if self.status == RunStatus::Cancelled {
            write!(f, ", {} cancelled, {} not started", self.cancelled.len(), self.not_started)?;
        }
        Ok(())
    }
}

/// Folds [`DispatchEvent`]s into a [`RunReport`] as they arrive.
///
/// A stream that ends without a [`Complete`](DispatchEvent::Complete) event
/// (because the consumer stopped early) is reported as
/// [`Cancelled`](RunStatus::Cancelled).
pub struct Aggregator<O = ()> {
    total: usize,
    status: RunStatus,
    peak: usize,
    successes: Vec<JobResult<O>>,
    failures: Vec<JobResult<O>>,
    cancelled: Vec<WorkItem>,
}

impl<O> Default for Aggregator<O> {
    fn default() -> Self {
        Self {
            total: 0,
            status: RunStatus::Cancelled,
            peak: 0,
            successes: Vec::new(),
            failures: Vec::new(),
            cancelled: Vec::new(),
        }
    }
}

impl<O> Aggregator<O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: DispatchEvent<O>) {
        match event {
            DispatchEvent::Started { total, .. } => self.total = total,
            DispatchEvent::Finished(result) => self.push(result),
            DispatchEvent::Complete { status, peak_concurrency } => {
                self.status = status;
                self.peak = peak_concurrency;
            },
        }
    }

    pub fn push(&mut self, result: JobResult<O>) {
        match result.outcome {
            Outcome::Success => self.successes.push(result),
            Outcome::Failed(_) => self.failures.push(result),
            Outcome::Cancelled => self.cancelled.push(result.item),
        }
    }

    /// Number of results recorded so far.
    pub fn completed(&self) -> usize {
        self.successes.len() + self.failures.len() + self.cancelled.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn finish(mut self) -> RunReport<O> {
        self.successes.sort_by_key(|r| r.item.index());
        self.failures.sort_by_key(|r| r.item.index());
        self.cancelled.sort_by_key(WorkItem::index);
        let not_started = self.total.saturating_sub(self.completed());
        RunReport {
            status: self.status,
            total: self.total,
            successes: self.successes,
            failures: self.failures,
            cancelled: self.cancelled,
            not_started,
            peak_concurrency: self.peak,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{FailureKind, TaskOutput};
    use std::time::Duration;

    fn result(index: usize, output: TaskOutput<()>) -> JobResult {
        JobResult::new(WorkItem::new(index, format!("item-{index}")), 0, output, Duration::ZERO)
    }

    #[test]
    fn test_sorted_to_enumeration_order() {
        let mut aggregator = Aggregator::new();
        aggregator.record(DispatchEvent::Started { total: 4, workers: 2 });
        aggregator.record(DispatchEvent::Finished(result(3, TaskOutput::failed(FailureKind::NonZeroExit(Some(1))))));
        aggregator.record(DispatchEvent::Finished(result(2, TaskOutput::success(()))));
        aggregator.record(DispatchEvent::Finished(result(0, TaskOutput::failed(FailureKind::NonZeroExit(Some(2))))));
        aggregator.record(DispatchEvent::Finished(result(1, TaskOutput::success(()))));
        aggregator.record(DispatchEvent::Complete { status: RunStatus::Complete, peak_concurrency: 2 });
        let report = aggregator.finish();
        let failed: Vec<_> = report.failures.iter().map(|r| r.item.index()).collect();
        let succeeded: Vec<_> = report.successes.iter().map(|r| r.item.index()).collect();
        assert_eq!(failed, vec![0, 3]);
        assert_eq!(succeeded, vec![1, 2]);
        assert!(!report.success());
        assert_eq!(report.to_string(), "4 total, 2 succeeded, 2 failed");
    }

    #[test]
    fn test_incomplete_stream_is_cancelled() {
        let mut aggregator = Aggregator::new();
        aggregator.record(DispatchEvent::Started { total: 3, workers: 3 });
        aggregator.record(DispatchEvent::Finished(result(0, TaskOutput::success(()))));
        aggregator.record(DispatchEvent::Finished(result(1, TaskOutput::cancelled())));
        let report = aggregator.finish();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.not_started, 1);
        assert_eq!(report.cancelled.len(), 1);
        assert!(!report.success());
        assert_eq!(report.to_string(), "3 total, 1 succeeded, 0 failed, 1 cancelled, 1 not started");
    }

    #[test]
    fn test_empty_run_succeeds() {
        let mut aggregator = Aggregator::<()>::new();
        aggregator.record(DispatchEvent::Started { total: 0, workers: 0 });
        aggregator.record(DispatchEvent::Complete { status: RunStatus::Complete, peak_concurrency: 0 });
        let report = aggregator.finish();
        assert!(report.success());
        assert_eq!(report.total, 0);
    }
}
