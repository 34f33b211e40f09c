//! Run reports.

use super::spec::OrderPolicy;
use crate::backend::ExecutionBackend;
use crate::errors::ItemError;
use crate::queue::QueueStats;
use crate::worker::{Envelope, WorkerStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Per-stage outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    /// Stage name.
    pub name: String,
    /// Backend the stage ran on.
    pub backend: ExecutionBackend,
    /// Number of workers.
    pub workers: usize,
    /// Items the stage function completed.
    pub processed: u64,
    /// Items the stage function failed on.
    pub failed: u64,
    /// Upstream failures passed through.
    pub forwarded: u64,
    /// Counters of the stage's input queue.
    pub input_queue: QueueStats,
}

impl StageReport {
    pub(crate) fn from_workers(
        name: &str,
        backend: ExecutionBackend,
        input_queue: QueueStats,
        workers: &[WorkerStats],
    ) -> Self {
        Self {
            name: name.to_string(),
            backend,
            workers: workers.len(),
            processed: workers.iter().map(|w| w.processed).sum(),
            failed: workers.iter().map(|w| w.failed).sum(),
            forwarded: workers.iter().map(|w| w.forwarded).sum(),
            input_queue,
        }
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport<U> {
    /// Pipeline name.
    pub pipeline: String,
    /// Unique id of this run.
    pub run_id: Uuid,
    /// Items submitted.
    pub submitted: u64,
    /// Items that left the terminal queue, successful or not.
    pub processed: u64,
    /// Successful results.
    pub outputs: Vec<U>,
    /// Failed items.
    pub errors: Vec<ItemError>,
    /// Per-stage statistics, in data flow order.
    pub stages: Vec<StageReport>,
    /// Counters of the terminal queue.
    pub output_queue: QueueStats,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl<U> PipelineReport<U> {
    /// Number of successful results.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outputs.len()
    }

    /// Returns true if any item failed.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Fraction of processed items that succeeded.
    ///
    /// An empty run counts as fully successful.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            return 1.0;
        }
        self.outputs.len() as f64 / self.processed as f64
    }

    /// Wall clock duration of the run.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Looks up a stage report by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|stage| stage.name == name)
    }
}

/// Partial report state, collected while the run is in progress.
pub(crate) struct RunRecord {
    pub(crate) pipeline: String,
    pub(crate) run_id: Uuid,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) submitted: u64,
}

impl RunRecord {
    pub(crate) fn start(pipeline: &str) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            submitted: 0,
        }
    }

    /// Orders the collected envelopes and splits them into outputs and errors.
    pub(crate) fn finish<U>(
        self,
        mut collected: Vec<Envelope<U>>,
        order: OrderPolicy,
        stages: Vec<StageReport>,
        output_queue: QueueStats,
    ) -> PipelineReport<U> {
        if order == OrderPolicy::Submission {
            collected.sort_by_key(|envelope| envelope.seq);
        }

        let processed = collected.len() as u64;
        let mut outputs = Vec::with_capacity(collected.len());
        let mut errors = Vec::new();
        for envelope in collected {
            match envelope.body {
                Ok(value) => outputs.push(value),
                Err(error) => errors.push(error),
            }
        }

        PipelineReport {
            pipeline: self.pipeline,
            run_id: self.run_id,
            submitted: self.submitted,
            processed,
            outputs,
            errors,
            stages,
            output_queue,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn collected() -> Vec<Envelope<&'static str>> {
        vec![
            Envelope::new(2, "c"),
            Envelope::failed(ItemError::failed(1, "s", "bad")),
            Envelope::new(0, "a"),
        ]
    }

    #[test]
    fn test_arrival_order_kept() {
        let mut record = RunRecord::start("p");
        record.submitted = 3;
        let report = record.finish(collected(), OrderPolicy::Arrival, Vec::new(), QueueStats::default());

        assert_eq!(report.outputs, vec!["c", "a"]);
        assert_eq!(report.processed, 3);
        assert_eq!(report.succeeded(), 2);
        assert!(report.has_errors());
        assert!((report.success_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_submission_order_sorted() {
        let report = RunRecord::start("p").finish(
            collected(),
            OrderPolicy::Submission,
            Vec::new(),
            QueueStats::default(),
        );

        assert_eq!(report.outputs, vec!["a", "c"]);
        assert_eq!(report.errors[0].seq, 1);
    }

    #[test]
    fn test_empty_report() {
        let report = RunRecord::start("p").finish(
            Vec::<Envelope<u8>>::new(),
            OrderPolicy::Arrival,
            Vec::new(),
            QueueStats::default(),
        );

        assert_eq!(report.processed, 0);
        assert!(!report.has_errors());
        assert!((report.success_rate() - 1.0).abs() < f64::EPSILON);
        assert!(report.duration_ms() >= 0);
    }

    #[test]
    fn test_stage_report_sums_workers() {
        let mut a = WorkerStats::new("s", "s-0");
        a.processed = 3;
        a.failed = 1;
        let mut b = WorkerStats::new("s", "s-1");
        b.processed = 2;
        b.forwarded = 4;

        let report = StageReport::from_workers("s", ExecutionBackend::Thread, QueueStats::default(), &[a, b]);

        assert_eq!(report.workers, 2);
        assert_eq!(report.processed, 5);
        assert_eq!(report.failed, 1);
        assert_eq!(report.forwarded, 4);
    }

    #[test]
    fn test_report_serializes() {
        let report = RunRecord::start("p").finish(collected(), OrderPolicy::Arrival, Vec::new(), QueueStats::default());
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["pipeline"], "p");
        assert_eq!(json["errors"][0]["kind"], "failed");
        assert_eq!(json["outputs"].as_array().unwrap().len(), 2);
    }
}
