//! Test assertions for run reports.

use crate::pipeline::PipelineReport;
use crate::queue::QueueStats;

/// Asserts that every submitted item came out of the pipeline.
pub fn assert_conserved<U>(report: &PipelineReport<U>) {
    assert_eq!(
        report.processed, report.submitted,
        "Expected {} items to leave the pipeline, got {}",
        report.submitted, report.processed
    );
    assert_eq!(
        report.outputs.len() + report.errors.len(),
        usize::try_from(report.processed).unwrap_or(usize::MAX),
        "Outputs and errors do not add up to the processed count"
    );
}

/// Asserts that no item failed.
pub fn assert_no_errors<U>(report: &PipelineReport<U>) {
    assert!(
        report.errors.is_empty(),
        "Expected no errors, got: {:?}",
        report.errors
    );
}

/// Asserts that every reported error originated in `stage`.
pub fn assert_errors_from<U>(report: &PipelineReport<U>, stage: &str) {
    for error in &report.errors {
        assert_eq!(
            error.stage, stage,
            "Expected every error to come from '{stage}', found: {error}"
        );
    }
}

/// Asserts that a queue never held more than `capacity` items.
pub fn assert_queue_bounded(stats: &QueueStats, capacity: usize) {
    if capacity == 0 {
        return;
    }
    assert!(
        stats.high_watermark <= capacity,
        "Queue held {} items, above its capacity of {capacity}",
        stats.high_watermark
    );
}

/// Asserts that the consumers of a queue only slept when there was nothing
/// to take.
///
/// Every sleep ends with one wake-up, and wake-ups only come from a put or
/// from shutdown, so a queue read by `consumers` workers can see at most
/// `puts + consumers` sleeps. A polling consumer would exceed this quickly.
pub fn assert_no_busy_wait(stats: &QueueStats, consumers: usize) {
    let bound = stats.puts + consumers as u64;
    assert!(
        stats.get_waits <= bound,
        "Consumers waited {} times for {} puts; expected at most {bound}",
        stats.get_waits, stats.puts
    );
}
