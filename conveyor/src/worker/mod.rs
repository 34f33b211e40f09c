//! Workers: the execution units that move items from one queue to the next.
//!
//! A worker repeatedly takes one [`Envelope`] from its input queue, applies
//! the stage function, emits the result downstream and acknowledges the
//! input. Failures never leave the loop; they are converted to
//! [`ItemError`]s and emitted like any other result.
//!
//! Three backends share this contract:
//! - OS threads running a Rust closure
//! - OS threads each driving one child process over a JSON line protocol
//! - cooperative tasks on a `tokio` runtime
//!
//! [`serve_stdio`] is the other end of the process protocol: it runs the same
//! kind of stage function inside the child.

mod child;
mod process;
mod task;
mod thread;

pub use child::{serve, serve_stdio};
pub use process::{ProcessCommand, Reply, TransportError};

pub(crate) use process::ProcessClient;
pub(crate) use task::{spawn_task_worker, AsyncStageFn};
pub(crate) use thread::{closure_handler, spawn_thread_worker, SyncStageFn};

use crate::errors::ItemError;
use serde::{Deserialize, Serialize};
use std::any::Any;
use tracing::warn;

/// One item travelling through a pipeline.
///
/// The sequence number is assigned at submission and kept by every stage, so
/// a failure can always be traced back to the item that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<T> {
    /// Submission sequence number.
    pub seq: u64,
    /// The value, or the failure captured by an upstream stage.
    pub body: Result<T, ItemError>,
}

impl<T> Envelope<T> {
    /// Wraps a freshly submitted item.
    #[must_use]
    pub fn new(seq: u64, item: T) -> Self {
        Self { seq, body: Ok(item) }
    }

    /// Wraps a captured failure.
    #[must_use]
    pub fn failed(error: ItemError) -> Self {
        Self {
            seq: error.seq,
            body: Err(error),
        }
    }

    /// Returns true if the envelope carries a value.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.body.is_ok()
    }

    /// Splits off the payload, or re-types an upstream failure so it can be
    /// forwarded unchanged.
    pub(crate) fn open<U>(self) -> Result<(u64, T), Envelope<U>> {
        match self.body {
            Ok(item) => Ok((self.seq, item)),
            Err(error) => Err(Envelope {
                seq: self.seq,
                body: Err(error),
            }),
        }
    }
}

/// What a worker did with one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Processed,
    Failed,
    Forwarded,
}

/// Per-worker counters, owned by the worker and handed back when it exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Stage the worker belongs to.
    pub stage: String,
    /// Worker name (`<stage>-<index>`).
    pub worker: String,
    /// Items the stage function completed successfully.
    pub processed: u64,
    /// Items the stage function failed on.
    pub failed: u64,
    /// Upstream failures passed through without calling the function.
    pub forwarded: u64,
}

impl WorkerStats {
    pub(crate) fn new(stage: &str, worker: &str) -> Self {
        Self {
            stage: stage.to_string(),
            worker: worker.to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Processed => self.processed += 1,
            Disposition::Failed => self.failed += 1,
            Disposition::Forwarded => self.forwarded += 1,
        }
    }

    /// Total envelopes this worker handled.
    #[must_use]
    pub fn handled(&self) -> u64 {
        self.processed + self.failed + self.forwarded
    }
}

/// Applies a synchronous stage function to one envelope, catching panics.
pub(crate) fn apply<T, U, F>(stage: &str, envelope: Envelope<T>, func: F) -> (Envelope<U>, Disposition)
where
    F: FnOnce(T) -> anyhow::Result<U>,
{
    let (seq, item) = match envelope.open() {
        Ok(parts) => parts,
        Err(forwarded) => return (forwarded, Disposition::Forwarded),
    };

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| func(item)));
    conclude(stage, seq, outcome)
}

/// Turns the outcome of one function call into an envelope.
pub(crate) fn conclude<U>(
    stage: &str,
    seq: u64,
    outcome: Result<anyhow::Result<U>, Box<dyn Any + Send>>,
) -> (Envelope<U>, Disposition) {
    match outcome {
        Ok(Ok(value)) => (Envelope::new(seq, value), Disposition::Processed),
        Ok(Err(err)) => {
            let message = format!("{err:#}");
            warn!(stage, seq, error = %message, "item failed");
            (
                Envelope::failed(ItemError::failed(seq, stage, message)),
                Disposition::Failed,
            )
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(stage, seq, panic = %message, "stage function panicked");
            (
                Envelope::failed(ItemError::panicked(seq, stage, message)),
                Disposition::Failed,
            )
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ItemErrorKind;
    use anyhow::anyhow;

    #[test]
    fn test_apply_success() {
        let (out, disposition) = apply("double", Envelope::new(4, 21), |x: i32| Ok(x * 2));
        assert_eq!(out, Envelope::new(4, 42));
        assert_eq!(disposition, Disposition::Processed);
    }

    #[test]
    fn test_apply_error_keeps_context_chain() {
        let (out, disposition) = apply("load", Envelope::new(1, ()), |()| -> anyhow::Result<()> {
            Err(anyhow!("permission denied").context("opening photo"))
        });

        let err = out.body.unwrap_err();
        assert_eq!(disposition, Disposition::Failed);
        assert_eq!(err.kind, ItemErrorKind::Failed);
        assert_eq!(err.seq, 1);
        assert_eq!(err.message, "opening photo: permission denied");
    }

    #[test]
    fn test_apply_catches_panic() {
        let (out, disposition) = apply("boom", Envelope::new(9, 0), |_: i32| -> anyhow::Result<i32> {
            panic!("exploded on {}", 9)
        });

        let err = out.body.unwrap_err();
        assert_eq!(disposition, Disposition::Failed);
        assert_eq!(err.kind, ItemErrorKind::Panicked);
        assert_eq!(err.message, "exploded on 9");
    }

    #[test]
    fn test_apply_forwards_upstream_failure() {
        let upstream = Envelope::<i32>::failed(ItemError::failed(3, "first", "bad input"));
        let mut called = false;
        let (out, disposition) = apply("second", upstream, |x: i32| {
            called = true;
            Ok(x)
        });

        assert!(!called);
        assert_eq!(disposition, Disposition::Forwarded);
        assert_eq!(out.body.unwrap_err().stage, "first");
    }

    #[test]
    fn test_worker_stats_record() {
        let mut stats = WorkerStats::new("s", "s-0");
        stats.record(Disposition::Processed);
        stats.record(Disposition::Processed);
        stats.record(Disposition::Failed);
        stats.record(Disposition::Forwarded);

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.handled(), 4);
    }

    #[test]
    fn test_panic_message_variants() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(17_u8);

        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
