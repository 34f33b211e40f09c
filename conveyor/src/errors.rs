//! Error types for the conveyor coordinator.
//!
//! Item-level failures are data ([`ItemError`]) and travel through the queues
//! like any other result. Queue protocol violations ([`QueueUsageError`]) are
//! bugs in the orchestration and are never recovered.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Convenience result alias for fallible conveyor operations.
pub type Result<T, E = ConveyorError> = std::result::Result<T, E>;

/// The main error type for conveyor operations.
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// The pipeline configuration is invalid.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A queue was driven outside of its protocol.
    #[error("{0}")]
    Queue(#[from] QueueUsageError),

    /// A worker could not be started.
    #[error("Failed to spawn worker '{worker}': {source}")]
    Spawn {
        /// Name of the worker that failed to start.
        worker: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// One or more workers terminated by panicking outside of an item.
    #[error("Worker '{worker}' terminated abnormally: {message}")]
    WorkerPanicked {
        /// Name of the first worker that panicked.
        worker: String,
        /// Panic payload, when it was a string.
        message: String,
    },

    /// An async run was started from a context that cannot host it.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A configuration document could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error raised when a pipeline or stage configuration is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            fix_hint: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

/// Returned by `get` once a shut-down queue has no buffered items left.
///
/// This is the normal end-of-stream signal for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue has been shut down")]
pub struct QueueShutDown;

/// Returned by `put` on a queue that has been shut down.
///
/// The rejected item is handed back to the caller.
#[derive(PartialEq, Eq, Error)]
#[error("put rejected: queue has been shut down")]
pub struct PutRejected<T>(pub T);

impl<T> PutRejected<T> {
    /// Returns the rejected item.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for PutRejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PutRejected(..)")
    }
}

/// A violation of the queue bookkeeping protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueUsageError {
    /// `task_done` was called more times than `get` succeeded.
    #[error("task_done() called too many times on queue '{queue}'")]
    TaskDoneOverflow {
        /// The queue name.
        queue: String,
    },

    /// An item was put into a queue after it was shut down.
    #[error("put() on queue '{queue}' after shutdown")]
    PutAfterShutdown {
        /// The queue name.
        queue: String,
    },
}

/// How an individual item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    /// The stage function returned an error.
    Failed,
    /// The stage function panicked.
    Panicked,
    /// The item could not be moved across a process boundary.
    Transport,
}

impl fmt::Display for ItemErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "failed"),
            Self::Panicked => write!(f, "panicked"),
            Self::Transport => write!(f, "transport"),
        }
    }
}

/// A failure captured for one item.
///
/// Once produced, the error is forwarded by every downstream stage without
/// invoking their functions, and ends up in the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("item #{seq} {kind} in stage '{stage}': {message}")]
pub struct ItemError {
    /// Submission sequence number of the item.
    pub seq: u64,
    /// Stage in which the failure happened.
    pub stage: String,
    /// Failure category.
    pub kind: ItemErrorKind,
    /// Human readable failure description.
    pub message: String,
}

impl ItemError {
    /// Creates a new item error.
    #[must_use]
    pub fn new(
        seq: u64,
        stage: impl Into<String>,
        kind: ItemErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            seq,
            stage: stage.into(),
            kind,
            message: message.into(),
        }
    }

    /// Creates an error for a stage function that returned `Err`.
    #[must_use]
    pub fn failed(seq: u64, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(seq, stage, ItemErrorKind::Failed, message)
    }

    /// Creates an error for a stage function that panicked.
    #[must_use]
    pub fn panicked(seq: u64, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(seq, stage, ItemErrorKind::Panicked, message)
    }

    /// Creates an error for a process boundary failure.
    #[must_use]
    pub fn transport(seq: u64, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(seq, stage, ItemErrorKind::Transport, message)
    }
}
