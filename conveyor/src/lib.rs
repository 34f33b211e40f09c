//! # Conveyor
//!
//! Bounded-queue worker pipelines.
//!
//! A pipeline is an ordered list of stages. Each stage runs a fixed number of
//! workers that pull items from a bounded input queue, apply the stage
//! function and push the result into the next stage's queue. Conveyor
//! provides:
//!
//! - **Backpressure**: every queue has a capacity, so a slow stage throttles
//!   everything upstream of it
//! - **Three backends**: OS threads, child processes speaking JSON lines, and
//!   cooperative tokio tasks
//! - **Error isolation**: a failing or panicking item becomes an error value
//!   that travels to the end of the pipeline without stopping the run
//! - **Ordered shutdown**: queues drain from the first stage to the last, so
//!   no item is lost when a run finishes
//!
//! ## Quick Start
//!
//! ```rust
//! use conveyor::prelude::*;
//!
//! let pipeline = PipelineBuilder::new("words")
//!     .map(StageConfig::new("trim").with_workers(2), |s: String| s.trim().to_string())
//!     .stage(StageConfig::new("parse").with_capacity(8), |s: String| Ok(s.parse::<u32>()?))
//!     .order(OrderPolicy::Submission)
//!     .build()
//!     .unwrap();
//!
//! let report = pipeline.run(vec![" 1".to_string(), "x".to_string(), "3 ".to_string()]).unwrap();
//! assert_eq!(report.outputs, vec![1, 3]);
//! assert_eq!(report.errors.len(), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backend;
pub mod errors;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod testing;
pub mod worker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::ExecutionBackend;
    pub use crate::errors::{
        ConveyorError, ItemError, ItemErrorKind, PipelineValidationError, QueueShutDown,
        QueueUsageError,
    };
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        AsyncPipeline, AsyncPipelineBuilder, OrderPolicy, Pipeline, PipelineBuilder,
        PipelineConfig, PipelineReport, StageConfig, StageReport,
    };
    pub use crate::queue::{AsyncBoundedQueue, BoundedQueue, QueueStats, TaskGuard};
    pub use crate::worker::{serve_stdio, Envelope, ProcessCommand, WorkerStats};
}
