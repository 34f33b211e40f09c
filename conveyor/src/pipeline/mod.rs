//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage and pipeline configuration
//! - Typed builders for thread/process and cooperative pipelines
//! - The junction seam the shutdown sequence is written against
//! - Run reports

mod builder;
mod cooperative;
mod junction;
mod report;
mod spec;
mod threaded;


pub use builder::PipelineBuilder;
pub use cooperative::{AsyncPipeline, AsyncPipelineBuilder};
pub use junction::{drain_in_order, drain_in_order_async, AsyncJunction, Junction};
pub use report::{PipelineReport, StageReport};
pub use spec::{OrderPolicy, PipelineConfig, StageConfig};
pub use threaded::Pipeline;
