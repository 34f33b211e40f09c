//! Testing utilities for conveyor pipelines.
//!
//! This module provides:
//! - Ready-made stage functions that fail, panic or stall on purpose
//! - A recorder that captures the order in which a stage saw its items
//! - Assertions over run reports and queue counters

mod assertions;
mod stages;

pub use assertions::{
    assert_conserved, assert_errors_from, assert_no_busy_wait, assert_no_errors,
    assert_queue_bounded,
};
pub use stages::{fail_every, panic_every, sleepy, Recorder};
