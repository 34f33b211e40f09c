//! Observability utilities.
//!
//! Everything in the crate logs through `tracing`. This module only adds a
//! convenience subscriber setup.

mod subscriber;

pub use subscriber::{init_tracing, LogFormat};
