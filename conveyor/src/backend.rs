//! Execution backends.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a stage's workers run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionBackend {
    /// One OS thread per worker running an in-process function.
    #[default]
    Thread,
    /// One OS thread per worker, each driving a long-lived child process.
    Process,
    /// Cooperative tasks sharing a `tokio` scheduler.
    Cooperative,
}

impl fmt::Display for ExecutionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => write!(f, "thread"),
            Self::Process => write!(f, "process"),
            Self::Cooperative => write!(f, "cooperative"),
        }
    }
}
