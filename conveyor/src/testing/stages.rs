//! Stage functions for tests.

use anyhow::bail;
use parking_lot::Mutex;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

/// Returns a stage function that fails on every `n`th item.
///
/// Items are numbered by value, so with `n = 3` the items `2`, `5`, `8`, ...
/// fail regardless of which worker handles them. All other items pass
/// through unchanged.
///
/// # Panics
///
/// Panics if `n` is zero.
pub fn fail_every<T>(n: u64) -> impl Fn(T) -> anyhow::Result<T> + Clone + Send + Sync + 'static
where
    T: Copy + Into<u64> + Display,
{
    assert!(n > 0, "fail_every needs a positive period");
    move |item| {
        if (item.into() + 1) % n == 0 {
            bail!("item {item} rejected");
        }
        Ok(item)
    }
}

/// Returns a stage function that panics on every `n`th item.
///
/// Uses the same numbering as [`fail_every`].
///
/// # Panics
///
/// Panics if `n` is zero.
pub fn panic_every<T>(n: u64) -> impl Fn(T) -> anyhow::Result<T> + Clone + Send + Sync + 'static
where
    T: Copy + Into<u64> + Display,
{
    assert!(n > 0, "panic_every needs a positive period");
    move |item| {
        assert!((item.into() + 1) % n != 0, "item {item} exploded");
        Ok(item)
    }
}

/// Returns a stage function that sleeps for `delay` before passing the item on.
pub fn sleepy<T>(delay: Duration) -> impl Fn(T) -> anyhow::Result<T> + Clone + Send + Sync + 'static {
    move |item| {
        std::thread::sleep(delay);
        Ok(item)
    }
}

/// Records the items a stage sees, in the order it sees them.
#[derive(Debug)]
pub struct Recorder<T> {
    seen: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            seen: Arc::clone(&self.seen),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a pass-through stage function that records every item.
    pub fn stage(&self) -> impl Fn(T) -> anyhow::Result<T> + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |item: T| {
            seen.lock().push(item.clone());
            Ok(item)
        }
    }

    /// Returns the items recorded so far.
    #[must_use]
    pub fn seen(&self) -> Vec<T> {
        self.seen.lock().clone()
    }
}
