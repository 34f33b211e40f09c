//! Blocking bounded queue for OS-thread workers.

use super::state::{GetAttempt, PutAttempt, QueueCore, QueueStats};
use super::TaskDone;
use crate::errors::{PutRejected, QueueShutDown, QueueUsageError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use tracing::error;

/// A thread-safe FIFO with blocking `put`/`get`, completion tracking and
/// cooperative shutdown.
///
/// Waiting is done on condition variables, so a blocked caller consumes no
/// CPU until the state it waits for changes.
///
/// # Example
///
/// ```
/// use conveyor::queue::BoundedQueue;
///
/// let queue = BoundedQueue::new("jobs", 2);
/// queue.put(1).unwrap();
/// queue.shutdown();
///
/// assert_eq!(queue.get(), Ok(1));
/// queue.task_done();
/// assert!(queue.get().is_err());
/// queue.join();
/// ```
pub struct BoundedQueue<T> {
    name: String,
    state: Mutex<QueueCore<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    all_done: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Creates a new queue. A `capacity` of `0` means unbounded.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueCore::new(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            all_done: Condvar::new(),
        }
    }

    /// Appends an item, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue has been shut down.
    pub fn put(&self, item: T) -> Result<(), PutRejected<T>> {
        let mut state = self.state.lock();
        let mut item = item;
        loop {
            match state.try_push(item) {
                PutAttempt::Accepted => {
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                PutAttempt::Closed(rejected) => return Err(PutRejected(rejected)),
                PutAttempt::Full(back) => {
                    item = back;
                    state.note_put_wait();
                    self.not_full.wait(&mut state);
                }
            }
        }
    }

    /// Removes the oldest item, blocking while the queue is empty and open.
    ///
    /// Every successful `get` must be matched by exactly one `task_done`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueShutDown`] once the queue is shut down and empty.
    pub fn get(&self) -> Result<T, QueueShutDown> {
        let mut state = self.state.lock();
        loop {
            match state.try_pop() {
                GetAttempt::Item(item) => {
                    drop(state);
                    self.not_full.notify_one();
                    return Ok(item);
                }
                GetAttempt::Closed => return Err(QueueShutDown),
                GetAttempt::Empty => {
                    state.note_get_wait();
                    self.not_empty.wait(&mut state);
                }
            }
        }
    }

    /// Removes the oldest item if one is buffered, without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`QueueShutDown`] once the queue is shut down and empty.
    pub fn try_get(&self) -> Result<Option<T>, QueueShutDown> {
        let mut state = self.state.lock();
        match state.try_pop() {
            GetAttempt::Item(item) => {
                drop(state);
                self.not_full.notify_one();
                Ok(Some(item))
            }
            GetAttempt::Empty => Ok(None),
            GetAttempt::Closed => Err(QueueShutDown),
        }
    }

    /// Marks one retrieved item as complete.
    ///
    /// # Panics
    ///
    /// Panics if called more times than `get` succeeded. The bookkeeping is
    /// already broken at that point and `join` can no longer be trusted.
    pub fn task_done(&self) {
        if let Err(err) = self.try_task_done() {
            error!(queue = %self.name, "{err}");
            panic!("{err}");
        }
    }

    /// Marks one retrieved item as complete, reporting misuse as an error.
    ///
    /// # Errors
    ///
    /// Returns [`QueueUsageError::TaskDoneOverflow`] if no retrieved item is
    /// pending.
    pub fn try_task_done(&self) -> Result<(), QueueUsageError> {
        let mut state = self.state.lock();
        match state.acknowledge() {
            Ok(drained) => {
                drop(state);
                if drained {
                    self.all_done.notify_all();
                }
                Ok(())
            }
            Err(()) => Err(QueueUsageError::TaskDoneOverflow {
                queue: self.name.clone(),
            }),
        }
    }

    /// Stops accepting new items and wakes every waiter. Idempotent.
    ///
    /// Buffered items remain available to `get`.
    pub fn shutdown(&self) {
        let first = self.state.lock().close();
        if first {
            tracing::trace!(queue = %self.name, "queue shut down");
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.all_done.notify_all();
    }

    /// Blocks until every item put into the queue has been retrieved and
    /// acknowledged.
    pub fn join(&self) {
        let mut state = self.state.lock();
        while !state.is_drained() {
            self.all_done.wait(&mut state);
        }
    }

    /// Returns the queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    /// Returns true if no items are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the capacity (`0` means unbounded).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    /// Returns the number of retrieved but unacknowledged items.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().pending()
    }

    /// Returns true once `shutdown` has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().is_shutdown()
    }

    /// Returns a snapshot of the queue counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats()
    }
}

impl<T> TaskDone for BoundedQueue<T> {
    fn task_done(&self) {
        Self::task_done(self);
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BoundedQueue")
            .field("name", &self.name)
            .field("len", &state.len())
            .field("capacity", &state.capacity())
            .field("pending", &state.pending())
            .field("shutdown", &state.is_shutdown())
            .finish()
    }
}
