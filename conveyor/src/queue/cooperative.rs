//! Suspending bounded queue for cooperative tasks.

use super::state::{GetAttempt, PutAttempt, QueueCore, QueueStats};
use super::TaskDone;
use crate::errors::{PutRejected, QueueShutDown, QueueUsageError};
use parking_lot::Mutex;
use std::fmt;
use tokio::sync::Notify;
use tracing::error;

/// The cooperative counterpart of [`BoundedQueue`](super::BoundedQueue).
///
/// `put`, `get` and `join` are suspension points instead of blocking calls.
/// The internal lock is never held across an `.await`, so the queue is safe
/// on a single-threaded scheduler as well as a multi-threaded one.
pub struct AsyncBoundedQueue<T> {
    name: String,
    state: Mutex<QueueCore<T>>,
    not_empty: Notify,
    not_full: Notify,
    all_done: Notify,
}

impl<T> AsyncBoundedQueue<T> {
    /// Creates a new queue. A `capacity` of `0` means unbounded.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueCore::new(capacity)),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            all_done: Notify::new(),
        }
    }

    /// Appends an item, suspending while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue has been shut down.
    pub async fn put(&self, item: T) -> Result<(), PutRejected<T>> {
        let mut item = item;
        loop {
            // Register interest before checking so a wake-up between the
            // check and the await is not lost.
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
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
                    }
                }
            }

            notified.await;
        }
    }

    /// Removes the oldest item, suspending while the queue is empty and open.
    ///
    /// # Errors
    ///
    /// Returns [`QueueShutDown`] once the queue is shut down and empty.
    pub async fn get(&self) -> Result<T, QueueShutDown> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                match state.try_pop() {
                    GetAttempt::Item(item) => {
                        drop(state);
                        self.not_full.notify_one();
                        return Ok(item);
                    }
                    GetAttempt::Closed => return Err(QueueShutDown),
                    GetAttempt::Empty => state.note_get_wait(),
                }
            }

            notified.await;
        }
    }

    /// Removes the oldest item if one is buffered, without suspending.
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
    /// Panics if called more times than `get` succeeded.
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
                    self.all_done.notify_waiters();
                }
                Ok(())
            }
            Err(()) => Err(QueueUsageError::TaskDoneOverflow {
                queue: self.name.clone(),
            }),
        }
    }

    /// Stops accepting new items and wakes every waiter. Idempotent.
    pub fn shutdown(&self) {
        let first = self.state.lock().close();
        if first {
            tracing::trace!(queue = %self.name, "queue shut down");
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        self.all_done.notify_waiters();
    }

    /// Suspends until every item put into the queue has been retrieved and
    /// acknowledged.
    pub async fn join(&self) {
        loop {
            let notified = self.all_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let drained = self.state.lock().is_drained();
            if drained {
                return;
            }

            notified.await;
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

impl<T> TaskDone for AsyncBoundedQueue<T> {
    fn task_done(&self) {
        Self::task_done(self);
    }
}

impl<T> fmt::Debug for AsyncBoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AsyncBoundedQueue")
            .field("name", &self.name)
            .field("len", &state.len())
            .field("capacity", &state.capacity())
            .field("pending", &state.pending())
            .field("shutdown", &state.is_shutdown())
            .finish()
    }
}
