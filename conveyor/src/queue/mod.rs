//! Bounded work queues.
//!
//! This module provides:
//! - [`BoundedQueue`] for OS-thread producers and consumers
//! - [`AsyncBoundedQueue`] for cooperative tasks
//! - [`TaskGuard`], which acknowledges a retrieved item even during unwinding
//!
//! Both queue flavours share the same bookkeeping and differ only in how a
//! caller waits.

mod blocking;
mod cooperative;
mod state;

pub use blocking::BoundedQueue;
pub use cooperative::AsyncBoundedQueue;
pub use state::QueueStats;

/// A queue that tracks completion of retrieved items.
pub trait TaskDone {
    /// Marks one retrieved item as complete.
    fn task_done(&self);
}

/// Calls `task_done` on drop.
///
/// Create the guard right after a successful `get`; the acknowledgement then
/// happens exactly once whether the holder returns normally or unwinds.
#[must_use = "the item is acknowledged when the guard is dropped"]
pub struct TaskGuard<'a, Q: TaskDone + ?Sized> {
    queue: &'a Q,
}

impl<'a, Q: TaskDone + ?Sized> TaskGuard<'a, Q> {
    /// Creates a guard for one retrieved item.
    pub fn new(queue: &'a Q) -> Self {
        Self { queue }
    }
}

impl<Q: TaskDone + ?Sized> Drop for TaskGuard<'_, Q> {
    fn drop(&mut self) {
        self.queue.task_done();
    }
}

impl<Q: TaskDone + ?Sized> std::fmt::Debug for TaskGuard<'_, Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_acknowledges_once() {
        // One of the two items is retrieved; the other stays buffered.
        let queue = BoundedQueue::new("guard", 0);
        queue.put(1).unwrap();
        queue.put(2).unwrap();

        let _ = queue.get().unwrap();
        {
            let _ack = TaskGuard::new(&queue);
            assert_eq!(queue.pending(), 1);
        }
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.stats().acknowledged, 1);
    }
}
