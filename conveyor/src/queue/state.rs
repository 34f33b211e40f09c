//! Queue bookkeeping shared by every queue flavour.
//!
//! `QueueCore` never blocks. It answers "can this happen now?" and the
//! wrapping queue decides how to wait when the answer is no.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Counters recorded inside a queue's locked region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Number of successful `put` calls.
    pub puts: u64,
    /// Number of successful `get` calls.
    pub gets: u64,
    /// Number of `task_done` acknowledgements.
    pub acknowledged: u64,
    /// Number of times a producer went to sleep on a full queue.
    pub put_waits: u64,
    /// Number of times a consumer went to sleep on an empty queue.
    pub get_waits: u64,
    /// Largest buffer length ever observed.
    pub high_watermark: usize,
}

pub(crate) enum PutAttempt<T> {
    Accepted,
    Full(T),
    Closed(T),
}

pub(crate) enum GetAttempt<T> {
    Item(T),
    Empty,
    Closed,
}

#[derive(Debug)]
pub(crate) struct QueueCore<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    pending: usize,
    shutdown: bool,
    stats: QueueStats,
}

impl<T> QueueCore<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            pending: 0,
            shutdown: false,
            stats: QueueStats::default(),
        }
    }

    pub(crate) fn try_push(&mut self, item: T) -> PutAttempt<T> {
        if self.shutdown {
            return PutAttempt::Closed(item);
        }
        if self.capacity > 0 && self.buffer.len() >= self.capacity {
            return PutAttempt::Full(item);
        }

        self.buffer.push_back(item);
        self.stats.puts += 1;
        self.stats.high_watermark = self.stats.high_watermark.max(self.buffer.len());
        PutAttempt::Accepted
    }

    pub(crate) fn try_pop(&mut self) -> GetAttempt<T> {
        match self.buffer.pop_front() {
            Some(item) => {
                self.pending += 1;
                self.stats.gets += 1;
                GetAttempt::Item(item)
            }
            None if self.shutdown => GetAttempt::Closed,
            None => GetAttempt::Empty,
        }
    }

    /// Acknowledges one retrieved item. Returns `Ok(true)` when the queue
    /// became fully drained by this call.
    pub(crate) fn acknowledge(&mut self) -> Result<bool, ()> {
        if self.pending == 0 {
            return Err(());
        }
        self.pending -= 1;
        self.stats.acknowledged += 1;
        Ok(self.is_drained())
    }

    /// Sets the shutdown flag. Returns `true` on the first call only.
    pub(crate) fn close(&mut self) -> bool {
        !std::mem::replace(&mut self.shutdown, true)
    }

    pub(crate) fn note_put_wait(&mut self) {
        self.stats.put_waits += 1;
    }

    pub(crate) fn note_get_wait(&mut self) {
        self.stats.get_waits += 1;
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.pending == 0 && self.buffer.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub(crate) fn stats(&self) -> QueueStats {
        self.stats
    }
}
