//! The queue-control seam the orchestrator is written against.
//!
//! A junction is a queue seen from the coordinator's side: it can be closed,
//! waited on until drained, and inspected. The shutdown sequence is written
//! once against these traits, for blocking and for suspending queues.

use crate::queue::{AsyncBoundedQueue, BoundedQueue, QueueStats};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Control side of a blocking queue.
#[cfg_attr(test, mockall::automock)]
pub trait Junction: Send + Sync {
    /// Queue name used in logs and reports.
    fn label(&self) -> String;

    /// Stops the queue from accepting new items.
    fn close(&self);

    /// Blocks until every item put into the queue has been acknowledged.
    fn wait_drained(&self);

    /// Returns a snapshot of the queue counters.
    fn stats(&self) -> QueueStats;
}

impl<T: Send> Junction for BoundedQueue<T> {
    fn label(&self) -> String {
        self.name().to_string()
    }

    fn close(&self) {
        self.shutdown();
    }

    fn wait_drained(&self) {
        self.join();
    }

    fn stats(&self) -> QueueStats {
        BoundedQueue::stats(self)
    }
}

/// Control side of a suspending queue.
#[async_trait]
pub trait AsyncJunction: Send + Sync {
    /// Queue name used in logs and reports.
    fn label(&self) -> String;

    /// Stops the queue from accepting new items.
    fn close(&self);

    /// Suspends until every item put into the queue has been acknowledged.
    async fn wait_drained(&self);

    /// Returns a snapshot of the queue counters.
    fn stats(&self) -> QueueStats;
}

#[async_trait]
impl<T: Send> AsyncJunction for AsyncBoundedQueue<T> {
    fn label(&self) -> String {
        self.name().to_string()
    }

    fn close(&self) {
        self.shutdown();
    }

    async fn wait_drained(&self) {
        self.join().await;
    }

    fn stats(&self) -> QueueStats {
        AsyncBoundedQueue::stats(self)
    }
}

/// Closes and drains each junction in turn, upstream first.
///
/// A junction is closed only after the previous one drained, which means
/// every producer of this junction has finished its last item.
pub fn drain_in_order(junctions: &[Arc<dyn Junction>]) {
    for junction in junctions {
        junction.close();
        junction.wait_drained();
        debug!(queue = %junction.label(), "junction drained");
    }
}

/// Suspending counterpart of [`drain_in_order`].
pub async fn drain_in_order_async(junctions: &[Arc<dyn AsyncJunction>]) {
    for junction in junctions {
        junction.close();
        junction.wait_drained().await;
        debug!(queue = %junction.label(), "junction drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    fn expect_drain(junction: &mut MockJunction, label: &str, seq: &mut Sequence) {
        junction.expect_label().return_const(label.to_string());
        junction
            .expect_close()
            .times(1)
            .in_sequence(seq)
            .return_const(());
        junction
            .expect_wait_drained()
            .times(1)
            .in_sequence(seq)
            .return_const(());
    }

    #[test]
    fn test_drain_in_order_closes_then_waits_upstream_first() {
        let mut seq = Sequence::new();
        let mut ingest = MockJunction::new();
        let mut middle = MockJunction::new();
        let mut terminal = MockJunction::new();
        expect_drain(&mut ingest, "ingest", &mut seq);
        expect_drain(&mut middle, "middle", &mut seq);
        expect_drain(&mut terminal, "terminal", &mut seq);

        let junctions: Vec<Arc<dyn Junction>> =
            vec![Arc::new(ingest), Arc::new(middle), Arc::new(terminal)];
        drain_in_order(&junctions);
    }

    #[test]
    fn test_blocking_queue_as_junction() {
        let queue = Arc::new(BoundedQueue::new("q", 2));
        queue.put(1).unwrap();
        assert_eq!(queue.get(), Ok(1));
        queue.task_done();

        let junction: Arc<dyn Junction> = queue.clone();
        drain_in_order(&[junction.clone()]);

        assert!(queue.is_shutdown());
        assert_eq!(junction.label(), "q");
        assert_eq!(junction.stats().acknowledged, 1);
    }

    #[tokio::test]
    async fn test_async_drain_waits_for_consumer() {
        let first = Arc::new(AsyncBoundedQueue::new("first", 0));
        let second = Arc::new(AsyncBoundedQueue::new("second", 0));

        let relay = {
            let (first, second) = (first.clone(), second.clone());
            tokio::spawn(async move {
                while let Ok(item) = first.get().await {
                    second.put(item + 1).await.unwrap();
                    first.task_done();
                }
            })
        };
        let sink = {
            let second = second.clone();
            tokio::spawn(async move {
                let mut total = 0;
                while let Ok(item) = second.get().await {
                    total += item;
                    second.task_done();
                }
                total
            })
        };

        for i in 0..10 {
            first.put(i).await.unwrap();
        }
        let junctions: Vec<Arc<dyn AsyncJunction>> = vec![first.clone(), second.clone()];
        drain_in_order_async(&junctions).await;

        relay.await.unwrap();
        assert_eq!(sink.await.unwrap(), (1..=10).sum::<i32>());
        assert!(first.is_shutdown() && second.is_shutdown());
    }
}
