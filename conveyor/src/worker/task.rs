//! Cooperative task workers.

use super::{conclude, Disposition, Envelope, WorkerStats};
use crate::errors::QueueUsageError;
use crate::queue::{AsyncBoundedQueue, TaskGuard};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// An asynchronous stage function shared by every task of a stage.
pub(crate) type AsyncStageFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, anyhow::Result<O>> + Send + Sync>;

/// Spawns a task on the current runtime that drains `input` into `output`.
///
/// The task only yields at queue operations and inside the stage function,
/// so the acknowledgement guard is released before the next `get`.
pub(crate) fn spawn_task_worker<I, O>(
    stage: &str,
    index: usize,
    input: Arc<AsyncBoundedQueue<Envelope<I>>>,
    output: Arc<AsyncBoundedQueue<Envelope<O>>>,
    func: AsyncStageFn<I, O>,
) -> JoinHandle<WorkerStats>
where
    I: Send + 'static,
    O: Send + 'static,
{
    let name = format!("{stage}-{index}");
    let stage = stage.to_string();

    tokio::spawn(async move {
        let mut stats = WorkerStats::new(&stage, &name);
        debug!(stage = %stage, worker = %name, "task started");

        while let Ok(envelope) = input.get().await {
            let _ack = TaskGuard::new(&*input);
            let (result, disposition) = apply_async(&stage, envelope, &func).await;
            stats.record(disposition);

            if output.put(result).await.is_err() {
                let err = QueueUsageError::PutAfterShutdown {
                    queue: output.name().to_string(),
                };
                error!(%err, "downstream queue closed while its producers were running");
                panic!("{err}");
            }
        }

        debug!(
            stage = %stage,
            worker = %name,
            processed = stats.processed,
            failed = stats.failed,
            forwarded = stats.forwarded,
            "task stopped"
        );
        stats
    })
}

async fn apply_async<I, O>(
    stage: &str,
    envelope: Envelope<I>,
    func: &AsyncStageFn<I, O>,
) -> (Envelope<O>, Disposition) {
    let (seq, item) = match envelope.open() {
        Ok(parts) => parts,
        Err(forwarded) => return (forwarded, Disposition::Forwarded),
    };

    // The call itself sits inside the guarded future so a panic while
    // building the future is caught as well.
    let outcome = AssertUnwindSafe(async move { func(item).await })
        .catch_unwind()
        .await;
    conclude(stage, seq, outcome)
}
