//! OS-thread workers.

use super::{apply, conclude, Disposition, Envelope, WorkerStats};
use crate::errors::QueueUsageError;
use crate::queue::{BoundedQueue, TaskGuard};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// A synchronous stage function shared by every worker of a stage.
pub(crate) type SyncStageFn<I, O> = Arc<dyn Fn(I) -> anyhow::Result<O> + Send + Sync>;

/// Spawns a thread named `<stage>-<index>` that drains `input` into `output`.
///
/// `handle` decides what happens to each envelope; the loop around it takes
/// care of acknowledgement and termination. A panic escaping `handle` fails
/// only the envelope being handled, so the worker keeps draining `input`.
/// The worker exits when `input` reports shutdown and returns its counters
/// through the join handle.
pub(crate) fn spawn_thread_worker<I, O, H>(
    stage: &str,
    index: usize,
    input: Arc<BoundedQueue<Envelope<I>>>,
    output: Arc<BoundedQueue<Envelope<O>>>,
    mut handle: H,
) -> io::Result<JoinHandle<WorkerStats>>
where
    I: Send + 'static,
    O: Send + 'static,
    H: FnMut(Envelope<I>) -> (Envelope<O>, Disposition) + Send + 'static,
{
    let name = format!("{stage}-{index}");
    let stage = stage.to_string();

    thread::Builder::new().name(name.clone()).spawn(move || {
        let mut stats = WorkerStats::new(&stage, &name);
        debug!(stage = %stage, worker = %name, "worker started");

        while let Ok(envelope) = input.get() {
            let _ack = TaskGuard::new(&*input);
            let seq = envelope.seq;
            let (result, disposition) = match catch_unwind(AssertUnwindSafe(|| handle(envelope))) {
                Ok(handled) => handled,
                Err(payload) => conclude(&stage, seq, Err(payload)),
            };
            stats.record(disposition);
            emit(&output, result);
        }

        debug!(
            stage = %stage,
            worker = %name,
            processed = stats.processed,
            failed = stats.failed,
            forwarded = stats.forwarded,
            "worker stopped"
        );
        stats
    })
}

/// Builds the per-envelope handler for an in-process stage function.
pub(crate) fn closure_handler<I, O>(
    stage: &str,
    func: SyncStageFn<I, O>,
) -> impl FnMut(Envelope<I>) -> (Envelope<O>, Disposition) + Send + 'static
where
    I: 'static,
    O: 'static,
{
    let stage = stage.to_string();
    move |envelope| apply(&stage, envelope, |item| func(item))
}

/// Puts a result downstream.
///
/// The orchestrator never shuts a queue down while its producers are alive,
/// so a rejection here is a protocol violation.
fn emit<U>(output: &BoundedQueue<Envelope<U>>, envelope: Envelope<U>) {
    if output.put(envelope).is_err() {
        let err = QueueUsageError::PutAfterShutdown {
            queue: output.name().to_string(),
        };
        error!(%err, "downstream queue closed while its producers were running");
        panic!("{err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    fn queues<I, O>() -> (Arc<BoundedQueue<Envelope<I>>>, Arc<BoundedQueue<Envelope<O>>>) {
        (
            Arc::new(BoundedQueue::new("in", 4)),
            Arc::new(BoundedQueue::new("out", 0)),
        )
    }

    #[test]
    fn test_worker_processes_until_shutdown() {
        let (input, output) = queues::<u32, u32>();
        let func: SyncStageFn<u32, u32> = Arc::new(|x: u32| anyhow::Ok(x + 1));
        let worker = spawn_thread_worker(
            "inc",
            0,
            input.clone(),
            output.clone(),
            closure_handler("inc", func),
        )
        .unwrap();

        for seq in 0..10 {
            input.put(Envelope::new(seq, u32::try_from(seq).unwrap())).unwrap();
        }
        input.join();
        input.shutdown();
        let stats = worker.join().unwrap();

        assert_eq!(stats.worker, "inc-0");
        assert_eq!(stats.processed, 10);
        assert_eq!(output.len(), 10);
        let first = output.try_get().unwrap().unwrap();
        assert_eq!(first, Envelope::new(0, 1));
    }

    #[test]
    fn test_worker_survives_failures() {
        let (input, output) = queues::<u32, u32>();
        let func: SyncStageFn<u32, u32> = Arc::new(|x: u32| -> anyhow::Result<u32> {
            if x % 2 == 0 {
                bail!("even input {x}");
            }
            Ok(x)
        });
        let worker = spawn_thread_worker(
            "odd",
            3,
            input.clone(),
            output.clone(),
            closure_handler("odd", func),
        )
        .unwrap();

        for seq in 0..6_u64 {
            input.put(Envelope::new(seq, u32::try_from(seq).unwrap())).unwrap();
        }
        input.join();
        input.shutdown();
        let stats = worker.join().unwrap();

        assert_eq!(stats.processed, 3);
        assert_eq!(stats.failed, 3);
        let failures = std::iter::from_fn(|| output.try_get().unwrap())
            .filter(|envelope| !envelope.is_ok())
            .count();
        assert_eq!(failures, 3);
    }

    #[test]
    fn test_thread_is_named_after_stage() {
        let (input, output) = queues::<(), String>();
        let worker = spawn_thread_worker("label", 7, input.clone(), output.clone(), |envelope: Envelope<()>| {
            let name = thread::current().name().unwrap_or_default().to_string();
            (Envelope::new(envelope.seq, name), Disposition::Processed)
        })
        .unwrap();

        input.put(Envelope::new(0, ())).unwrap();
        input.join();
        input.shutdown();
        worker.join().unwrap();

        let envelope = output.try_get().unwrap().unwrap();
        assert_eq!(envelope.body.unwrap(), "label-7");
    }

    #[test]
    fn test_panicking_handler_fails_one_item() {
        let (input, output) = queues::<u32, u32>();
        let worker = spawn_thread_worker("brittle", 0, input.clone(), output.clone(), |envelope: Envelope<u32>| {
            let (seq, item) = envelope.open::<u32>().unwrap();
            assert!(item != 2, "cannot touch {item}");
            (Envelope::new(seq, item), Disposition::Processed)
        })
        .unwrap();

        for seq in 0..4_u64 {
            input.put(Envelope::new(seq, u32::try_from(seq).unwrap())).unwrap();
        }
        input.join();
        input.shutdown();
        let stats = worker.join().unwrap();

        assert_eq!(stats.processed, 3);
        assert_eq!(stats.failed, 1);
        let failed: Vec<_> = std::iter::from_fn(|| output.try_get().unwrap())
            .filter_map(|envelope| envelope.body.err())
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].seq, 2);
        assert_eq!(failed[0].kind, crate::errors::ItemErrorKind::Panicked);
        assert_eq!(failed[0].message, "cannot touch 2");
    }
}
