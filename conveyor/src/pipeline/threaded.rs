//! Running pipelines on OS threads.

use super::junction::{drain_in_order, Junction};
use super::report::{PipelineReport, RunRecord, StageReport};
use super::spec::{PipelineConfig, StageConfig};
use crate::backend::ExecutionBackend;
use crate::errors::{ConveyorError, QueueUsageError, Result};
use crate::queue::{BoundedQueue, TaskGuard};
use crate::worker::{panic_message, spawn_thread_worker, Disposition, Envelope, WorkerStats};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, info_span, warn};

/// Connects one stage to the queue produced by its predecessor and returns
/// the stage's output queue.
pub(crate) type Wire<In, Out> = Box<
    dyn Fn(&mut Wiring, Arc<BoundedQueue<Envelope<In>>>) -> Result<Arc<BoundedQueue<Envelope<Out>>>>
        + Send
        + Sync,
>;

/// The workers spawned for one stage during a run.
struct StageRun {
    config: StageConfig,
    backend: ExecutionBackend,
    input: Arc<dyn Junction>,
    handles: Vec<JoinHandle<WorkerStats>>,
}

/// Per-run bookkeeping filled in while stages are wired.
pub(crate) struct Wiring {
    stages: Vec<StageConfig>,
    output_capacity: usize,
    junctions: Vec<Arc<dyn Junction>>,
    runs: Vec<StageRun>,
}

impl Wiring {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            stages: config.stages.clone(),
            output_capacity: config.output_capacity,
            junctions: Vec::new(),
            runs: Vec::with_capacity(config.stages.len()),
        }
    }

    /// Creates the output queue of stage `index` and starts its workers.
    ///
    /// The output queue is bounded by the next stage's input capacity, or by
    /// the pipeline's terminal bound for the last stage.
    pub(crate) fn attach<I, O, M, H>(
        &mut self,
        index: usize,
        config: &StageConfig,
        backend: ExecutionBackend,
        input: Arc<BoundedQueue<Envelope<I>>>,
        make: &M,
    ) -> Result<Arc<BoundedQueue<Envelope<O>>>>
    where
        I: Send + 'static,
        O: Send + 'static,
        M: Fn(&str) -> H,
        H: FnMut(Envelope<I>) -> (Envelope<O>, Disposition) + Send + 'static,
    {
        let output = Arc::new(match self.stages.get(index + 1) {
            Some(next) => BoundedQueue::new(input_queue_name(&next.name), next.capacity),
            None => BoundedQueue::new("output", self.output_capacity),
        });
        self.junctions.push(output.clone());

        let mut handles = Vec::with_capacity(config.workers);
        let mut spawned = Ok(());
        for worker in 0..config.workers {
            match spawn_thread_worker(&config.name, worker, input.clone(), output.clone(), make(&config.name)) {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    spawned = Err(ConveyorError::Spawn {
                        worker: format!("{}-{worker}", config.name),
                        source,
                    });
                    break;
                }
            }
        }

        self.runs.push(StageRun {
            config: config.clone(),
            backend,
            input,
            handles,
        });
        spawned.map(|()| output)
    }

    /// Shuts every queue down and joins whatever was started.
    fn abort(self) {
        for junction in &self.junctions {
            junction.close();
        }
        for run in self.runs {
            for handle in run.handles {
                let _ = handle.join();
            }
        }
    }
}

fn input_queue_name(stage: &str) -> String {
    format!("{stage}.in")
}

/// A validated pipeline of thread and process stages.
///
/// Queues and workers are created per [`run`](Self::run), so one pipeline
/// can be run any number of times.
pub struct Pipeline<In, Out> {
    config: PipelineConfig,
    backends: Vec<ExecutionBackend>,
    wire: Wire<In, Out>,
}

impl<In, Out> Pipeline<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub(crate) fn new(config: PipelineConfig, backends: Vec<ExecutionBackend>, wire: Wire<In, Out>) -> Self {
        Self {
            config,
            backends,
            wire,
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the validated configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns the backend of each stage, in data flow order.
    #[must_use]
    pub fn backends(&self) -> &[ExecutionBackend] {
        &self.backends
    }

    /// Pushes `items` through every stage and collects the results.
    ///
    /// Blocks until every item has left the terminal queue and every worker
    /// has exited. Item failures are reported in the returned report; they do
    /// not fail the run.
    ///
    /// # Errors
    ///
    /// Returns [`ConveyorError::Spawn`] if a worker thread could not be
    /// started and [`ConveyorError::WorkerPanicked`] if a worker died outside
    /// of a stage function.
    pub fn run<I>(&self, items: I) -> Result<PipelineReport<Out>>
    where
        I: IntoIterator<Item = In>,
    {
        let mut record = RunRecord::start(&self.config.name);
        let span = info_span!("pipeline", pipeline = %self.config.name, run_id = %record.run_id);
        let _entered = span.enter();
        info!(stages = self.config.stages.len(), "pipeline run started");

        let first = &self.config.stages[0];
        let ingest = Arc::new(BoundedQueue::new(input_queue_name(&first.name), first.capacity));
        let mut wiring = Wiring::new(&self.config);
        wiring.junctions.push(ingest.clone());

        let terminal = match (self.wire)(&mut wiring, ingest.clone()) {
            Ok(terminal) => terminal,
            Err(err) => {
                error!(error = %err, "pipeline failed to start");
                wiring.abort();
                return Err(err);
            }
        };
        let collector = match spawn_collector(&self.config.name, terminal.clone()) {
            Ok(collector) => collector,
            Err(source) => {
                wiring.abort();
                return Err(ConveyorError::Spawn {
                    worker: format!("{}-collector", self.config.name),
                    source,
                });
            }
        };

        for item in items {
            if ingest.put(Envelope::new(record.submitted, item)).is_err() {
                wiring.abort();
                return Err(QueueUsageError::PutAfterShutdown {
                    queue: ingest.name().to_string(),
                }
                .into());
            }
            record.submitted += 1;
        }

        drain_in_order(&wiring.junctions);

        let (stages, panicked) = join_stages(wiring.runs);
        let collected = match collector.join() {
            Ok(collected) => collected,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(worker = "collector", panic = %message, "collector terminated abnormally");
                return Err(ConveyorError::WorkerPanicked {
                    worker: format!("{}-collector", self.config.name),
                    message,
                });
            }
        };
        if let Some(err) = panicked {
            return Err(err);
        }

        let report = record.finish(collected, self.config.order, stages, terminal.stats());
        info!(
            submitted = report.submitted,
            processed = report.processed,
            errors = report.errors.len(),
            duration_ms = report.duration_ms(),
            "pipeline run finished"
        );
        Ok(report)
    }
}

/// Joins every worker, returning per-stage reports and the first abnormal
/// termination, if any.
fn join_stages(runs: Vec<StageRun>) -> (Vec<StageReport>, Option<ConveyorError>) {
    let mut panicked = None;
    let mut reports = Vec::with_capacity(runs.len());

    for run in runs {
        let mut workers = Vec::with_capacity(run.handles.len());
        for (index, handle) in run.handles.into_iter().enumerate() {
            match handle.join() {
                Ok(stats) => workers.push(stats),
                Err(payload) => {
                    let worker = format!("{}-{index}", run.config.name);
                    let message = panic_message(payload.as_ref());
                    error!(worker = %worker, panic = %message, "worker terminated abnormally");
                    panicked.get_or_insert(ConveyorError::WorkerPanicked { worker, message });
                }
            }
        }
        reports.push(StageReport::from_workers(
            &run.config.name,
            run.backend,
            run.input.stats(),
            &workers,
        ));
    }

    (reports, panicked)
}

/// Drains the terminal queue on its own thread.
fn spawn_collector<U: Send + 'static>(
    pipeline: &str,
    terminal: Arc<BoundedQueue<Envelope<U>>>,
) -> std::io::Result<JoinHandle<Vec<Envelope<U>>>> {
    thread::Builder::new()
        .name(format!("{pipeline}-collector"))
        .spawn(move || {
            let mut collected = Vec::new();
            while let Ok(envelope) = terminal.get() {
                let _ack = TaskGuard::new(&*terminal);
                if let Err(err) = &envelope.body {
                    warn!(seq = err.seq, stage = %err.stage, kind = %err.kind, "item reached the end as an error");
                }
                collected.push(envelope);
            }
            collected
        })
}

impl<In, Out> std::fmt::Debug for Pipeline<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("backends", &self.backends)
            .finish_non_exhaustive()
    }
}
