//! Pipelines of cooperative tasks.

use super::junction::{drain_in_order_async, AsyncJunction};
use super::report::{PipelineReport, RunRecord, StageReport};
use super::spec::{OrderPolicy, PipelineConfig, StageConfig};
use crate::backend::ExecutionBackend;
use crate::errors::{ConveyorError, PipelineValidationError, QueueUsageError, Result};
use crate::queue::{AsyncBoundedQueue, TaskGuard};
use crate::worker::{panic_message, spawn_task_worker, AsyncStageFn, Envelope, WorkerStats};
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

type AsyncWire<In, Out> = Box<
    dyn Fn(&mut AsyncWiring, Arc<AsyncBoundedQueue<Envelope<In>>>) -> Arc<AsyncBoundedQueue<Envelope<Out>>>
        + Send
        + Sync,
>;

struct TaskStageRun {
    name: String,
    input: Arc<dyn AsyncJunction>,
    handles: Vec<JoinHandle<WorkerStats>>,
}

struct AsyncWiring {
    stages: Vec<StageConfig>,
    output_capacity: usize,
    junctions: Vec<Arc<dyn AsyncJunction>>,
    runs: Vec<TaskStageRun>,
}

impl AsyncWiring {
    fn attach<I, O>(
        &mut self,
        index: usize,
        config: &StageConfig,
        input: Arc<AsyncBoundedQueue<Envelope<I>>>,
        func: &AsyncStageFn<I, O>,
    ) -> Arc<AsyncBoundedQueue<Envelope<O>>>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let output = Arc::new(match self.stages.get(index + 1) {
            Some(next) => AsyncBoundedQueue::new(format!("{}.in", next.name), next.capacity),
            None => AsyncBoundedQueue::new("output", self.output_capacity),
        });
        self.junctions.push(output.clone());

        let handles = (0..config.workers)
            .map(|worker| spawn_task_worker(&config.name, worker, input.clone(), output.clone(), func.clone()))
            .collect();
        self.runs.push(TaskStageRun {
            name: config.name.clone(),
            input,
            handles,
        });
        output
    }
}

/// Builder for [`AsyncPipeline`]s.
///
/// ```
/// use conveyor::pipeline::{AsyncPipelineBuilder, StageConfig};
///
/// let pipeline = AsyncPipelineBuilder::new("fetch")
///     .stage(StageConfig::new("lookup").with_workers(8), |id: u32| async move {
///         anyhow::Ok(format!("user-{id}"))
///     })
///     .build()
///     .unwrap();
///
/// let report = pipeline.run_blocking(0..3).unwrap();
/// assert_eq!(report.succeeded(), 3);
/// ```
pub struct AsyncPipelineBuilder<In, Out> {
    config: PipelineConfig,
    wire: AsyncWire<In, Out>,
}

impl<T: Send + 'static> AsyncPipelineBuilder<T, T> {
    /// Creates a new builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: PipelineConfig::new(name),
            wire: Box::new(|_, ingest| ingest),
        }
    }
}

impl<In, Out> AsyncPipelineBuilder<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Appends a stage running an async function on cooperative tasks.
    #[must_use]
    pub fn stage<Next, F, Fut>(self, config: StageConfig, func: F) -> AsyncPipelineBuilder<In, Next>
    where
        Next: Send + 'static,
        F: Fn(Out) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Next>> + Send + 'static,
    {
        let func: AsyncStageFn<Out, Next> = Arc::new(move |item| func(item).boxed());
        let Self {
            config: mut pipeline,
            wire: upstream,
        } = self;

        let index = pipeline.stages.len();
        let stage = config.clone();
        let wire: AsyncWire<In, Next> = Box::new(move |wiring: &mut AsyncWiring, ingest| {
            let input = upstream(wiring, ingest);
            wiring.attach(index, &stage, input, &func)
        });

        pipeline.stages.push(config);
        AsyncPipelineBuilder { config: pipeline, wire }
    }

    /// Sets the bound of the terminal queue (`0` means unbounded).
    #[must_use]
    pub fn output_capacity(mut self, capacity: usize) -> Self {
        self.config.output_capacity = capacity;
        self
    }

    /// Sets the order in which results are reported.
    #[must_use]
    pub fn order(mut self, order: OrderPolicy) -> Self {
        self.config.order = order;
        self
    }

    /// Validates the configuration and builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline has no stages, a stage has no
    /// workers, or stage names are blank or repeated.
    pub fn build(self) -> Result<AsyncPipeline<In, Out>, PipelineValidationError> {
        self.config.validate()?;
        Ok(AsyncPipeline {
            config: self.config,
            wire: self.wire,
        })
    }
}

/// A validated pipeline of cooperative stages.
pub struct AsyncPipeline<In, Out> {
    config: PipelineConfig,
    wire: AsyncWire<In, Out>,
}

impl<In, Out> AsyncPipeline<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
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

    /// Runs the pipeline on the caller's runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConveyorError::WorkerPanicked`] if a task died outside of a
    /// stage function.
    pub async fn run<I>(&self, items: I) -> Result<PipelineReport<Out>>
    where
        I: IntoIterator<Item = In>,
    {
        let record = RunRecord::start(&self.config.name);
        let span = info_span!("pipeline", pipeline = %self.config.name, run_id = %record.run_id);
        self.run_in_span(record, items).instrument(span).await
    }

    /// Runs the pipeline on a fresh single-threaded runtime, blocking the
    /// caller until it finishes.
    ///
    /// # Errors
    ///
    /// Returns [`ConveyorError::Runtime`] when called from inside a tokio
    /// runtime (use [`run`](Self::run) there), [`ConveyorError::Io`] if the
    /// runtime cannot be built, plus everything `run` returns.
    pub fn run_blocking<I>(&self, items: I) -> Result<PipelineReport<Out>>
    where
        I: IntoIterator<Item = In>,
    {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(ConveyorError::Runtime(format!(
                "run_blocking on pipeline '{}' called from inside a tokio runtime; await run() instead",
                self.config.name
            )));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run(items))
    }

    async fn run_in_span<I>(&self, mut record: RunRecord, items: I) -> Result<PipelineReport<Out>>
    where
        I: IntoIterator<Item = In>,
    {
        info!(
            stages = self.config.stages.len(),
            backend = %ExecutionBackend::Cooperative,
            "pipeline run started"
        );

        let first = &self.config.stages[0];
        let ingest = Arc::new(AsyncBoundedQueue::new(format!("{}.in", first.name), first.capacity));
        let mut wiring = AsyncWiring {
            stages: self.config.stages.clone(),
            output_capacity: self.config.output_capacity,
            junctions: vec![ingest.clone() as Arc<dyn AsyncJunction>],
            runs: Vec::with_capacity(self.config.stages.len()),
        };
        let terminal = (self.wire)(&mut wiring, ingest.clone());
        let collector = spawn_collector(terminal.clone());

        for item in items {
            if ingest.put(Envelope::new(record.submitted, item)).await.is_err() {
                return Err(QueueUsageError::PutAfterShutdown {
                    queue: ingest.name().to_string(),
                }
                .into());
            }
            record.submitted += 1;
        }

        drain_in_order_async(&wiring.junctions).await;

        let mut panicked = None;
        let mut stages = Vec::with_capacity(wiring.runs.len());
        for run in wiring.runs {
            let mut workers = Vec::with_capacity(run.handles.len());
            for (index, handle) in run.handles.into_iter().enumerate() {
                match handle.await {
                    Ok(stats) => workers.push(stats),
                    Err(err) => {
                        let worker = format!("{}-{index}", run.name);
                        let message = if err.is_panic() {
                            panic_message(err.into_panic().as_ref())
                        } else {
                            err.to_string()
                        };
                        error!(worker = %worker, panic = %message, "task terminated abnormally");
                        panicked.get_or_insert(ConveyorError::WorkerPanicked { worker, message });
                    }
                }
            }
            stages.push(StageReport::from_workers(
                &run.name,
                ExecutionBackend::Cooperative,
                run.input.stats(),
                &workers,
            ));
        }

        let collected = collector.await.map_err(|err| ConveyorError::WorkerPanicked {
            worker: format!("{}-collector", self.config.name),
            message: err.to_string(),
        })?;
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

fn spawn_collector<U: Send + 'static>(
    terminal: Arc<AsyncBoundedQueue<Envelope<U>>>,
) -> JoinHandle<Vec<Envelope<U>>> {
    tokio::spawn(async move {
        let mut collected = Vec::new();
        while let Ok(envelope) = terminal.get().await {
            let _ack = TaskGuard::new(&*terminal);
            if let Err(err) = &envelope.body {
                warn!(seq = err.seq, stage = %err.stage, kind = %err.kind, "item reached the end as an error");
            }
            collected.push(envelope);
        }
        collected
    })
}

impl<In, Out> std::fmt::Debug for AsyncPipeline<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<In, Out> std::fmt::Debug for AsyncPipelineBuilder<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPipelineBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
