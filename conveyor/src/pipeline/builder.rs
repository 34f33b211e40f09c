//! Typed builder for thread and process pipelines.

use super::spec::{OrderPolicy, PipelineConfig, StageConfig};
use super::threaded::{Pipeline, Wire, Wiring};
use crate::backend::ExecutionBackend;
use crate::errors::PipelineValidationError;
use crate::worker::{closure_handler, Disposition, Envelope, ProcessClient, ProcessCommand, SyncStageFn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Builder for [`Pipeline`]s whose stages run on OS threads or child
/// processes.
///
/// `In` is the type submitted to the pipeline, `Out` the type produced by
/// the last stage added so far. Each stage call changes `Out`, so a
/// mismatched stage is a compile error rather than a runtime failure.
///
/// ```
/// use conveyor::pipeline::{PipelineBuilder, StageConfig};
///
/// let pipeline = PipelineBuilder::new("numbers")
///     .map(StageConfig::new("double").with_workers(2), |x: u32| x * 2)
///     .map(StageConfig::new("render"), |x: u32| x.to_string())
///     .build()
///     .unwrap();
///
/// let report = pipeline.run(1..=3).unwrap();
/// assert_eq!(report.processed, 3);
/// ```
pub struct PipelineBuilder<In, Out> {
    config: PipelineConfig,
    backends: Vec<ExecutionBackend>,
    wire: Wire<In, Out>,
}

impl<T: Send + 'static> PipelineBuilder<T, T> {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(&PipelineConfig::new(name))
    }

    /// Starts a builder that takes its name, ordering and terminal bound from
    /// `config`.
    ///
    /// Stages listed in `config` are not added; look them up with
    /// [`PipelineConfig::stage`] and pass them to the stage methods.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            config: PipelineConfig::new(config.name.clone())
                .with_output_capacity(config.output_capacity)
                .with_order(config.order),
            backends: Vec::new(),
            wire: Box::new(|_, ingest| Ok(ingest)),
        }
    }
}

impl<In, Out> PipelineBuilder<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Appends a stage running a fallible function on OS threads.
    #[must_use]
    pub fn stage<Next, F>(self, config: StageConfig, func: F) -> PipelineBuilder<In, Next>
    where
        Next: Send + 'static,
        F: Fn(Out) -> anyhow::Result<Next> + Send + Sync + 'static,
    {
        let func: SyncStageFn<Out, Next> = Arc::new(func);
        self.push(config, ExecutionBackend::Thread, move |stage| {
            closure_handler(stage, func.clone())
        })
    }

    /// Appends a stage running an infallible function on OS threads.
    #[must_use]
    pub fn map<Next, F>(self, config: StageConfig, func: F) -> PipelineBuilder<In, Next>
    where
        Next: Send + 'static,
        F: Fn(Out) -> Next + Send + Sync + 'static,
    {
        self.stage(config, move |item| Ok(func(item)))
    }

    /// Appends a stage whose workers each drive a child process.
    #[must_use]
    pub fn process_stage<Next>(self, config: StageConfig, command: ProcessCommand) -> PipelineBuilder<In, Next>
    where
        Out: Serialize,
        Next: DeserializeOwned + Send + 'static,
    {
        self.push(config, ExecutionBackend::Process, move |stage| {
            let mut client = ProcessClient::<Out, Next>::start(stage, command.clone());
            move |envelope| client.handle(envelope)
        })
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
    pub fn build(self) -> Result<Pipeline<In, Out>, PipelineValidationError> {
        self.config.validate()?;
        Ok(Pipeline::new(self.config, self.backends, self.wire))
    }

    fn push<Next, M, H>(self, config: StageConfig, backend: ExecutionBackend, make: M) -> PipelineBuilder<In, Next>
    where
        Next: Send + 'static,
        M: Fn(&str) -> H + Send + Sync + 'static,
        H: FnMut(Envelope<Out>) -> (Envelope<Next>, Disposition) + Send + 'static,
    {
        let Self {
            config: mut pipeline,
            mut backends,
            wire: upstream,
        } = self;

        let index = pipeline.stages.len();
        let stage = config.clone();
        let wire: Wire<In, Next> = Box::new(move |wiring: &mut Wiring, ingest| {
            let input = upstream(wiring, ingest)?;
            wiring.attach(index, &stage, backend, input, &make)
        });

        pipeline.stages.push(config);
        backends.push(backend);
        PipelineBuilder {
            config: pipeline,
            backends,
            wire,
        }
    }
}

impl<In, Out> std::fmt::Debug for PipelineBuilder<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("backends", &self.backends)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_empty_pipeline_fails() {
        let err = PipelineBuilder::<u8, u8>::new("empty").build().unwrap_err();
        assert!(err.message.contains("no stages"));
    }

    #[test]
    fn test_build_rejects_duplicate_names() {
        let err = PipelineBuilder::new("dupes")
            .map(StageConfig::new("step"), |x: u8| x)
            .map(StageConfig::new("step"), |x: u8| x)
            .build()
            .unwrap_err();
        assert_eq!(err.stages, vec!["step".to_string()]);
    }

    #[test]
    fn test_build_rejects_zero_workers() {
        let result = PipelineBuilder::new("idle")
            .map(StageConfig::new("nobody").with_workers(0), |x: u8| x)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_records_backends() {
        let pipeline = PipelineBuilder::new("mixed")
            .map(StageConfig::new("encode"), |x: u8| u32::from(x))
            .process_stage::<u32>(StageConfig::new("external"), ProcessCommand::new("cat"))
            .order(OrderPolicy::Submission)
            .output_capacity(4)
            .build()
            .unwrap();

        assert_eq!(
            pipeline.backends(),
            &[ExecutionBackend::Thread, ExecutionBackend::Process]
        );
        assert_eq!(pipeline.config().output_capacity, 4);
        assert_eq!(pipeline.config().order, OrderPolicy::Submission);
    }

    #[test]
    fn test_from_config_keeps_settings() {
        let config = PipelineConfig::from_json(
            r#"{"name": "cfg", "output_capacity": 2, "order": "submission", "stages": [{"name": "s", "workers": 3}]}"#,
        )
        .unwrap();

        let pipeline = PipelineBuilder::from_config(&config)
            .map(config.stage("s").unwrap().clone(), |x: i32| x)
            .build()
            .unwrap();

        assert_eq!(pipeline.name(), "cfg");
        assert_eq!(pipeline.config().stages[0].workers, 3);
        assert_eq!(pipeline.config().output_capacity, 2);
    }
}
