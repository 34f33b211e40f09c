//! Pipeline and stage configuration.

use crate::errors::{ConveyorError, PipelineValidationError};
use crate::worker::ProcessCommand;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

fn default_workers() -> usize {
    1
}

/// Order in which a run reports its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderPolicy {
    /// The order results reached the terminal queue.
    #[default]
    Arrival,
    /// Submission order, regardless of stage width.
    Submission,
}

/// Configuration of a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// The unique name of the stage.
    pub name: String,
    /// Number of workers sharing the stage's queues.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bound of the stage's input queue (`0` means unbounded).
    #[serde(default)]
    pub capacity: usize,
}

impl StageConfig {
    /// Creates a stage with one worker and an unbounded input queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workers: default_workers(),
            capacity: 0,
        }
    }

    /// Sets the number of workers.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the input queue bound.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Validates the stage configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or the stage has no workers.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new(
                "Stage name cannot be empty or whitespace-only",
            ));
        }
        if self.workers == 0 {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' must have at least one worker",
                self.name
            ))
            .with_stages(vec![self.name.clone()])
            .with_fix_hint("Set `workers` to 1 or more."));
        }
        Ok(())
    }
}

/// Configuration of an entire pipeline.
///
/// Loadable from JSON:
///
/// ```
/// use conveyor::pipeline::{OrderPolicy, PipelineConfig};
///
/// let config = PipelineConfig::from_json(r#"{
///     "name": "photos",
///     "order": "submission",
///     "stages": [
///         {"name": "download", "workers": 4, "capacity": 16},
///         {"name": "resize"}
///     ]
/// }"#).unwrap();
///
/// assert_eq!(config.order, OrderPolicy::Submission);
/// assert_eq!(config.stage("resize").unwrap().workers, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// The pipeline name.
    pub name: String,
    /// Bound of the terminal queue (`0` means unbounded).
    #[serde(default)]
    pub output_capacity: usize,
    /// Result ordering.
    #[serde(default)]
    pub order: OrderPolicy,
    /// Stages, in data flow order.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    /// Child process commands for process stages, keyed by stage name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commands: BTreeMap<String, ProcessCommand>,
}

impl PipelineConfig {
    /// Creates an empty pipeline configuration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output_capacity: 0,
            order: OrderPolicy::default(),
            stages: Vec::new(),
            commands: BTreeMap::new(),
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    /// Sets the terminal queue bound.
    #[must_use]
    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity;
        self
    }

    /// Sets the result ordering.
    #[must_use]
    pub fn with_order(mut self, order: OrderPolicy) -> Self {
        self.order = order;
        self
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConveyorError::Config`] if the document is malformed and
    /// [`ConveyorError::Validation`] if it describes an invalid pipeline.
    pub fn from_json(json: &str) -> Result<Self, ConveyorError> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| ConveyorError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Looks up a stage by name.
    ///
    /// # Errors
    ///
    /// Returns an error if no stage has that name.
    pub fn stage(&self, name: &str) -> Result<&StageConfig, PipelineValidationError> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .ok_or_else(|| self.unknown_stage(name))
    }

    /// Looks up the child process command of a process stage.
    ///
    /// # Errors
    ///
    /// Returns an error if no command is configured for that stage.
    pub fn command(&self, name: &str) -> Result<&ProcessCommand, PipelineValidationError> {
        self.commands.get(name).ok_or_else(|| {
            PipelineValidationError::new(format!("No command configured for stage '{name}'"))
                .with_stages(vec![name.to_string()])
                .with_fix_hint("Add the stage to the `commands` table.")
        })
    }

    /// Validates the whole pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline is unnamed or empty, if any stage is
    /// invalid, if two stages share a name, or if a command refers to an
    /// unknown stage.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new(
                "Pipeline name cannot be empty or whitespace-only",
            ));
        }
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "Pipeline '{}' has no stages",
                self.name
            ))
            .with_fix_hint("Add at least one stage to the pipeline before building."));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            stage.validate()?;
            if !seen.insert(stage.name.as_str()) {
                return Err(PipelineValidationError::new(format!(
                    "Duplicate stage name '{}'",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone()])
                .with_fix_hint("Stage names are used for queue and thread names and must be unique."));
            }
        }

        for name in self.commands.keys() {
            if !seen.contains(name.as_str()) {
                return Err(self.unknown_stage(name));
            }
        }
        Ok(())
    }

    fn unknown_stage(&self, name: &str) -> PipelineValidationError {
        PipelineValidationError::new(format!(
            "Pipeline '{}' has no stage named '{name}'",
            self.name
        ))
        .with_stages(vec![name.to_string()])
    }
}
