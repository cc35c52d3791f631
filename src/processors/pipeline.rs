//! Pre- and post-stage pipelines
//!
//! The pre-pipeline is stateless itself: every stage's cross-message state
//! lives in a `ProcessorStorage` map keyed by stage id, which the caller
//! loads from and saves back to the store. Post-stages keep their state in
//! memory for the lifetime of the pipeline.

use super::registry::{create_postprocessor, create_preprocessor};
use super::{Postprocessor, Preprocessor, ProcessorError};
use crate::classifier::Prediction;
use crate::store::{ProcessorDefinition, ProcessorStorage};
use crate::types::{Fields, Reading};
use serde::Serialize;
use serde_json::Value;

/// What one pre-stage saw and emitted for the last replayed message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSnapshot {
    pub id: i64,
    #[serde(rename = "type")]
    pub type_name: String,
    pub params: Value,
    pub description: String,
    pub consumes: Reading,
    pub produces: Reading,
}

#[derive(Default)]
pub struct PreprocessorPipeline {
    stages: Vec<Box<dyn Preprocessor>>,
}

impl PreprocessorPipeline {
    /// Build stages from stored definitions, already sorted by rank.
    pub fn from_definitions(definitions: &[ProcessorDefinition]) -> Result<Self, ProcessorError> {
        let stages = definitions
            .iter()
            .map(create_preprocessor)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Box<dyn Preprocessor>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order. `Ok(None)` means a stage dropped the message.
    pub fn run(&self, reading: Reading, storage: &mut ProcessorStorage) -> Result<Option<Reading>, ProcessorError> {
        let mut current = reading;
        for stage in &self.stages {
            let state = storage.entry(stage.id().to_string()).or_default();
            current = stage.process(&current, state)?;
            if current.is_empty() {
                log::debug!("Message dropped by {} (id {})", stage.type_name(), stage.id());
                return Ok(None);
            }
        }
        Ok(Some(current))
    }

    /// Replay `history` oldest-first from empty state and report what each
    /// stage consumed and produced for the final message. Nothing is persisted.
    pub fn evaluate(&self, history: &[Reading]) -> Result<Vec<StageSnapshot>, ProcessorError> {
        let mut scratch = ProcessorStorage::new();
        let mut snapshots = Vec::new();

        for (position, reading) in history.iter().enumerate() {
            let is_last = position + 1 == history.len();
            let mut current = reading.clone();

            for stage in &self.stages {
                let state = scratch.entry(stage.id().to_string()).or_default();
                let produced = stage.process(&current, state)?;
                if is_last {
                    snapshots.push(StageSnapshot {
                        id: stage.id(),
                        type_name: stage.type_name().to_string(),
                        params: stage.params().clone(),
                        description: stage.describe(),
                        consumes: current.clone(),
                        produces: produced.clone(),
                    });
                }
                current = produced;
                if current.is_empty() {
                    break;
                }
            }
        }
        Ok(snapshots)
    }
}

#[derive(Default)]
pub struct PostprocessorPipeline {
    stages: Vec<Box<dyn Postprocessor>>,
}

impl PostprocessorPipeline {
    pub fn from_definitions(definitions: &[ProcessorDefinition]) -> Result<Self, ProcessorError> {
        let stages = definitions
            .iter()
            .map(create_postprocessor)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Box<dyn Postprocessor>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run stages in order; the first `None` suppresses the prediction.
    pub fn run(&mut self, fields: &Fields, prediction: Prediction) -> Option<Prediction> {
        let mut current = prediction;
        for stage in self.stages.iter_mut() {
            match stage.process(fields, current) {
                Some(next) => current = next,
                None => {
                    log::debug!("Prediction suppressed by {} (id {})", stage.type_name(), stage.id());
                    return None;
                }
            }
        }
        Some(current)
    }
}
