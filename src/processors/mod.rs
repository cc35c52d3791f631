//! Ordered, stateful transformation stages
//!
//! Pre-stages rewrite the raw `{entity: value}` reading before it is stored
//! or predicted on. Post-stages rewrite (or suppress) the prediction before
//! it is published. Both kinds are built from persisted
//! `ProcessorDefinition`s through the static registry.

pub mod pipeline;
pub mod post;
pub mod pre;
pub mod registry;
pub mod selector;

pub use pipeline::{PostprocessorPipeline, PreprocessorPipeline, StageSnapshot};
pub use registry::{
    available_postprocessors, available_preprocessors, create_postprocessor, create_preprocessor,
    ProcessorInfo,
};
pub use selector::FieldSelector;

use crate::classifier::Prediction;
use crate::store::ProcessorDefinition;
use crate::types::{Fields, Reading};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("unknown processor type '{0}'")]
    UnknownType(String),

    #[error("invalid configuration for {type_name}: {reason}")]
    InvalidConfig { type_name: String, reason: String },

    #[error("corrupt state for processor {id}: {source}")]
    State {
        id: i64,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration every stage carries regardless of its type.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub id: i64,
    pub params: Value,
    pub selector: FieldSelector,
}

impl StageConfig {
    pub fn from_definition(definition: &ProcessorDefinition) -> Result<Self, ProcessorError> {
        let selector = FieldSelector::from_params(&definition.params).map_err(|reason| {
            ProcessorError::InvalidConfig {
                type_name: definition.type_name.clone(),
                reason,
            }
        })?;
        Ok(Self {
            id: definition.id,
            params: definition.params.clone(),
            selector,
        })
    }

    /// Deserialize the type-specific part of `params`.
    pub fn typed_params<P: DeserializeOwned>(&self, type_name: &str) -> Result<P, ProcessorError> {
        serde_json::from_value(self.params.clone()).map_err(|e| ProcessorError::InvalidConfig {
            type_name: type_name.to_string(),
            reason: e.to_string(),
        })
    }
}

/// A stage applied to raw readings before storage and prediction.
pub trait Preprocessor: Send {
    fn config(&self) -> &StageConfig;

    fn info(&self) -> &'static ProcessorInfo;

    /// One-line human description of this stage's configuration.
    fn describe(&self) -> String;

    /// Transform `reading`. `state` is this stage's persisted slot and
    /// survives across messages. An empty result drops the message.
    fn process(&self, reading: &Reading, state: &mut Map<String, Value>) -> Result<Reading, ProcessorError>;

    fn id(&self) -> i64 {
        self.config().id
    }

    fn type_name(&self) -> &'static str {
        self.info().type_name
    }

    fn params(&self) -> &Value {
        &self.config().params
    }

    fn can_consume(&self, field: &str) -> bool {
        self.config().selector.selects(field)
    }
}

/// A stage applied to predictions before they are published.
pub trait Postprocessor: Send {
    fn config(&self) -> &StageConfig;

    fn info(&self) -> &'static ProcessorInfo;

    fn describe(&self) -> String;

    /// Returning `None` suppresses the prediction and stops the chain.
    fn process(&mut self, fields: &Fields, prediction: Prediction) -> Option<Prediction>;

    fn id(&self) -> i64 {
        self.config().id
    }

    fn type_name(&self) -> &'static str {
        self.info().type_name
    }

    fn params(&self) -> &Value {
        &self.config().params
    }

    fn can_consume(&self, field: &str) -> bool {
        self.config().selector.selects(field)
    }
}

/// Read a typed value out of a stage's state slot. Missing keys give the default.
pub(crate) fn load_state<T: DeserializeOwned + Default>(
    id: i64,
    state: &Map<String, Value>,
    key: &str,
) -> Result<T, ProcessorError> {
    match state.get(key) {
        Some(value) => {
            serde_json::from_value(value.clone()).map_err(|source| ProcessorError::State { id, source })
        }
        None => Ok(T::default()),
    }
}

pub(crate) fn store_state<T: Serialize>(
    id: i64,
    state: &mut Map<String, Value>,
    key: &str,
    value: &T,
) -> Result<(), ProcessorError> {
    let encoded = serde_json::to_value(value).map_err(|source| ProcessorError::State { id, source })?;
    state.insert(key.to_string(), encoded);
    Ok(())
}
