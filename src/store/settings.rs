//! Typed records kept in the `settings` table.
//!
//! Every record reads as its `Default` when the key has never been written.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const NAME_KEY: &str = "name";
pub const MQTT_TOPIC_KEY: &str = "mqtt_topic";
pub const MODEL_SETTINGS_KEY: &str = "model_settings";
pub const MODEL_CONFIG_KEY: &str = "model_config";
pub const LEARNING_TYPE_KEY: &str = "learning_type";
pub const HISTORY_KEY: &str = "mqtt_history";
pub const PROCESSOR_STORAGE_KEY: &str = "processor_storage";

pub const DEFAULT_MODEL_TYPE: &str = "KNN";

/// Classifier selection plus the last known hyperparameters of every type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub model_parameters: BTreeMap<String, Value>,
}

fn default_model_type() -> String {
    DEFAULT_MODEL_TYPE.to_string()
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_type: default_model_type(),
            model_parameters: BTreeMap::new(),
        }
    }
}

impl ModelSettings {
    /// Parameters of the active classifier type (`null` when never set).
    pub fn active_parameters(&self) -> Value {
        self.model_parameters
            .get(&self.model_type)
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Free-form per-model hints captured at provisioning time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub input_count: Option<u32>,
}

/// Persisted runtime state of every pre-stage, keyed by processor id.
pub type ProcessorStorage = BTreeMap<String, Map<String, Value>>;
