use crate::processors::{Preprocessor, ProcessorError, ProcessorInfo, StageConfig};
use crate::types::{parse_number, FieldValue, Reading};
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReplacementType {
    Float,
    String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NullHandlerParams {
    replacement_type: ReplacementType,
    null_replacement: Value,
}

/// Replaces absent values with a configured constant.
pub struct NullHandler {
    config: StageConfig,
    replacement: FieldValue,
}

impl NullHandler {
    pub const TYPE: &'static str = "null_handler";
    pub const INFO: ProcessorInfo = ProcessorInfo {
        type_name: Self::TYPE,
        name: "Null Handler",
        description: "Replaces None values with predefined value suitable for an ML model.",
    };

    pub fn new(config: StageConfig) -> Result<Self, ProcessorError> {
        let params: NullHandlerParams = config.typed_params(Self::TYPE)?;
        let raw = match &params.null_replacement {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(ProcessorError::InvalidConfig {
                    type_name: Self::TYPE.to_string(),
                    reason: format!("nullReplacement must be a string or number, got {}", other),
                })
            }
        };

        let replacement = match params.replacement_type {
            ReplacementType::Float => match parse_number(&raw) {
                Some(number) => FieldValue::Number(number),
                None => {
                    return Err(ProcessorError::InvalidConfig {
                        type_name: Self::TYPE.to_string(),
                        reason: format!("'{}' is not a float", raw),
                    })
                }
            },
            ReplacementType::String => FieldValue::Text(raw),
        };

        Ok(Self { config, replacement })
    }
}

impl Preprocessor for NullHandler {
    fn config(&self) -> &StageConfig {
        &self.config
    }

    fn info(&self) -> &'static ProcessorInfo {
        &Self::INFO
    }

    fn describe(&self) -> String {
        match &self.replacement {
            FieldValue::Number(n) => format!("I will change values of None to {}", n),
            FieldValue::Text(s) => format!("I will change values of None to '{}'", s),
        }
    }

    fn process(&self, reading: &Reading, _state: &mut Map<String, Value>) -> Result<Reading, ProcessorError> {
        let mut result = reading.clone();
        for (field, value) in result.iter_mut() {
            if value.is_none() && self.can_consume(field) {
                *value = Some(self.replacement.clone());
            }
        }
        Ok(result)
    }
}
