use crate::processors::{load_state, store_state, Preprocessor, ProcessorError, ProcessorInfo, StageConfig};
use crate::types::{round_to, FieldValue, Reading};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};

const STATE_KEY: &str = "rollingData";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RollingAverageParams {
    window_size: usize,
}

/// Replaces each numeric field with the mean of its last `windowSize` values.
///
/// Absent, non-numeric and non-finite values pass through untouched and
/// leave the field's window as it was. A field that turns categorical keeps
/// its numeric window for when numbers come back.
pub struct RollingAverage {
    config: StageConfig,
    window_size: usize,
}

impl RollingAverage {
    pub const TYPE: &'static str = "rolling_average";
    pub const INFO: ProcessorInfo = ProcessorInfo {
        type_name: Self::TYPE,
        name: "Rolling Average",
        description: "Calculates rolling averages over a specified window size for each entity in the observations.",
    };

    pub fn new(config: StageConfig) -> Result<Self, ProcessorError> {
        let params: RollingAverageParams = config.typed_params(Self::TYPE)?;
        if params.window_size == 0 {
            return Err(ProcessorError::InvalidConfig {
                type_name: Self::TYPE.to_string(),
                reason: "windowSize must be at least 1".to_string(),
            });
        }
        Ok(Self {
            config,
            window_size: params.window_size,
        })
    }
}

impl Preprocessor for RollingAverage {
    fn config(&self) -> &StageConfig {
        &self.config
    }

    fn info(&self) -> &'static ProcessorInfo {
        &Self::INFO
    }

    fn describe(&self) -> String {
        format!(
            "I will calculate a rolling average over a window size of {} observations.",
            self.window_size
        )
    }

    fn process(&self, reading: &Reading, state: &mut Map<String, Value>) -> Result<Reading, ProcessorError> {
        let mut windows: BTreeMap<String, VecDeque<f64>> = load_state(self.id(), state, STATE_KEY)?;
        let mut result = reading.clone();

        for (field, value) in result.iter_mut() {
            if !self.can_consume(field) {
                continue;
            }
            let Some(number) = value.as_ref().and_then(FieldValue::as_f64) else {
                continue;
            };
            if !number.is_finite() {
                continue;
            }

            let window = windows.entry(field.clone()).or_default();
            window.push_back(number);
            while window.len() > self.window_size {
                window.pop_front();
            }
            let mean = window.iter().sum::<f64>() / window.len() as f64;
            *value = Some(FieldValue::Number(round_to(mean, 4)));
        }

        store_state(self.id(), state, STATE_KEY, &windows)?;
        Ok(result)
    }
}
