use crate::processors::{load_state, store_state, Preprocessor, ProcessorError, ProcessorInfo, StageConfig};
use crate::types::{FieldValue, Reading};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};

const STATE_KEY: &str = "previousObservations";

#[derive(Debug, Deserialize)]
struct TemporalExpanderParams {
    lookback: usize,
}

/// Adds `field_0..field_{N-1}` columns holding the previous N raw values of
/// each selected field, oldest first. The current value stays in place.
pub struct TemporalExpander {
    config: StageConfig,
    lookback: usize,
}

impl TemporalExpander {
    pub const TYPE: &'static str = "temporal_expander";
    pub const INFO: ProcessorInfo = ProcessorInfo {
        type_name: Self::TYPE,
        name: "Temporal Expander",
        description: "Transforms a series of recent observations into distinct columns representing the current value and specified previous time steps.",
    };

    pub fn new(config: StageConfig) -> Result<Self, ProcessorError> {
        let params: TemporalExpanderParams = config.typed_params(Self::TYPE)?;
        Ok(Self {
            config,
            lookback: params.lookback,
        })
    }
}

impl Preprocessor for TemporalExpander {
    fn config(&self) -> &StageConfig {
        &self.config
    }

    fn info(&self) -> &'static ProcessorInfo {
        &Self::INFO
    }

    fn describe(&self) -> String {
        format!(
            "I will look back for {} steps and add those fields as additional columns",
            self.lookback
        )
    }

    fn process(&self, reading: &Reading, state: &mut Map<String, Value>) -> Result<Reading, ProcessorError> {
        let mut history: BTreeMap<String, VecDeque<Option<FieldValue>>> = load_state(self.id(), state, STATE_KEY)?;
        let mut result = reading.clone();

        for (field, value) in reading {
            if !self.can_consume(field) {
                continue;
            }
            let previous = history.entry(field.clone()).or_default();
            for step in 0..self.lookback {
                let past = previous.get(step).cloned().flatten();
                result.insert(format!("{}_{}", field, step), past);
            }

            previous.push_back(value.clone());
            while previous.len() > self.lookback {
                previous.pop_front();
            }
        }

        store_state(self.id(), state, STATE_KEY, &history)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::FieldSelector;
    use serde_json::json;

    fn expander(lookback: usize) -> TemporalExpander {
        TemporalExpander::new(StageConfig {
            id: 4,
            params: json!({"lookback": lookback}),
            selector: FieldSelector::All,
        })
        .unwrap()
    }

    fn temp(value: f64) -> Reading {
        let mut reading = Reading::new();
        reading.insert("temp".into(), Some(FieldValue::Number(value)));
        reading
    }

    #[test]
    fn test_first_message_has_empty_history() {
        let stage = expander(2);
        let result = stage.process(&temp(1.0), &mut Map::new()).unwrap();
        assert_eq!(result["temp"], Some(FieldValue::Number(1.0)));
        assert_eq!(result["temp_0"], None);
        assert_eq!(result["temp_1"], None);
    }

    #[test]
    fn test_history_shifts_oldest_first() {
        let stage = expander(2);
        let mut state = Map::new();
        stage.process(&temp(1.0), &mut state).unwrap();
        stage.process(&temp(2.0), &mut state).unwrap();
        let result = stage.process(&temp(3.0), &mut state).unwrap();

        assert_eq!(result["temp"], Some(FieldValue::Number(3.0)));
        assert_eq!(result["temp_0"], Some(FieldValue::Number(1.0)));
        assert_eq!(result["temp_1"], Some(FieldValue::Number(2.0)));

        let next = stage.process(&temp(4.0), &mut state).unwrap();
        assert_eq!(next["temp_0"], Some(FieldValue::Number(2.0)));
        assert_eq!(next["temp_1"], Some(FieldValue::Number(3.0)));
    }

    #[test]
    fn test_absent_values_are_remembered() {
        let stage = expander(1);
        let mut state = Map::new();
        let mut missing = Reading::new();
        missing.insert("temp".into(), None);
        stage.process(&missing, &mut state).unwrap();

        let result = stage.process(&temp(5.0), &mut state).unwrap();
        assert_eq!(result["temp_0"], None);
        assert!(result.contains_key("temp_0"));
    }
}
