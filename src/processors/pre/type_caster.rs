use crate::processors::{Preprocessor, ProcessorError, ProcessorInfo, StageConfig};
use crate::types::{FieldValue, Reading};
use serde_json::{Map, Value};

/// States that mean "no reading" rather than a real value.
const UNKNOWN_STATES: &[&str] = &["unknown", "unavailable", "none", "null"];

/// Converts numeric strings to numbers and unknown states to absent.
///
/// `nan` and infinities count as unknown states.
pub struct TypeCaster {
    config: StageConfig,
}

impl TypeCaster {
    pub const TYPE: &'static str = "type_caster";
    pub const INFO: ProcessorInfo = ProcessorInfo {
        type_name: Self::TYPE,
        name: "Type Caster",
        description: "Converts string values to floats and replaces 'unknown' and 'unavailable' with None",
    };

    pub fn new(config: StageConfig) -> Self {
        Self { config }
    }

    fn cast(value: &FieldValue) -> Option<FieldValue> {
        match value {
            FieldValue::Text(text) => {
                if UNKNOWN_STATES.iter().any(|s| text.eq_ignore_ascii_case(s)) {
                    return None;
                }
                match text.trim().parse::<f64>() {
                    Ok(number) if number.is_finite() => Some(FieldValue::Number(number)),
                    Ok(_) => None,
                    Err(_) => Some(value.clone()),
                }
            }
            FieldValue::Number(number) => number.is_finite().then(|| value.clone()),
        }
    }
}

impl Preprocessor for TypeCaster {
    fn config(&self) -> &StageConfig {
        &self.config
    }

    fn info(&self) -> &'static ProcessorInfo {
        &Self::INFO
    }

    fn describe(&self) -> String {
        format!(
            "I will convert numeric strings to numbers and unknown states to None for {}",
            self.config.selector.summary()
        )
    }

    fn process(&self, reading: &Reading, _state: &mut Map<String, Value>) -> Result<Reading, ProcessorError> {
        let mut result = reading.clone();
        for (field, value) in result.iter_mut() {
            if !self.can_consume(field) {
                continue;
            }
            if let Some(current) = value.as_ref() {
                *value = Self::cast(current);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::FieldSelector;

    fn caster(selector: FieldSelector) -> TypeCaster {
        TypeCaster::new(StageConfig {
            id: 1,
            params: Value::Null,
            selector,
        })
    }

    #[test]
    fn test_casts_numbers_and_unknowns() {
        let mut reading = Reading::new();
        reading.insert("temp".into(), Some("21.5".into()));
        reading.insert("door".into(), Some("open".into()));
        reading.insert("motion".into(), Some("Unavailable".into()));
        reading.insert("lux".into(), Some("NULL".into()));

        let result = caster(FieldSelector::All).process(&reading, &mut Map::new()).unwrap();
        assert_eq!(result["temp"], Some(FieldValue::Number(21.5)));
        assert_eq!(result["door"], Some(FieldValue::Text("open".into())));
        assert_eq!(result["motion"], None);
        assert_eq!(result["lux"], None);
    }

    #[test]
    fn test_skips_unselected_fields() {
        let mut reading = Reading::new();
        reading.insert("temp".into(), Some("21.5".into()));
        reading.insert("humidity".into(), Some("40".into()));

        let selector = FieldSelector::Named(["temp".to_string()].into_iter().collect());
        let result = caster(selector).process(&reading, &mut Map::new()).unwrap();
        assert_eq!(result["temp"], Some(FieldValue::Number(21.5)));
        assert_eq!(result["humidity"], Some(FieldValue::Text("40".into())));
    }

    #[test]
    fn test_non_finite_numbers_become_absent() {
        let mut reading = Reading::new();
        reading.insert("a".into(), Some("nan".into()));
        reading.insert("b".into(), Some("-Infinity".into()));
        reading.insert("c".into(), Some(FieldValue::Number(f64::INFINITY)));

        let result = caster(FieldSelector::All).process(&reading, &mut Map::new()).unwrap();
        assert_eq!(result["a"], None);
        assert_eq!(result["b"], None);
        assert_eq!(result["c"], None);
    }
}
