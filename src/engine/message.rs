//! Wire format of model traffic.
//!
//! Inbound (`<topic>/set`): a JSON array of `{"label": ...}` and
//! `{"entity_id": ..., "state": ...}` elements. Outbound (`<topic>/state`):
//! `{"state": label, "confidence": number}`.

use super::EngineError;
use crate::classifier::Prediction;
use crate::types::{FieldValue, Reading};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Label value meaning "no training signal".
pub const DISABLED_LABEL: &str = "disabled";

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// `None` when the message carries no label or the disabled sentinel.
    pub label: Option<String>,
    pub reading: Reading,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub state: String,
    pub confidence: f64,
}

impl From<&Prediction> for OutboundMessage {
    fn from(prediction: &Prediction) -> Self {
        Self {
            state: prediction.label.clone(),
            confidence: prediction.confidence,
        }
    }
}

fn state_value(raw: &Value) -> Option<FieldValue> {
    match raw {
        Value::Null => None,
        Value::String(s) => Some(FieldValue::Text(s.clone())),
        Value::Number(n) => n.as_f64().map(FieldValue::Number),
        other => Some(FieldValue::Text(other.to_string())),
    }
}

fn label_value(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse an inbound payload. A later label element overrides an earlier one.
pub fn parse_inbound(payload: &str) -> Result<InboundMessage, EngineError> {
    let elements: Vec<Value> =
        serde_json::from_str(payload).map_err(|e| EngineError::MalformedMessage(format!("invalid JSON: {}", e)))?;

    let mut label = None;
    let mut reading = Reading::new();
    for element in &elements {
        let Some(object) = element.as_object() else {
            return Err(EngineError::MalformedMessage(format!("element {} is not an object", element)));
        };

        if let Some(raw) = object.get("label") {
            label = Some(label_value(raw));
        } else if let (Some(entity), Some(state)) = (object.get("entity_id"), object.get("state")) {
            let Some(entity) = entity.as_str() else {
                return Err(EngineError::MalformedMessage(format!("entity_id {} is not a string", entity)));
            };
            reading.insert(entity.to_string(), state_value(state));
        } else {
            log::debug!("Ignoring element without label or entity_id/state: {}", element);
        }
    }

    Ok(InboundMessage {
        label: label.filter(|l| l != DISABLED_LABEL),
        reading,
    })
}

pub fn encode_outbound(prediction: &Prediction) -> Result<String, EngineError> {
    Ok(serde_json::to_string(&OutboundMessage::from(prediction))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reading_and_label() {
        let msg = parse_inbound(r#"[{"entity_id":"temp","state":"21.5"},{"label":"cold"}]"#).unwrap();
        assert_eq!(msg.label.as_deref(), Some("cold"));
        assert_eq!(msg.reading["temp"], Some(FieldValue::Text("21.5".into())));
    }

    #[test]
    fn test_disabled_label_is_no_label() {
        let msg = parse_inbound(r#"[{"entity_id":"temp","state":"1"},{"label":"disabled"}]"#).unwrap();
        assert_eq!(msg.label, None);
    }

    #[test]
    fn test_non_string_states() {
        let msg = parse_inbound(r#"[{"entity_id":"a","state":3},{"entity_id":"b","state":null},{"entity_id":"c","state":true}]"#)
            .unwrap();
        assert_eq!(msg.reading["a"], Some(FieldValue::Number(3.0)));
        assert_eq!(msg.reading["b"], None);
        assert_eq!(msg.reading["c"], Some(FieldValue::Text("true".into())));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(parse_inbound("not json"), Err(EngineError::MalformedMessage(_))));
        assert!(matches!(parse_inbound(r#"{"label":"x"}"#), Err(EngineError::MalformedMessage(_))));
        assert!(matches!(parse_inbound(r#"[1, 2]"#), Err(EngineError::MalformedMessage(_))));
        assert!(matches!(
            parse_inbound(r#"[{"entity_id": 5, "state": "x"}]"#),
            Err(EngineError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_outbound_shape() {
        let encoded = encode_outbound(&Prediction::new("home", 0.75)).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, serde_json::json!({"state": "home", "confidence": 0.75}));
    }
}
