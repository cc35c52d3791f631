//! Core value types shared by the store, the processors and the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use indexmap::IndexMap;
use std::fmt;

/// A single sensor value as it travels through the system.
///
/// Readings arrive as strings from MQTT; the type-caster pre-stage turns
/// numeric strings into `Number`. Anything that stays textual is categorical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value. Text is parsed the same way kind inference does.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => parse_number(s),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Number(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// Parse a string as a float the way sensor values are interpreted
/// (surrounding whitespace is ignored, integers and decimals both accepted).
/// `nan` and infinities are not numbers here.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Map of entity name to value as it flows through the pre-stage pipeline.
/// `None` is an absent value (e.g. `"unavailable"` after type casting).
/// Keeps message order, which decides the layout slot of new entities.
pub type Reading = IndexMap<String, Option<FieldValue>>;

/// Map of entity name to a present value. This is what gets stored,
/// trained on and predicted from.
pub type Fields = IndexMap<String, FieldValue>;

/// Drop absent values from a pipeline reading.
pub fn present_fields(reading: &Reading) -> Fields {
    reading
        .iter()
        .filter_map(|(name, value)| value.clone().map(|v| (name.clone(), v)))
        .collect()
}

/// Value kind of an entity, decided once on first sight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Numeric,
    Categorical,
}

impl EntityKind {
    /// Numeric if the sample parses as a float, categorical otherwise.
    pub fn infer(sample: &FieldValue) -> Self {
        match sample {
            FieldValue::Number(_) => EntityKind::Numeric,
            FieldValue::Text(s) => {
                if parse_number(s).is_some() {
                    EntityKind::Numeric
                } else {
                    EntityKind::Categorical
                }
            }
        }
    }

    /// Column code persisted in the `entity_keys` table.
    pub fn code(self) -> i64 {
        match self {
            EntityKind::Numeric => 1,
            EntityKind::Categorical => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(EntityKind::Numeric),
            2 => Some(EntityKind::Categorical),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            EntityKind::Numeric => "float",
            EntityKind::Categorical => "string",
        }
    }
}

/// A registered sensor name with its inferred kind and layout position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityKey {
    pub name: String,
    pub kind: EntityKind,
    pub order_index: i64,
    /// Feature importance reported by the classifier; filled in by the engine.
    pub significance: f64,
}

/// One stored, labeled snapshot of entity values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Epoch seconds; not unique.
    pub timestamp: f64,
    pub label: String,
    pub fields: Fields,
}

impl Observation {
    pub fn new(timestamp: f64, label: impl Into<String>, fields: Fields) -> Self {
        Self {
            timestamp,
            label: label.into(),
            fields,
        }
    }

    /// RFC 3339 rendering of the timestamp in UTC.
    pub fn display_time(&self) -> String {
        let secs = self.timestamp.floor() as i64;
        let nanos = ((self.timestamp - self.timestamp.floor()) * 1e9) as u32;
        DateTime::<Utc>::from_timestamp(secs, nanos)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default()
    }
}

/// Round half away from zero to `places` decimals.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Current wall-clock time as fractional epoch seconds.
pub fn now_epoch_seconds() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}
