//! Field selection shared by every stage.
//!
//! Stages pick the fields they act on through a `sensor` list in their
//! params: `[{"SELECT_ALL": true}]` or `[{"entity": "temp"}, ...]`.

use serde_json::Value;
use std::collections::BTreeSet;

pub const SENSOR_KEY: &str = "sensor";
pub const SELECT_ALL_KEY: &str = "SELECT_ALL";
pub const ENTITY_KEY: &str = "entity";

#[derive(Debug, Clone, PartialEq)]
pub enum FieldSelector {
    All,
    Named(BTreeSet<String>),
}

impl FieldSelector {
    /// Parse the selector out of a stage's params. No `sensor` key selects everything.
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let sensors = match params.get(SENSOR_KEY) {
            None | Some(Value::Null) => return Ok(FieldSelector::All),
            Some(Value::Array(items)) => items,
            Some(other) => return Err(format!("'{}' must be a list, got {}", SENSOR_KEY, other)),
        };

        let mut names = BTreeSet::new();
        for item in sensors {
            if item.get(SELECT_ALL_KEY).and_then(Value::as_bool) == Some(true) {
                return Ok(FieldSelector::All);
            }
            match item.get(ENTITY_KEY).and_then(Value::as_str) {
                Some(name) => {
                    names.insert(name.to_string());
                }
                None => return Err(format!("unrecognised sensor entry {}", item)),
            }
        }
        Ok(FieldSelector::Named(names))
    }

    pub fn selects(&self, field: &str) -> bool {
        match self {
            FieldSelector::All => true,
            FieldSelector::Named(names) => names.contains(field),
        }
    }

    /// Short rendering used by `describe()`.
    pub fn summary(&self) -> String {
        match self {
            FieldSelector::All => "all fields".to_string(),
            FieldSelector::Named(names) => names.iter().cloned().collect::<Vec<_>>().join(", "),
        }
    }
}
