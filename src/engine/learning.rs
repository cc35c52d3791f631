use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// When a labeled message turns into a stored observation and a retrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LearningType {
    /// Labels are ignored.
    #[default]
    Disabled,
    /// Store and retrain only when the current model gets the label wrong
    /// (or cannot predict at all yet).
    Lazy,
    /// Store and retrain on every labeled message.
    Eager,
}

impl LearningType {
    pub fn as_str(self) -> &'static str {
        match self {
            LearningType::Disabled => "DISABLED",
            LearningType::Lazy => "LAZY",
            LearningType::Eager => "EAGER",
        }
    }
}

impl fmt::Display for LearningType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LearningType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DISABLED" => Ok(LearningType::Disabled),
            "LAZY" => Ok(LearningType::Lazy),
            "EAGER" => Ok(LearningType::Eager),
            other => Err(format!("unknown learning type '{}'", other)),
        }
    }
}
