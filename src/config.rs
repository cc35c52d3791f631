//! Runtime configuration from environment variables

use std::env;
use std::path::PathBuf;
use thiserror::Error;

pub const MODELS_DIR_VAR: &str = "LABELFLOW_MODELS_DIR";
pub const CHANNEL_BUFFER_VAR: &str = "LABELFLOW_CHANNEL_BUFFER";
pub const INPUT_VAR: &str = "LABELFLOW_INPUT";

const DEFAULT_MODELS_DIR: &str = "models";
const DEFAULT_CHANNEL_BUFFER: usize = 1_000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },
}

/// Configuration of the replay runtime
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Directory holding one `<model>.db` per model
    pub models_dir: PathBuf,

    /// Capacity of the inbound message channel
    pub channel_buffer: usize,

    /// JSON-lines file to replay; stdin when unset
    pub input: Option<PathBuf>,

    pub rust_log: Option<String>,
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `LABELFLOW_MODELS_DIR` (default: models)
    /// - `LABELFLOW_CHANNEL_BUFFER` (default: 1000)
    /// - `LABELFLOW_INPUT` (optional)
    /// - `RUST_LOG` (optional)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` but reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let models_dir = lookup(MODELS_DIR_VAR)
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODELS_DIR));

        let channel_buffer = match lookup(CHANNEL_BUFFER_VAR) {
            None => DEFAULT_CHANNEL_BUFFER,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: CHANNEL_BUFFER_VAR,
                        value: raw,
                    })
                }
            },
        };

        let input = lookup(INPUT_VAR)
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            models_dir,
            channel_buffer,
            input,
            rust_log: lookup("RUST_LOG"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.models_dir, PathBuf::from("models"));
        assert_eq!(config.channel_buffer, 1_000);
        assert_eq!(config.input, None);
        assert_eq!(config.rust_log, None);
    }

    #[test]
    fn test_custom_config() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("LABELFLOW_MODELS_DIR", "/tmp/models"),
            ("LABELFLOW_CHANNEL_BUFFER", "50"),
            ("LABELFLOW_INPUT", "traffic.jsonl"),
            ("RUST_LOG", "debug"),
        ]))
        .unwrap();

        assert_eq!(config.models_dir, PathBuf::from("/tmp/models"));
        assert_eq!(config.channel_buffer, 50);
        assert_eq!(config.input, Some(PathBuf::from("traffic.jsonl")));
        assert_eq!(config.rust_log.as_deref(), Some("debug"));
    }

    #[test]
    fn test_invalid_buffer() {
        for bad in ["0", "lots", "-3"] {
            let err = RuntimeConfig::from_lookup(lookup_from(&[("LABELFLOW_CHANNEL_BUFFER", bad)])).unwrap_err();
            assert_eq!(
                err,
                ConfigError::InvalidValue {
                    var: CHANNEL_BUFFER_VAR,
                    value: bad.to_string()
                }
            );
        }
    }
}
