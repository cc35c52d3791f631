//! Classifier contract used by the engine
//!
//! The engine never mutates a live classifier while predicting with it: on
//! every retrain it builds a fresh instance through a `ClassifierFactory`,
//! trains it, and only then swaps it in.

pub mod knn;

pub use knn::KnnClassifier;

use crate::store::settings::DEFAULT_MODEL_TYPE;
use crate::types::{round_to, Fields, Observation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A predicted label with its confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
}

impl Prediction {
    /// Confidence is rounded to 4 decimals.
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence: round_to(confidence, 4),
        }
    }
}

/// Per-label evaluation figures on the hold-out split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelStats {
    pub support: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

pub trait Classifier: Send {
    /// The `model_type` tag this implementation answers to.
    fn kind(&self) -> &'static str;

    /// Full repopulation from the corpus. Too little data leaves it untrained.
    fn train(&mut self, observations: &[Observation]);

    fn is_trained(&self) -> bool;

    /// `None` when untrained.
    fn predict(&self, fields: &Fields) -> Option<Prediction>;

    fn feature_importance(&self) -> Option<BTreeMap<String, f64>>;

    fn accuracy(&self) -> Option<f64>;

    fn label_statistics(&self) -> Option<BTreeMap<String, LabelStats>>;

    /// Search for better hyper-parameters, adopt them, and return them.
    fn optimize_hyperparameters(&mut self, observations: &[Observation]) -> Value;

    fn parameters(&self) -> Value;

    fn set_parameters(&mut self, params: &Value);
}

/// Builds an untrained classifier for a `model_type` and its parameters.
pub type ClassifierFactory = Arc<dyn Fn(&str, &Value) -> Box<dyn Classifier> + Send + Sync>;

/// The built-in factory. Unknown model types fall back to KNN.
pub fn build(model_type: &str, params: &Value) -> Box<dyn Classifier> {
    if !model_type.eq_ignore_ascii_case(KnnClassifier::KIND) {
        log::warn!(
            "Unknown model type '{}', falling back to {}",
            model_type,
            DEFAULT_MODEL_TYPE
        );
    }
    let mut classifier = KnnClassifier::default();
    classifier.set_parameters(params);
    Box::new(classifier)
}

pub fn default_factory() -> ClassifierFactory {
    Arc::new(build)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prediction_rounds_confidence() {
        assert_eq!(Prediction::new("A", 2.0 / 3.0).confidence, 0.6667);
    }

    #[test]
    fn test_build_applies_parameters() {
        let classifier = build("KNN", &json!({"n_neighbors": 3}));
        assert_eq!(classifier.kind(), "KNN");
        assert_eq!(classifier.parameters()["n_neighbors"], 3);
    }

    #[test]
    fn test_unknown_type_falls_back() {
        let classifier = build("RandomForest", &Value::Null);
        assert_eq!(classifier.kind(), KnnClassifier::KIND);
        assert!(!classifier.is_trained());
    }
}
