//! k-nearest-neighbour classifier over sparse, mixed-kind observations.
//!
//! Numeric features use Minkowski distance (`p` = 1 or 2) with absent values
//! counted as 0. Categorical features contribute 0 on a match and 1 on a
//! mismatch. Evaluation figures come from a model fitted on a seeded 70%
//! split and scored on the remaining 30%; the served model sees everything.

use super::{Classifier, LabelStats, Prediction};
use crate::types::{round_to, FieldValue, Fields, Observation};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

const SEED: u64 = 42;
const TEST_FRACTION: f64 = 0.3;
const SEARCH_DRAWS: usize = 20;
const SEARCH_FOLDS: usize = 3;
const MAX_SEARCH_NEIGHBORS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weighting {
    Uniform,
    Distance,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnnParameters {
    pub n_neighbors: usize,
    pub weights: Weighting,
    pub p: u8,
}

impl Default for KnnParameters {
    fn default() -> Self {
        Self {
            n_neighbors: 5,
            weights: Weighting::Uniform,
            p: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeatureKind {
    Numeric,
    Categorical,
}

/// Samples aligned to a fixed feature list.
#[derive(Debug, Clone)]
struct FittedModel {
    features: Vec<(String, FeatureKind)>,
    samples: Vec<Vec<Option<FieldValue>>>,
    labels: Vec<String>,
}

impl FittedModel {
    fn fit(observations: &[&Observation]) -> Self {
        let mut kinds: BTreeMap<String, FeatureKind> = BTreeMap::new();
        for obs in observations {
            for (name, value) in &obs.fields {
                let kind = kinds.entry(name.clone()).or_insert(FeatureKind::Categorical);
                if matches!(value, FieldValue::Number(_)) {
                    *kind = FeatureKind::Numeric;
                }
            }
        }
        let features: Vec<(String, FeatureKind)> = kinds.into_iter().collect();

        let samples = observations
            .iter()
            .map(|obs| align(&features, &obs.fields))
            .collect();
        let labels = observations.iter().map(|obs| obs.label.clone()).collect();

        Self {
            features,
            samples,
            labels,
        }
    }

    fn distance(&self, a: &[Option<FieldValue>], b: &[Option<FieldValue>], p: u8) -> f64 {
        let mut total = 0.0;
        for (((_, kind), x), y) in self.features.iter().zip(a).zip(b) {
            let diff = match kind {
                FeatureKind::Numeric => {
                    let x = x.as_ref().and_then(FieldValue::as_f64).unwrap_or(0.0);
                    let y = y.as_ref().and_then(FieldValue::as_f64).unwrap_or(0.0);
                    (x - y).abs()
                }
                FeatureKind::Categorical => {
                    if x == y {
                        0.0
                    } else {
                        1.0
                    }
                }
            };
            total += if p == 1 { diff } else { diff * diff };
        }
        if p == 1 {
            total
        } else {
            total.sqrt()
        }
    }

    fn predict(&self, fields: &Fields, params: &KnnParameters) -> Option<Prediction> {
        if self.samples.is_empty() {
            return None;
        }
        let query = align(&self.features, fields);

        let mut ranked: Vec<(f64, usize)> = self
            .samples
            .iter()
            .enumerate()
            .map(|(index, sample)| (self.distance(&query, sample, params.p), index))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let k = params.n_neighbors.clamp(1, ranked.len());
        let neighbours = &ranked[..k];

        let exact = neighbours.iter().any(|(d, _)| *d == 0.0);
        let mut votes: Vec<(&str, f64)> = Vec::new();
        for (dist, index) in neighbours {
            let weight = match params.weights {
                Weighting::Uniform => 1.0,
                Weighting::Distance if exact => {
                    if *dist == 0.0 {
                        1.0
                    } else {
                        0.0
                    }
                }
                Weighting::Distance => 1.0 / dist,
            };
            let label = self.labels[*index].as_str();
            match votes.iter_mut().find(|(seen, _)| *seen == label) {
                Some((_, total)) => *total += weight,
                None => votes.push((label, weight)),
            }
        }

        let total: f64 = votes.iter().map(|(_, w)| w).sum();
        let mut best: Option<(&str, f64)> = None;
        for (label, weight) in votes {
            if best.map_or(true, |(_, top)| weight > top) {
                best = Some((label, weight));
            }
        }
        let (label, weight) = best?;
        let confidence = if total > 0.0 { weight / total } else { 0.0 };
        Some(Prediction::new(label, confidence))
    }
}

fn align(features: &[(String, FeatureKind)], fields: &Fields) -> Vec<Option<FieldValue>> {
    features.iter().map(|(name, _)| fields.get(name).cloned()).collect()
}

fn distinct_labels<'a>(observations: impl IntoIterator<Item = &'a Observation>) -> BTreeSet<&'a str> {
    observations.into_iter().map(|obs| obs.label.as_str()).collect()
}

#[derive(Debug, Clone)]
struct Evaluation {
    accuracy: f64,
    label_stats: BTreeMap<String, LabelStats>,
}

impl Evaluation {
    fn score(truth: &[&str], predicted: &[Option<String>], labels: &BTreeSet<&str>) -> Self {
        let correct = truth
            .iter()
            .zip(predicted)
            .filter(|(t, p)| p.as_deref() == Some(**t))
            .count();
        let accuracy = if truth.is_empty() {
            0.0
        } else {
            correct as f64 / truth.len() as f64
        };

        let mut label_stats = BTreeMap::new();
        for label in labels {
            let support = truth.iter().filter(|t| *t == label).count();
            let predicted_as = predicted.iter().filter(|p| p.as_deref() == Some(*label)).count();
            let true_positive = truth
                .iter()
                .zip(predicted)
                .filter(|(t, p)| *t == label && p.as_deref() == Some(*label))
                .count();

            let precision = ratio(true_positive, predicted_as);
            let recall = ratio(true_positive, support);
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            label_stats.insert(
                label.to_string(),
                LabelStats {
                    support,
                    precision: round_to(precision, 3),
                    recall: round_to(recall, 3),
                    f1: round_to(f1, 3),
                },
            );
        }

        Self {
            accuracy: round_to(accuracy, 3),
            label_stats,
        }
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Mean accuracy of `params` under k-fold cross validation.
fn cross_validate(observations: &[&Observation], params: &KnnParameters, folds: usize) -> f64 {
    let mut scores = Vec::with_capacity(folds);
    for fold in 0..folds {
        let (test, train): (Vec<_>, Vec<_>) = observations
            .iter()
            .enumerate()
            .partition(|(index, _)| index % folds == fold);
        if test.is_empty() || train.is_empty() {
            continue;
        }
        let train: Vec<&Observation> = train.into_iter().map(|(_, obs)| *obs).collect();
        let model = FittedModel::fit(&train);
        let correct = test
            .iter()
            .filter(|(_, obs)| {
                model
                    .predict(&obs.fields, params)
                    .map_or(false, |p| p.label == obs.label)
            })
            .count();
        scores.push(correct as f64 / test.len() as f64);
    }
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

#[derive(Debug, Clone, Default)]
pub struct KnnClassifier {
    params: KnnParameters,
    model: Option<FittedModel>,
    evaluation: Option<Evaluation>,
}

impl KnnClassifier {
    pub const KIND: &'static str = "KNN";

    pub fn new(params: KnnParameters) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    pub fn knn_parameters(&self) -> KnnParameters {
        self.params
    }

    fn shuffled<'a>(observations: &'a [Observation], rng: &mut StdRng) -> Vec<&'a Observation> {
        let mut refs: Vec<&Observation> = observations.iter().collect();
        refs.shuffle(rng);
        refs
    }

    fn evaluate(&self, observations: &[Observation]) -> Option<Evaluation> {
        let mut rng = StdRng::seed_from_u64(SEED);
        let shuffled = Self::shuffled(observations, &mut rng);
        let test_len = ((shuffled.len() as f64 * TEST_FRACTION).ceil() as usize).min(shuffled.len() - 1);
        if test_len == 0 {
            return None;
        }
        let (test, train) = shuffled.split_at(test_len);

        let model = FittedModel::fit(train);
        let truth: Vec<&str> = test.iter().map(|obs| obs.label.as_str()).collect();
        let predicted: Vec<Option<String>> = test
            .iter()
            .map(|obs| model.predict(&obs.fields, &self.params).map(|p| p.label))
            .collect();
        let labels = distinct_labels(observations.iter());
        Some(Evaluation::score(&truth, &predicted, &labels))
    }
}

impl Classifier for KnnClassifier {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn train(&mut self, observations: &[Observation]) {
        self.model = None;
        self.evaluation = None;

        if observations.len() < 2 || distinct_labels(observations.iter()).len() < 2 {
            log::info!(
                "Not enough data to train ({} observations)",
                observations.len()
            );
            return;
        }

        self.evaluation = self.evaluate(observations);
        let all: Vec<&Observation> = observations.iter().collect();
        self.model = Some(FittedModel::fit(&all));
        log::info!(
            "Trained KNN on {} observations (k={}, weights={:?}, p={})",
            observations.len(),
            self.params.n_neighbors,
            self.params.weights,
            self.params.p
        );
    }

    fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    fn predict(&self, fields: &Fields) -> Option<Prediction> {
        self.model.as_ref()?.predict(fields, &self.params)
    }

    fn feature_importance(&self) -> Option<BTreeMap<String, f64>> {
        None
    }

    fn accuracy(&self) -> Option<f64> {
        self.model.as_ref()?;
        self.evaluation.as_ref().map(|e| e.accuracy)
    }

    fn label_statistics(&self) -> Option<BTreeMap<String, LabelStats>> {
        self.model.as_ref()?;
        self.evaluation.as_ref().map(|e| e.label_stats.clone())
    }

    fn optimize_hyperparameters(&mut self, observations: &[Observation]) -> Value {
        if observations.len() < SEARCH_FOLDS || distinct_labels(observations.iter()).len() < 2 {
            log::warn!("Not enough data to optimize parameters");
            return self.parameters();
        }

        let mut rng = StdRng::seed_from_u64(SEED);
        let shuffled = Self::shuffled(observations, &mut rng);
        let max_k = MAX_SEARCH_NEIGHBORS.min(shuffled.len() - shuffled.len() / SEARCH_FOLDS);

        let mut best: Option<(KnnParameters, f64)> = None;
        for _ in 0..SEARCH_DRAWS {
            let candidate = KnnParameters {
                n_neighbors: rng.gen_range(1..=max_k.max(1)),
                weights: if rng.gen_bool(0.5) {
                    Weighting::Uniform
                } else {
                    Weighting::Distance
                },
                p: if rng.gen_bool(0.5) { 1 } else { 2 },
            };
            let score = cross_validate(&shuffled, &candidate, SEARCH_FOLDS);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((candidate, score));
            }
        }

        if let Some((params, score)) = best {
            log::info!("Best KNN parameters: {:?} (cv accuracy {:.4})", params, score);
            self.params = params;
        }
        self.train(observations);
        self.parameters()
    }

    fn parameters(&self) -> Value {
        serde_json::to_value(self.params).unwrap_or(Value::Null)
    }

    fn set_parameters(&mut self, params: &Value) {
        if params.is_null() {
            return;
        }
        match serde_json::from_value::<KnnParameters>(params.clone()) {
            Ok(parsed) if parsed.n_neighbors >= 1 && (parsed.p == 1 || parsed.p == 2) => {
                self.params = parsed;
            }
            Ok(parsed) => log::warn!("Ignoring out-of-range KNN parameters {:?}", parsed),
            Err(e) => log::warn!("Ignoring malformed KNN parameters {}: {}", params, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obs(label: &str, temp: f64, room: &str) -> Observation {
        let mut fields = Fields::new();
        fields.insert("temp".into(), FieldValue::Number(temp));
        fields.insert("room".into(), FieldValue::Text(room.into()));
        Observation::new(0.0, label, fields)
    }

    fn corpus() -> Vec<Observation> {
        let mut all = Vec::new();
        for i in 0..6 {
            all.push(obs("cold", 10.0 + i as f64 * 0.5, "cellar"));
            all.push(obs("warm", 25.0 + i as f64 * 0.5, "attic"));
        }
        all
    }

    fn query(temp: f64, room: &str) -> Fields {
        obs("", temp, room).fields
    }

    #[test]
    fn test_untrained_until_two_labels() {
        let mut knn = KnnClassifier::default();
        knn.train(&[obs("cold", 10.0, "cellar"), obs("cold", 11.0, "cellar")]);
        assert!(!knn.is_trained());
        assert!(knn.predict(&query(10.0, "cellar")).is_none());
        assert!(knn.accuracy().is_none());
        assert!(knn.label_statistics().is_none());
    }

    #[test]
    fn test_predicts_nearest_cluster() {
        let mut knn = KnnClassifier::new(KnnParameters {
            n_neighbors: 3,
            ..KnnParameters::default()
        });
        knn.train(&corpus());

        let cold = knn.predict(&query(11.0, "cellar")).unwrap();
        assert_eq!(cold.label, "cold");
        assert_eq!(cold.confidence, 1.0);
        assert_eq!(knn.predict(&query(26.0, "attic")).unwrap().label, "warm");
    }

    #[test]
    fn test_evaluation_is_reported() {
        let mut knn = KnnClassifier::new(KnnParameters {
            n_neighbors: 1,
            ..KnnParameters::default()
        });
        knn.train(&corpus());

        assert_eq!(knn.accuracy(), Some(1.0));
        let stats = knn.label_statistics().unwrap();
        assert_eq!(stats.len(), 2);
        let total: usize = stats.values().map(|s| s.support).sum();
        assert_eq!(total, 4);
        for s in stats.values().filter(|s| s.support > 0) {
            assert_eq!(s.f1, 1.0);
        }
    }

    #[test]
    fn test_confidence_is_vote_share() {
        let mut knn = KnnClassifier::new(KnnParameters {
            n_neighbors: 3,
            weights: Weighting::Uniform,
            p: 1,
        });
        knn.train(&[
            obs("a", 0.0, "x"),
            obs("a", 1.0, "x"),
            obs("b", 2.0, "x"),
            obs("b", 50.0, "x"),
        ]);
        let prediction = knn.predict(&query(1.2, "x")).unwrap();
        assert_eq!(prediction.label, "a");
        assert_eq!(prediction.confidence, 0.6667);
    }

    #[test]
    fn test_absent_numeric_counts_as_zero() {
        let model = FittedModel::fit(&[&obs("a", 3.0, "x")]);
        let mut sparse = Fields::new();
        sparse.insert("room".into(), FieldValue::Text("x".into()));
        let a = align(&model.features, &sparse);
        let b = model.samples[0].clone();
        assert_eq!(model.distance(&a, &b, 1), 3.0);
    }

    #[test]
    fn test_set_parameters_validates() {
        let mut knn = KnnClassifier::default();
        knn.set_parameters(&json!({"n_neighbors": 0}));
        assert_eq!(knn.knn_parameters(), KnnParameters::default());

        knn.set_parameters(&json!({"n_neighbors": 7, "weights": "distance", "p": 1}));
        assert_eq!(knn.knn_parameters().n_neighbors, 7);
        assert_eq!(knn.knn_parameters().weights, Weighting::Distance);
        assert_eq!(knn.parameters()["weights"], "distance");
    }

    #[test]
    fn test_optimize_is_reproducible() {
        let mut first = KnnClassifier::default();
        let mut second = KnnClassifier::default();
        let a = first.optimize_hyperparameters(&corpus());
        let b = second.optimize_hyperparameters(&corpus());
        assert_eq!(a, b);
        assert!(first.is_trained());
    }
}
