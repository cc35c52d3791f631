//! Per-model prediction engine
//!
//! A `ModelService` owns one `ObservationStore`, the two stage pipelines and
//! the active classifier. For every inbound message it runs the pre-stages,
//! applies the learning mode (store + full retrain or not), predicts, runs
//! the post-stages and publishes whatever survives.

pub mod history;
pub mod learning;
pub mod message;

pub use history::MessageHistory;
pub use learning::LearningType;
pub use message::{InboundMessage, OutboundMessage, DISABLED_LABEL};

use crate::classifier::{Classifier, ClassifierFactory, LabelStats, Prediction};
use crate::processors::{
    create_postprocessor, create_preprocessor, PostprocessorPipeline, PreprocessorPipeline, ProcessorError,
    StageSnapshot,
};
use crate::store::settings::{
    HISTORY_KEY, LEARNING_TYPE_KEY, MODEL_CONFIG_KEY, MODEL_SETTINGS_KEY, PROCESSOR_STORAGE_KEY,
};
use crate::store::{
    ModelConfig, ModelSettings, ObservationStore, ProcessorDefinition, ProcessorKind, ProcessorStorage, StoreError,
};
use crate::transport::{MessageCallback, Transport};
use crate::types::{present_fields, EntityKey, Fields, Observation, Reading};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("no {kind:?} processor with id {id}")]
    UnknownProcessor { kind: ProcessorKind, id: i64 },
    #[error("processor position {0} is out of range")]
    InvalidPosition(usize),
}

/// A service shared between its owner and its transport subscription.
pub type SharedModel = Arc<Mutex<ModelService>>;

struct Subscription {
    topic: String,
    callback: MessageCallback,
}

pub struct ModelService {
    store: ObservationStore,
    transport: Arc<dyn Transport>,
    factory: ClassifierFactory,
    classifier: Box<dyn Classifier>,
    settings: ModelSettings,
    learning: LearningType,
    preprocessors: PreprocessorPipeline,
    postprocessors: PostprocessorPipeline,
    history: MessageHistory,
    subscription: Option<Subscription>,
}

impl ModelService {
    /// Build a service over an opened store and train it on the stored corpus.
    pub fn open(
        store: ObservationStore,
        transport: Arc<dyn Transport>,
        factory: ClassifierFactory,
    ) -> Result<Self, EngineError> {
        let settings: ModelSettings = store.setting(MODEL_SETTINGS_KEY)?;
        let learning: LearningType = store.setting(LEARNING_TYPE_KEY)?;
        let history: MessageHistory = store.setting(HISTORY_KEY)?;
        let preprocessors = PreprocessorPipeline::from_definitions(&store.processors(ProcessorKind::Pre)?)?;
        let postprocessors = PostprocessorPipeline::from_definitions(&store.processors(ProcessorKind::Post)?)?;
        let classifier = factory(&settings.model_type, &settings.active_parameters());

        let mut service = Self {
            store,
            transport,
            factory,
            classifier,
            settings,
            learning,
            preprocessors,
            postprocessors,
            history,
            subscription: None,
        };
        service.retrain()?;
        Ok(service)
    }

    pub fn into_shared(self) -> SharedModel {
        Arc::new(Mutex::new(self))
    }

    // -- Subscription ------------------------------------------------------

    /// Subscribe `service` to `<topic>/set`. The transport only holds a weak
    /// handle, so dropping the last `SharedModel` ends delivery.
    pub fn subscribe(service: &SharedModel) -> Result<(), EngineError> {
        let weak: Weak<Mutex<ModelService>> = Arc::downgrade(service);
        let callback: MessageCallback = Arc::new(move |payload: &str| {
            if let Some(service) = weak.upgrade() {
                let mut guard = match service.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.handle_message(payload);
            }
        });

        let mut guard = match service.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.attach(callback)
    }

    fn attach(&mut self, callback: MessageCallback) -> Result<(), EngineError> {
        self.detach();
        let topic = self.set_topic()?;
        log::info!("Subscribing to MQTT topic: {}", topic);
        self.transport.subscribe(&topic, Arc::clone(&callback));
        self.subscription = Some(Subscription { topic, callback });
        Ok(())
    }

    fn detach(&mut self) -> Option<MessageCallback> {
        let subscription = self.subscription.take()?;
        self.transport.unsubscribe(&subscription.topic, &subscription.callback);
        Some(subscription.callback)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    fn set_topic(&self) -> Result<String, EngineError> {
        Ok(format!("{}/set", self.mqtt_topic()?))
    }

    fn state_topic(&self) -> Result<String, EngineError> {
        Ok(format!("{}/state", self.mqtt_topic()?))
    }

    /// Unsubscribe and close the store. Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.detach().is_some() {
            log::info!("Unsubscribed model '{}'", self.store.path().display());
        }
        self.store.close();
    }

    // -- Message handling --------------------------------------------------

    /// Process one raw payload. Errors are logged and swallowed so the next
    /// message is unaffected. Returns the published prediction, if any.
    pub fn handle_message(&mut self, payload: &str) -> Option<Prediction> {
        match self.process_message(payload) {
            Ok(published) => published,
            Err(EngineError::MalformedMessage(reason)) => {
                log::warn!("Dropping malformed message: {}", reason);
                None
            }
            Err(e) => {
                log::error!("Failed to process message: {}", e);
                None
            }
        }
    }

    fn process_message(&mut self, payload: &str) -> Result<Option<Prediction>, EngineError> {
        self.history.push(payload);
        if let Err(e) = self.store.save_setting(HISTORY_KEY, &self.history) {
            log::warn!("Failed to persist message history: {}", e);
        }

        let InboundMessage { label, reading } = message::parse_inbound(payload)?;
        if reading.is_empty() {
            log::debug!("No entity values to process");
            return Ok(None);
        }

        let Some(reading) = self.run_preprocessors(reading)? else {
            return Ok(None);
        };
        let fields = present_fields(&reading);

        if let Some(label) = label.as_deref() {
            self.learn(label, &fields)?;
        }

        let Some(prediction) = self.classifier.predict(&fields) else {
            log::debug!("Model not trained, nothing to publish");
            return Ok(None);
        };

        let Some(prediction) = self.postprocessors.run(&fields, prediction) else {
            return Ok(None);
        };

        let topic = self.state_topic()?;
        self.transport.publish(&topic, &message::encode_outbound(&prediction)?);
        log::info!("Predicted label: {} ({})", prediction.label, prediction.confidence);
        Ok(Some(prediction))
    }

    fn run_preprocessors(&self, reading: Reading) -> Result<Option<Reading>, EngineError> {
        if self.preprocessors.is_empty() {
            return Ok(Some(reading));
        }
        let mut storage: ProcessorStorage = self.store.setting(PROCESSOR_STORAGE_KEY)?;
        let result = self.preprocessors.run(reading, &mut storage)?;
        self.store.save_setting(PROCESSOR_STORAGE_KEY, &storage)?;
        Ok(result)
    }

    fn learn(&mut self, label: &str, fields: &Fields) -> Result<(), EngineError> {
        let should_store = match self.learning {
            LearningType::Disabled => false,
            LearningType::Eager => true,
            LearningType::Lazy => match self.classifier.predict(fields) {
                Some(current) => current.label != label,
                None => true,
            },
        };
        if !should_store {
            return Ok(());
        }

        log::info!("Adding training observation for label: {}", label);
        if let Err(e) = self.store.add_observation(label, fields, None) {
            // The message is still predicted on; only the training signal is lost.
            log::error!("Failed to store observation for label {}: {}", label, e);
            return Ok(());
        }
        self.retrain()
    }

    /// Rebuild the classifier from the whole corpus and swap it in.
    pub fn retrain(&mut self) -> Result<(), EngineError> {
        let observations = self.store.observations()?;
        let mut fresh = (self.factory)(&self.settings.model_type, &self.settings.active_parameters());
        fresh.train(&observations);
        self.classifier = fresh;
        Ok(())
    }

    // -- Metadata ----------------------------------------------------------

    pub fn name(&self) -> Result<String, EngineError> {
        Ok(self.store.name()?.unwrap_or_default())
    }

    pub fn set_name(&self, name: &str) -> Result<(), EngineError> {
        Ok(self.store.set_name(name)?)
    }

    pub fn mqtt_topic(&self) -> Result<String, EngineError> {
        Ok(self.store.mqtt_topic()?.unwrap_or_default())
    }

    /// Change the base topic, moving an active subscription along with it.
    pub fn set_mqtt_topic(&mut self, topic: &str) -> Result<(), EngineError> {
        let callback = self.detach();
        self.store.set_mqtt_topic(topic)?;
        if let Some(callback) = callback {
            self.attach(callback)?;
        }
        Ok(())
    }

    pub fn learning_type(&self) -> LearningType {
        self.learning
    }

    pub fn set_learning_type(&mut self, learning: LearningType) -> Result<(), EngineError> {
        self.store.save_setting(LEARNING_TYPE_KEY, &learning)?;
        self.learning = learning;
        log::info!("Learning type set to {}", learning);
        Ok(())
    }

    pub fn model_config(&self) -> Result<ModelConfig, EngineError> {
        Ok(self.store.setting(MODEL_CONFIG_KEY)?)
    }

    pub fn set_model_config(&self, config: &ModelConfig) -> Result<(), EngineError> {
        Ok(self.store.save_setting(MODEL_CONFIG_KEY, config)?)
    }

    pub fn model_settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// Persist new classifier settings and rebuild the classifier under them.
    pub fn set_model_settings(&mut self, settings: ModelSettings) -> Result<(), EngineError> {
        self.store.save_setting(MODEL_SETTINGS_KEY, &settings)?;
        self.settings = settings;
        self.retrain()
    }

    pub fn model_size(&self) -> Result<u64, EngineError> {
        Ok(self.store.model_size()?)
    }

    // -- Classifier views --------------------------------------------------

    pub fn is_trained(&self) -> bool {
        self.classifier.is_trained()
    }

    /// Schema keys annotated with the classifier's feature importance.
    pub fn entity_keys(&self) -> Result<Vec<EntityKey>, EngineError> {
        let importance = self.classifier.feature_importance().unwrap_or_default();
        let mut keys = self.store.entity_keys()?;
        for key in &mut keys {
            key.significance = importance.get(&key.name).copied().unwrap_or(0.0);
        }
        Ok(keys)
    }

    pub fn accuracy(&self) -> Option<f64> {
        self.classifier.accuracy()
    }

    pub fn label_stats(&self) -> Option<BTreeMap<String, LabelStats>> {
        self.classifier.label_statistics()
    }

    /// Tune hyper-parameters of the active classifier type on the full
    /// corpus, remember them, and retrain.
    pub fn optimize_parameters(&mut self) -> Result<Value, EngineError> {
        let observations = self.store.observations()?;
        let mut candidate = (self.factory)(&self.settings.model_type, &self.settings.active_parameters());
        let tuned = candidate.optimize_hyperparameters(&observations);

        let mut settings = self.settings.clone();
        settings
            .model_parameters
            .insert(settings.model_type.clone(), tuned.clone());
        self.set_model_settings(settings)?;
        Ok(tuned)
    }

    // -- Corpus ------------------------------------------------------------

    pub fn observations(&self) -> Result<Vec<Observation>, EngineError> {
        Ok(self.store.observations()?)
    }

    pub fn observation_count(&self) -> Result<usize, EngineError> {
        Ok(self.store.observation_count()?)
    }

    pub fn labels(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.store.labels()?)
    }

    pub fn delete_observations_by_label(&mut self, label: &str) -> Result<usize, EngineError> {
        let removed = self.store.delete_observations_by_label(label)?;
        self.retrain()?;
        Ok(removed)
    }

    pub fn delete_observation(&mut self, timestamp: f64) -> Result<usize, EngineError> {
        let removed = self.store.delete_observation(timestamp)?;
        self.retrain()?;
        Ok(removed)
    }

    pub fn delete_observations_since(&mut self, timestamp: f64) -> Result<usize, EngineError> {
        let removed = self.store.delete_observations_since(timestamp)?;
        self.retrain()?;
        Ok(removed)
    }

    /// Drop an entity from the schema and every stored record, then retrain.
    /// Rewrites the whole corpus.
    pub fn delete_entity(&mut self, name: &str) -> Result<(), EngineError> {
        self.store.delete_entity(name)?;
        self.retrain()
    }

    // -- Processors --------------------------------------------------------

    pub fn preprocessors(&self) -> Result<Vec<ProcessorDefinition>, EngineError> {
        Ok(self.store.processors(ProcessorKind::Pre)?)
    }

    pub fn postprocessors(&self) -> Result<Vec<ProcessorDefinition>, EngineError> {
        Ok(self.store.processors(ProcessorKind::Post)?)
    }

    /// Validate and append a pre-stage. Returns its id.
    pub fn add_preprocessor(&mut self, type_name: &str, params: Value) -> Result<i64, EngineError> {
        self.add_processor(ProcessorKind::Pre, type_name, params)
    }

    pub fn add_postprocessor(&mut self, type_name: &str, params: Value) -> Result<i64, EngineError> {
        self.add_processor(ProcessorKind::Post, type_name, params)
    }

    fn add_processor(&mut self, kind: ProcessorKind, type_name: &str, params: Value) -> Result<i64, EngineError> {
        let probe = ProcessorDefinition {
            id: 0,
            kind,
            type_name: type_name.to_string(),
            params: params.clone(),
            order: 0,
        };
        match kind {
            ProcessorKind::Pre => create_preprocessor(&probe).map(drop)?,
            ProcessorKind::Post => create_postprocessor(&probe).map(drop)?,
        }

        let id = self.store.add_processor(kind, type_name, &params, None)?;
        self.reload_pipeline(kind)?;
        log::info!("Added {:?} processor {} ({})", kind, id, type_name);
        Ok(id)
    }

    /// Remove a pre-stage. Observations stored under the old pipeline no
    /// longer match it, so the whole corpus is discarded.
    pub fn remove_preprocessor(&mut self, id: i64) -> Result<(), EngineError> {
        self.require_processor(ProcessorKind::Pre, id)?;
        self.store.delete_processor(ProcessorKind::Pre, id)?;

        let mut storage: ProcessorStorage = self.store.setting(PROCESSOR_STORAGE_KEY)?;
        if storage.remove(&id.to_string()).is_some() {
            self.store.save_setting(PROCESSOR_STORAGE_KEY, &storage)?;
        }

        let removed = self.store.delete_observations_since(0.0)?;
        log::info!("Removed preprocessor {}, discarded {} observations", id, removed);
        self.reload_pipeline(ProcessorKind::Pre)?;
        self.retrain()
    }

    pub fn remove_postprocessor(&mut self, id: i64) -> Result<(), EngineError> {
        self.require_processor(ProcessorKind::Post, id)?;
        self.store.delete_processor(ProcessorKind::Post, id)?;
        self.reload_pipeline(ProcessorKind::Post)
    }

    /// Re-rank stages so that `ids[i]` runs at position `i`.
    pub fn reorder_processors(&mut self, kind: ProcessorKind, ids: &[i64]) -> Result<(), EngineError> {
        self.store.reorder_processors(kind, ids)?;
        self.reload_pipeline(kind)
    }

    /// Move the stage at position `from` to position `to`.
    pub fn move_processor(&mut self, kind: ProcessorKind, from: usize, to: usize) -> Result<(), EngineError> {
        let mut ids: Vec<i64> = self.store.processors(kind)?.iter().map(|d| d.id).collect();
        if from >= ids.len() {
            return Err(EngineError::InvalidPosition(from));
        }
        if to >= ids.len() {
            return Err(EngineError::InvalidPosition(to));
        }
        let id = ids.remove(from);
        ids.insert(to, id);
        self.reorder_processors(kind, &ids)
    }

    fn require_processor(&self, kind: ProcessorKind, id: i64) -> Result<(), EngineError> {
        if self.store.processors(kind)?.iter().any(|d| d.id == id) {
            Ok(())
        } else {
            Err(EngineError::UnknownProcessor { kind, id })
        }
    }

    fn reload_pipeline(&mut self, kind: ProcessorKind) -> Result<(), EngineError> {
        let definitions = self.store.processors(kind)?;
        match kind {
            ProcessorKind::Pre => self.preprocessors = PreprocessorPipeline::from_definitions(&definitions)?,
            ProcessorKind::Post => self.postprocessors = PostprocessorPipeline::from_definitions(&definitions)?,
        }
        Ok(())
    }

    // -- Diagnostics -------------------------------------------------------

    /// Raw payloads of the last messages, oldest first.
    pub fn recent_messages(&self) -> Vec<String> {
        self.history.to_vec()
    }

    /// Dry-run the pre-stages over the message history and show what each
    /// stage did to the newest message. Stored stage state is not touched.
    pub fn evaluate_preprocessors(&self) -> Result<Vec<StageSnapshot>, EngineError> {
        let readings: Vec<Reading> = self
            .history
            .iter()
            .filter_map(|payload| match message::parse_inbound(payload) {
                Ok(parsed) if !parsed.reading.is_empty() => Some(parsed.reading),
                Ok(_) => None,
                Err(e) => {
                    log::debug!("Skipping history entry: {}", e);
                    None
                }
            })
            .collect();
        Ok(self.preprocessors.evaluate(&readings)?)
    }
}

impl Drop for ModelService {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> (ModelService, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let store = ObservationStore::open(dir.path().join("room.db")).unwrap();
        store.set_mqtt_topic("home/room").unwrap();
        let service = ModelService::open(store, transport.clone(), classifier::default_factory()).unwrap();
        (service, transport)
    }

    #[test]
    fn test_learning_type_persists() {
        let dir = TempDir::new().unwrap();
        let (mut svc, _) = service(&dir);
        assert_eq!(svc.learning_type(), LearningType::Disabled);
        svc.set_learning_type(LearningType::Lazy).unwrap();
        drop(svc);

        let (svc, _) = service(&dir);
        assert_eq!(svc.learning_type(), LearningType::Lazy);
    }

    #[test]
    fn test_history_is_bounded_and_persisted() {
        let dir = TempDir::new().unwrap();
        let (mut svc, _) = service(&dir);
        for i in 0..12 {
            svc.handle_message(&format!(r#"[{{"entity_id":"n","state":"{}"}}]"#, i));
        }
        assert_eq!(svc.recent_messages().len(), 10);
        drop(svc);

        let (svc, _) = service(&dir);
        assert_eq!(svc.recent_messages().len(), 10);
        assert!(svc.recent_messages()[0].contains("\"2\""));
    }

    #[test]
    fn test_history_write_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let (mut svc, _) = service(&dir);
        svc.set_learning_type(LearningType::Eager).unwrap();

        let side = rusqlite::Connection::open(dir.path().join("room.db")).unwrap();
        side.execute_batch(&format!(
            "CREATE TRIGGER reject_history BEFORE INSERT ON settings WHEN NEW.name = '{}'
             BEGIN SELECT RAISE(ABORT, 'history is read-only'); END;",
            HISTORY_KEY
        ))
        .unwrap();
        drop(side);

        svc.handle_message(r#"[{"entity_id":"t","state":"1"},{"label":"a"}]"#);
        assert_eq!(svc.recent_messages().len(), 1);
        assert_eq!(svc.observation_count().unwrap(), 1);
    }

    #[test]
    fn test_malformed_message_does_not_poison_service() {
        let dir = TempDir::new().unwrap();
        let (mut svc, _) = service(&dir);
        svc.set_learning_type(LearningType::Eager).unwrap();

        assert!(svc.handle_message("{oops").is_none());
        svc.handle_message(r#"[{"entity_id":"t","state":"1"},{"label":"a"}]"#);
        assert_eq!(svc.observation_count().unwrap(), 1);
    }

    #[test]
    fn test_add_processor_rejects_bad_config() {
        let dir = TempDir::new().unwrap();
        let (mut svc, _) = service(&dir);

        assert!(svc.add_preprocessor("nope", json!({})).is_err());
        assert!(svc.add_preprocessor("rolling_average", json!({"windowSize": 0})).is_err());
        assert!(svc.preprocessors().unwrap().is_empty());

        let id = svc.add_preprocessor("rolling_average", json!({"windowSize": 2})).unwrap();
        assert_eq!(svc.preprocessors().unwrap()[0].id, id);
    }

    #[test]
    fn test_move_processor() {
        let dir = TempDir::new().unwrap();
        let (mut svc, _) = service(&dir);
        let a = svc.add_postprocessor("only_diff", json!({})).unwrap();
        let b = svc.add_postprocessor("majority_vote", json!({"window_size": 2})).unwrap();

        svc.move_processor(ProcessorKind::Post, 1, 0).unwrap();
        let ids: Vec<i64> = svc.postprocessors().unwrap().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![b, a]);
        assert!(matches!(
            svc.move_processor(ProcessorKind::Post, 5, 0),
            Err(EngineError::InvalidPosition(5))
        ));
    }

    #[test]
    fn test_remove_unknown_processor() {
        let dir = TempDir::new().unwrap();
        let (mut svc, _) = service(&dir);
        assert!(matches!(
            svc.remove_postprocessor(42),
            Err(EngineError::UnknownProcessor { id: 42, .. })
        ));
    }

    #[test]
    fn test_evaluate_preprocessors_leaves_state_alone() {
        let dir = TempDir::new().unwrap();
        let (mut svc, _) = service(&dir);
        svc.add_preprocessor("type_caster", json!({})).unwrap();
        let avg = svc.add_preprocessor("rolling_average", json!({"windowSize": 3})).unwrap();

        svc.handle_message(r#"[{"entity_id":"t","state":"3"}]"#);
        svc.handle_message(r#"[{"entity_id":"t","state":"6"}]"#);
        let before: ProcessorStorage = svc.store.setting(PROCESSOR_STORAGE_KEY).unwrap();

        let snapshots = svc.evaluate_preprocessors().unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1].id, avg);
        assert_eq!(snapshots[1].produces["t"], Some(crate::types::FieldValue::Number(4.5)));

        let after: ProcessorStorage = svc.store.setting(PROCESSOR_STORAGE_KEY).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_subscription_follows_topic() {
        let dir = TempDir::new().unwrap();
        let (svc, transport) = service(&dir);
        let shared = svc.into_shared();
        ModelService::subscribe(&shared).unwrap();
        assert_eq!(transport.subscriber_count("home/room/set"), 1);

        shared.lock().unwrap().set_mqtt_topic("home/den").unwrap();
        assert_eq!(transport.subscriber_count("home/room/set"), 0);
        assert_eq!(transport.subscriber_count("home/den/set"), 1);

        shared.lock().unwrap().dispose();
        assert_eq!(transport.subscriber_count("home/den/set"), 0);
    }
}
