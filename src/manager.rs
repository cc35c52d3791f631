//! Directory of models, one `<name>.db` file each.

use crate::classifier::ClassifierFactory;
use crate::engine::{EngineError, LearningType, ModelService, SharedModel};
use crate::store::{ModelConfig, ObservationStore, StoreError};
use crate::transport::Transport;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

const MODEL_EXTENSION: &str = "db";

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("model '{0}' already exists")]
    AlreadyExists(String),
    #[error("model '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a new model is provisioned with.
#[derive(Debug, Clone, PartialEq)]
pub struct NewModel {
    pub name: String,
    pub mqtt_topic: String,
    pub labels: Vec<String>,
    pub input_count: Option<u32>,
    /// Value the null-handler stage substitutes for absent readings.
    pub default_value: String,
}

impl NewModel {
    pub fn new(name: impl Into<String>, mqtt_topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mqtt_topic: mqtt_topic.into(),
            labels: Vec::new(),
            input_count: None,
            default_value: "0".to_string(),
        }
    }
}

pub struct ModelManager {
    models_dir: PathBuf,
    transport: Arc<dyn Transport>,
    factory: ClassifierFactory,
    models: Mutex<BTreeMap<String, SharedModel>>,
}

fn model_key(name: &str) -> String {
    name.to_lowercase()
}

fn lock_model(model: &SharedModel) -> MutexGuard<'_, ModelService> {
    match model.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ModelManager {
    /// Open every `*.db` in `models_dir` (created if missing) and subscribe it.
    pub fn open(
        models_dir: impl AsRef<Path>,
        transport: Arc<dyn Transport>,
        factory: ClassifierFactory,
    ) -> Result<Self, ManagerError> {
        let models_dir = models_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&models_dir)?;

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&models_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(MODEL_EXTENSION))
            .collect();
        paths.sort();

        let mut models = BTreeMap::new();
        for path in paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = model_key(stem);
            let store = ObservationStore::open(&path)?;
            let model = ModelService::open(store, Arc::clone(&transport), Arc::clone(&factory))?.into_shared();
            ModelService::subscribe(&model)?;
            log::info!("Loaded model '{}' from {}", key, path.display());
            models.insert(key, model);
        }

        Ok(Self {
            models_dir,
            transport,
            factory,
            models: Mutex::new(models),
        })
    }

    fn models(&self) -> MutexGuard<'_, BTreeMap<String, SharedModel>> {
        match self.models.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn model_path(&self, key: &str) -> PathBuf {
        self.models_dir.join(format!("{}.{}", key, MODEL_EXTENSION))
    }

    /// Create, provision and subscribe a new model.
    ///
    /// New models learn eagerly and publish only changed predictions.
    pub fn add_model(&self, new_model: &NewModel) -> Result<SharedModel, ManagerError> {
        let key = model_key(&new_model.name);
        let mut models = self.models();
        if models.contains_key(&key) || self.model_path(&key).exists() {
            return Err(ManagerError::AlreadyExists(key));
        }

        let store = ObservationStore::open(self.model_path(&key))?;
        store.set_name(&new_model.name)?;
        store.set_mqtt_topic(&new_model.mqtt_topic)?;

        let mut service = ModelService::open(store, Arc::clone(&self.transport), Arc::clone(&self.factory))?;
        let mut labels = new_model.labels.clone();
        labels.sort();
        labels.dedup();
        service.set_model_config(&ModelConfig {
            labels,
            input_count: new_model.input_count,
        })?;
        let all_fields = json!([{"SELECT_ALL": true}]);
        service.add_preprocessor("type_caster", json!({ "sensor": all_fields }))?;
        service.add_preprocessor(
            "null_handler",
            json!({
                "sensor": all_fields,
                "replacementType": "float",
                "nullReplacement": new_model.default_value,
            }),
        )?;
        service.add_postprocessor("only_diff", json!({}))?;
        service.set_learning_type(LearningType::Eager)?;

        let model = service.into_shared();
        ModelService::subscribe(&model)?;
        models.insert(key.clone(), Arc::clone(&model));
        log::info!("Created model '{}' on topic {}", key, new_model.mqtt_topic);
        Ok(model)
    }

    /// Dispose a model and delete its file. Unknown names only clean up the file.
    pub fn remove_model(&self, name: &str) -> Result<(), ManagerError> {
        let key = model_key(name);
        if let Some(model) = self.models().remove(&key) {
            lock_model(&model).dispose();
        }

        let path = self.model_path(&key);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        for suffix in ["-wal", "-shm"] {
            let sidecar = PathBuf::from(format!("{}{}", path.display(), suffix));
            if sidecar.exists() {
                std::fs::remove_file(&sidecar)?;
            }
        }
        log::info!("Removed model '{}'", key);
        Ok(())
    }

    pub fn get_model(&self, name: &str) -> Result<SharedModel, ManagerError> {
        let key = model_key(name);
        self.models()
            .get(&key)
            .cloned()
            .ok_or(ManagerError::NotFound(key))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models().contains_key(&model_key(name))
    }

    /// Names of the loaded models, sorted.
    pub fn list_models(&self) -> Vec<String> {
        self.models().keys().cloned().collect()
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Dispose every model. Calling it again is a no-op.
    pub fn shutdown(&self) {
        let models = std::mem::take(&mut *self.models());
        for (key, model) in models {
            lock_model(&model).dispose();
            log::info!("Closed model '{}'", key);
        }
    }
}

impl Drop for ModelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier;
    use crate::store::ProcessorKind;
    use crate::transport::MemoryTransport;
    use tempfile::TempDir;

    fn manager(dir: &Path, transport: &Arc<MemoryTransport>) -> ModelManager {
        ModelManager::open(dir, transport.clone(), classifier::default_factory()).unwrap()
    }

    #[test]
    fn test_add_model_provisions_defaults() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(dir.path(), &transport);

        let mut new_model = NewModel::new("Kitchen", "home/kitchen");
        new_model.labels = vec!["b".into(), "a".into(), "b".into()];
        let model = manager.add_model(&new_model).unwrap();

        let service = model.lock().unwrap();
        let pre: Vec<String> = service.preprocessors().unwrap().into_iter().map(|d| d.type_name).collect();
        assert_eq!(pre, vec!["type_caster", "null_handler"]);
        let post = service.postprocessors().unwrap();
        assert_eq!(post.len(), 1);
        assert_eq!(post[0].kind, ProcessorKind::Post);
        assert_eq!(service.learning_type(), LearningType::Eager);
        assert_eq!(service.model_config().unwrap().labels, vec!["a", "b"]);
        assert_eq!(service.name().unwrap(), "Kitchen");
        drop(service);

        assert!(dir.path().join("kitchen.db").exists());
        assert_eq!(transport.subscriber_count("home/kitchen/set"), 1);
        assert!(manager.contains("KITCHEN"));
    }

    #[test]
    fn test_duplicate_model_rejected() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(dir.path(), &transport);

        manager.add_model(&NewModel::new("den", "home/den")).unwrap();
        assert!(matches!(
            manager.add_model(&NewModel::new("Den", "home/den2")),
            Err(ManagerError::AlreadyExists(name)) if name == "den"
        ));
    }

    #[test]
    fn test_reload_from_directory() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        {
            let manager = manager(dir.path(), &transport);
            manager.add_model(&NewModel::new("a", "t/a")).unwrap();
            manager.add_model(&NewModel::new("b", "t/b")).unwrap();
            manager.shutdown();
        }
        assert_eq!(transport.subscriber_count("t/a/set"), 0);

        let manager = manager(dir.path(), &transport);
        assert_eq!(manager.list_models(), vec!["a", "b"]);
        assert_eq!(transport.subscriber_count("t/a/set"), 1);
    }

    #[test]
    fn test_remove_model_deletes_file() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(dir.path(), &transport);
        manager.add_model(&NewModel::new("gone", "t/gone")).unwrap();

        manager.remove_model("Gone").unwrap();
        assert!(!manager.contains("gone"));
        assert!(!dir.path().join("gone.db").exists());
        assert_eq!(transport.subscriber_count("t/gone/set"), 0);
        assert!(matches!(manager.get_model("gone"), Err(ManagerError::NotFound(_))));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(dir.path(), &transport);
        let model = manager.add_model(&NewModel::new("x", "t/x")).unwrap();

        manager.shutdown();
        manager.shutdown();
        assert!(manager.list_models().is_empty());
        assert!(!model.lock().unwrap().is_subscribed());
    }
}
