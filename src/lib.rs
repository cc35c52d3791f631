//! labelflow: turns streams of sensor readings into a labeled training corpus
//! and live label predictions.
//!
//! Each model owns an [`store::ObservationStore`] (SQLite), a pre-stage and a
//! post-stage [`processors`] pipeline, and a classifier. The
//! [`engine::ModelService`] ties them together per message; the
//! [`manager::ModelManager`] keeps a directory of models subscribed to a
//! [`transport::Transport`].

pub mod classifier;
pub mod config;
pub mod engine;
pub mod manager;
pub mod processors;
pub mod store;
pub mod transport;
pub mod types;

pub use classifier::{Classifier, ClassifierFactory, LabelStats, Prediction};
pub use config::{ConfigError, RuntimeConfig};
pub use engine::{EngineError, LearningType, ModelService, SharedModel};
pub use manager::{ManagerError, ModelManager, NewModel};
pub use processors::ProcessorError;
pub use store::{ObservationStore, StoreError};
pub use transport::{MemoryTransport, MessageCallback, Transport};
pub use types::{EntityKey, EntityKind, FieldValue, Fields, Observation, Reading};
