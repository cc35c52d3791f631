//! # Observation store
//!
//! One SQLite file per model holding:
//!
//! - `entity_keys`    - schema registry (name, kind, order_index)
//! - `observations`   - (time, label, data BLOB) training corpus
//! - `string_table`   - append-only categorical interning table
//! - `settings`       - JSON-valued key/value slots
//! - `preprocessors` / `postprocessors` - ordered stage definitions
//!
//! ## Concurrency
//!
//! Every write (inserts, deletes, interning, settings) goes through a single
//! writer connection guarded by one mutex. Reads use a second, query-only
//! connection; with WAL they see either the pre- or the post-commit state of
//! a concurrent write, never a torn one.

pub mod codec;
pub mod interner;
pub mod pragma;
pub mod processors;
pub mod schema;
pub mod settings;

pub use interner::StringInterner;
pub use processors::{ProcessorDefinition, ProcessorKind};
pub use schema::EntitySchema;
pub use settings::{ModelConfig, ModelSettings, ProcessorStorage};

use crate::types::{now_epoch_seconds, EntityKey, EntityKind, FieldValue, Fields, Observation};
use codec::Slot;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS entity_keys (
    order_index INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    kind        INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS observations (
    time  REAL NOT NULL,
    label TEXT NOT NULL,
    data  BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_observations_time ON observations(time DESC);
CREATE TABLE IF NOT EXISTS string_table (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    value TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS settings (
    name  TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS preprocessors (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    type      TEXT NOT NULL,
    params    TEXT NOT NULL,
    order_num INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS postprocessors (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    type      TEXT NOT NULL,
    params    TEXT NOT NULL,
    order_num INTEGER NOT NULL
);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("entity not found: {0}")]
    UnknownEntity(String),
    #[error("value '{value}' cannot be stored in numeric entity '{entity}'")]
    InvalidValue { entity: String, value: String },
    #[error("field '{0}' is absent but a later field is present")]
    MissingField(String),
    #[error("corrupt observation record: {reason}")]
    CorruptRecord { reason: String },
    #[error("invalid processor order: {0}")]
    InvalidOrder(String),
    #[error("store is closed")]
    Closed,
    #[error("store lock poisoned")]
    LockPoisoned,
}

/// Persistent corpus, schema and settings of one model.
pub struct ObservationStore {
    path: PathBuf,
    writer: Mutex<Option<Connection>>,
    reader: Mutex<Option<Connection>>,
    schema: RwLock<EntitySchema>,
    strings: RwLock<StringInterner>,
}

impl ObservationStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(&path)?;
        pragma::apply_pragmas(&writer)?;
        writer.execute_batch(SCHEMA_SQL)?;

        let reader = Connection::open(&path)?;
        pragma::apply_reader_pragmas(&reader)?;

        let schema = EntitySchema::load(&reader)?;
        let strings = StringInterner::load(&reader)?;

        log::info!(
            "Opened model store {} ({} entities, {} strings)",
            path.display(),
            schema.len(),
            strings.len()
        );

        Ok(Self {
            path,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            schema: RwLock::new(schema),
            strings: RwLock::new(strings),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release both connections. Safe to call more than once.
    pub fn close(&self) {
        for slot in [&self.writer, &self.reader] {
            let conn = match slot.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(conn) = conn {
                if let Err((_, e)) = conn.close() {
                    log::warn!("Error closing {}: {}", self.path.display(), e);
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.writer.lock() {
            Ok(guard) => guard.is_none(),
            Err(_) => true,
        }
    }

    fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.writer.lock().map_err(|_| StoreError::LockPoisoned)?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        f(conn)
    }

    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let guard = self.reader.lock().map_err(|_| StoreError::LockPoisoned)?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        f(conn)
    }

    // -- Schema ------------------------------------------------------------

    /// Register `name` with a kind inferred from `sample`. Idempotent: a known
    /// name returns its existing key untouched.
    pub fn register_entity(&self, name: &str, sample: &FieldValue) -> Result<EntityKey, StoreError> {
        if let Some(key) = self.read_schema()?.get(name) {
            return Ok(key.clone());
        }

        let kind = EntityKind::infer(sample);
        self.with_writer(|conn| {
            if schema::insert_key(conn, name, kind)? {
                log::info!("Registered entity '{}' as {}", name, kind.display_name());
            }
            let reloaded = EntitySchema::load(conn)?;
            let key = reloaded
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::UnknownEntity(name.to_string()))?;
            *self.schema.write().map_err(|_| StoreError::LockPoisoned)? = reloaded;
            Ok(key)
        })
    }

    /// Current schema in layout order.
    pub fn entity_keys(&self) -> Result<Vec<EntityKey>, StoreError> {
        Ok(self.read_schema()?.keys().to_vec())
    }

    fn read_schema(&self) -> Result<std::sync::RwLockReadGuard<'_, EntitySchema>, StoreError> {
        self.schema.read().map_err(|_| StoreError::LockPoisoned)
    }

    // -- String interning --------------------------------------------------

    /// Id of `value` in the string table, inserting it when new.
    pub fn intern(&self, value: &str) -> Result<i64, StoreError> {
        if let Some(id) = self.strings.read().map_err(|_| StoreError::LockPoisoned)?.lookup(value) {
            return Ok(id);
        }

        self.with_writer(|conn| {
            let id = interner::insert_value(conn, value)?;
            let refreshed = StringInterner::load(conn)?;
            *self.strings.write().map_err(|_| StoreError::LockPoisoned)? = refreshed;
            Ok(id)
        })
    }

    /// Reverse lookup of an interned id. `None` for ids this cache has not seen.
    pub fn resolve(&self, id: i64) -> Option<String> {
        self.strings
            .read()
            .ok()
            .and_then(|strings| strings.resolve(id).map(str::to_string))
    }

    // -- Observations ------------------------------------------------------

    /// Store a labeled observation, growing the schema for unseen names.
    ///
    /// The record covers every key known after registration. Keys missing
    /// from `fields` must all sit after the last present one; there is no
    /// default substitution here, that is the pre-stage pipeline's job.
    pub fn add_observation(
        &self,
        label: &str,
        fields: &Fields,
        timestamp: Option<f64>,
    ) -> Result<(), StoreError> {
        for (name, value) in fields {
            if !self.read_schema()?.contains(name) {
                self.register_entity(name, value)?;
            }
        }

        let keys = self.entity_keys()?;
        let blob = self.encode(&keys, fields)?;
        let timestamp = timestamp.unwrap_or_else(now_epoch_seconds);

        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO observations (time, label, data) VALUES (?1, ?2, ?3)",
                params![timestamp, label, blob],
            )?;
            Ok(())
        })?;

        log::debug!("Stored observation '{}' with {} fields", label, fields.len());
        Ok(())
    }

    /// Every observation, newest first, decoded against the current schema.
    pub fn observations(&self) -> Result<Vec<Observation>, StoreError> {
        let rows = self.with_reader(|conn| {
            let mut stmt = conn.prepare("SELECT time, label, data FROM observations ORDER BY time DESC")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let schema = self.read_schema()?;
        let strings = self.strings.read().map_err(|_| StoreError::LockPoisoned)?;

        rows.into_iter()
            .map(|(timestamp, label, blob)| {
                let fields = codec::unpack(schema.keys(), &blob, &strings)?;
                Ok(Observation::new(timestamp, label, fields))
            })
            .collect()
    }

    pub fn observation_count(&self) -> Result<usize, StoreError> {
        self.with_reader(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// Distinct labels, ascending.
    pub fn labels(&self) -> Result<Vec<String>, StoreError> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT label FROM observations ORDER BY label ASC")?;
            let labels = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(labels)
        })
    }

    pub fn delete_observations_by_label(&self, label: &str) -> Result<usize, StoreError> {
        self.with_writer(|conn| Ok(conn.execute("DELETE FROM observations WHERE label = ?1", [label])?))
    }

    pub fn delete_observation(&self, timestamp: f64) -> Result<usize, StoreError> {
        self.with_writer(|conn| Ok(conn.execute("DELETE FROM observations WHERE time = ?1", [timestamp])?))
    }

    /// Delete every observation with `time >= timestamp`.
    pub fn delete_observations_since(&self, timestamp: f64) -> Result<usize, StoreError> {
        self.with_writer(|conn| Ok(conn.execute("DELETE FROM observations WHERE time >= ?1", [timestamp])?))
    }

    /// Remove an entity from the schema.
    ///
    /// There is no column to drop in the blob layout, so this rewrites the
    /// whole corpus: every observation is decoded, stripped of `name` and
    /// re-encoded against the reduced schema in one transaction. Cost is
    /// O(corpus) in time and memory; avoid it on large models.
    pub fn delete_entity(&self, name: &str) -> Result<(), StoreError> {
        let reduced = {
            let schema = self.read_schema()?;
            if !schema.contains(name) {
                return Err(StoreError::UnknownEntity(name.to_string()));
            }
            schema.without(name)
        };

        let mut rows = Vec::new();
        for mut observation in self.observations()? {
            observation.fields.shift_remove(name);
            let blob = self.encode(reduced.keys(), &observation.fields)?;
            rows.push((observation.timestamp, observation.label, blob));
        }

        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM entity_keys WHERE name = ?1", [name])?;
            tx.execute("DELETE FROM observations", [])?;
            {
                let mut insert =
                    tx.prepare("INSERT INTO observations (time, label, data) VALUES (?1, ?2, ?3)")?;
                for (timestamp, label, blob) in &rows {
                    insert.execute(params![timestamp, label, blob])?;
                }
            }
            tx.commit()?;

            let reloaded = EntitySchema::load(conn)?;
            *self.schema.write().map_err(|_| StoreError::LockPoisoned)? = reloaded;
            Ok(())
        })?;

        log::info!("Deleted entity '{}', rewrote {} observations", name, rows.len());
        Ok(())
    }

    fn encode(&self, keys: &[EntityKey], fields: &Fields) -> Result<Vec<u8>, StoreError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let slot = match fields.get(&key.name) {
                None => None,
                Some(value) => Some(self.slot_value(key, value)?),
            };
            values.push(slot);
        }
        let slots: Vec<Slot<'_>> = keys
            .iter()
            .zip(values)
            .map(|(key, value)| (key.name.as_str(), value))
            .collect();
        codec::pack(&slots)
    }

    fn slot_value(&self, key: &EntityKey, value: &FieldValue) -> Result<f32, StoreError> {
        match key.kind {
            EntityKind::Numeric => value.as_f64().map(|n| n as f32).ok_or_else(|| StoreError::InvalidValue {
                entity: key.name.clone(),
                value: value.to_string(),
            }),
            EntityKind::Categorical => Ok(self.intern(&value.to_string())? as f32),
        }
    }

    // -- Settings ----------------------------------------------------------

    fn raw_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_reader(|conn| {
            Ok(conn
                .query_row("SELECT value FROM settings WHERE name = ?1", [key], |row| row.get(0))
                .optional()?)
        })
    }

    /// Typed setting; the type's default when the key was never written.
    pub fn setting<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, StoreError> {
        match self.raw_setting(key)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(T::default()),
        }
    }

    pub fn save_setting<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.with_writer(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (name, value) VALUES (?1, ?2)",
                params![key, raw],
            )?;
            Ok(())
        })
    }

    /// JSON setting; an empty object when absent.
    pub fn get_dict(&self, key: &str) -> Result<Value, StoreError> {
        match self.raw_setting(key)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Value::Object(Default::default())),
        }
    }

    pub fn save_dict(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.save_setting(key, value)
    }

    pub fn name(&self) -> Result<Option<String>, StoreError> {
        self.setting(settings::NAME_KEY)
    }

    pub fn set_name(&self, name: &str) -> Result<(), StoreError> {
        self.save_setting(settings::NAME_KEY, name)
    }

    pub fn mqtt_topic(&self) -> Result<Option<String>, StoreError> {
        self.setting(settings::MQTT_TOPIC_KEY)
    }

    pub fn set_mqtt_topic(&self, topic: &str) -> Result<(), StoreError> {
        self.save_setting(settings::MQTT_TOPIC_KEY, topic)
    }

    // -- Processor definitions --------------------------------------------

    /// Add a stage definition; without an explicit `order` it goes last.
    pub fn add_processor(
        &self,
        kind: ProcessorKind,
        type_name: &str,
        params: &Value,
        order: Option<i64>,
    ) -> Result<i64, StoreError> {
        self.with_writer(|conn| processors::insert(conn, kind, type_name, params, order))
    }

    pub fn delete_processor(&self, kind: ProcessorKind, id: i64) -> Result<(), StoreError> {
        self.with_writer(|conn| processors::delete(conn, kind, id))
    }

    /// Re-rank stages so that `ids[i]` runs at position `i`.
    pub fn reorder_processors(&self, kind: ProcessorKind, ids: &[i64]) -> Result<(), StoreError> {
        self.with_writer(|conn| processors::reorder(conn, kind, ids))
    }

    pub fn processors(&self, kind: ProcessorKind) -> Result<Vec<ProcessorDefinition>, StoreError> {
        self.with_reader(|conn| processors::list(conn, kind))
    }

    // -- Misc --------------------------------------------------------------

    /// Size of the database file in bytes.
    pub fn model_size(&self) -> Result<u64, StoreError> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

impl Drop for ObservationStore {
    fn drop(&mut self) {
        self.close();
    }
}
