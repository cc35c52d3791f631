//! Ordered registry of known entity names.
//!
//! `order_index` comes from an AUTOINCREMENT key, so it is assigned once at
//! creation and never handed out again, even after the entity is deleted.
//! Observation blobs lay their fields out in ascending `order_index`.

use super::StoreError;
use crate::types::{EntityKey, EntityKind};
use rusqlite::Connection;
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct EntitySchema {
    keys: Vec<EntityKey>,
    positions: HashMap<String, usize>,
}

impl EntitySchema {
    pub fn load(conn: &Connection) -> Result<Self, StoreError> {
        let mut stmt =
            conn.prepare("SELECT order_index, name, kind FROM entity_keys ORDER BY order_index ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut keys = Vec::new();
        for row in rows {
            let (order_index, name, code) = row?;
            let kind = EntityKind::from_code(code).ok_or_else(|| StoreError::CorruptRecord {
                reason: format!("entity '{}' has unknown kind code {}", name, code),
            })?;
            keys.push(EntityKey {
                name,
                kind,
                order_index,
                significance: 0.0,
            });
        }
        Ok(Self::from_keys(keys))
    }

    pub fn from_keys(keys: Vec<EntityKey>) -> Self {
        let positions = keys
            .iter()
            .enumerate()
            .map(|(i, key)| (key.name.clone(), i))
            .collect();
        Self { keys, positions }
    }

    pub fn get(&self, name: &str) -> Option<&EntityKey> {
        self.positions.get(name).map(|&i| &self.keys[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    /// Keys in layout order.
    pub fn keys(&self) -> &[EntityKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Schema with `name` removed, preserving the order of the rest.
    pub fn without(&self, name: &str) -> Self {
        Self::from_keys(self.keys.iter().filter(|k| k.name != name).cloned().collect())
    }
}

/// Register `name` if it is new. First writer wins on a race; the kind is
/// never changed afterwards. Caller holds the write lock.
pub(super) fn insert_key(conn: &Connection, name: &str, kind: EntityKind) -> Result<bool, StoreError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO entity_keys (name, kind) VALUES (?1, ?2)",
        rusqlite::params![name, kind.code()],
    )?;
    Ok(inserted > 0)
}
