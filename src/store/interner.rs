//! Bidirectional string <-> id table for categorical values.
//!
//! Backed by the append-only `string_table`. Ids are SQLite row ids, so they
//! start at 1 and are never reused.

use super::StoreError;
use rusqlite::Connection;
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct StringInterner {
    by_value: HashMap<String, i64>,
    by_id: HashMap<i64, String>,
}

impl StringInterner {
    /// Load the full table into memory.
    pub fn load(conn: &Connection) -> Result<Self, StoreError> {
        let mut stmt = conn.prepare("SELECT id, value FROM string_table")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

        let mut interner = Self::default();
        for row in rows {
            let (id, value) = row?;
            interner.by_value.insert(value.clone(), id);
            interner.by_id.insert(id, value);
        }
        Ok(interner)
    }

    pub fn lookup(&self, value: &str) -> Option<i64> {
        self.by_value.get(value).copied()
    }

    /// Reverse lookup. A cache that predates a concurrent insert returns `None`.
    pub fn resolve(&self, id: i64) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Insert `value` if missing and return its id. Caller holds the write lock.
pub(super) fn insert_value(conn: &Connection, value: &str) -> Result<i64, StoreError> {
    conn.execute("INSERT OR IGNORE INTO string_table (value) VALUES (?1)", [value])?;
    let id = conn.query_row(
        "SELECT id FROM string_table WHERE value = ?1",
        [value],
        |row| row.get(0),
    )?;
    Ok(id)
}
