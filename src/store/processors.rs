//! Persisted processor definitions (pre- and post-stage tables).

use super::StoreError;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;

/// Which pipeline a definition belongs to. Each kind has its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProcessorKind {
    Pre,
    Post,
}

impl ProcessorKind {
    pub(super) fn table(self) -> &'static str {
        match self {
            ProcessorKind::Pre => "preprocessors",
            ProcessorKind::Post => "postprocessors",
        }
    }
}

/// A stage as stored: type tag, JSON params and zero-based rank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessorDefinition {
    pub id: i64,
    pub kind: ProcessorKind,
    pub type_name: String,
    pub params: Value,
    pub order: i64,
}

pub(super) fn insert(
    conn: &mut Connection,
    kind: ProcessorKind,
    type_name: &str,
    params: &Value,
    order: Option<i64>,
) -> Result<i64, StoreError> {
    let table = kind.table();
    let tx = conn.transaction()?;
    let order = match order {
        Some(order) => order,
        None => tx.query_row(
            &format!("SELECT COALESCE(MAX(order_num) + 1, 0) FROM {}", table),
            [],
            |row| row.get(0),
        )?,
    };
    tx.execute(
        &format!("INSERT INTO {} (type, params, order_num) VALUES (?1, ?2, ?3)", table),
        params![type_name, serde_json::to_string(params)?, order],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;
    Ok(id)
}

/// Delete a definition and close the gap it leaves in the ranking.
pub(super) fn delete(conn: &mut Connection, kind: ProcessorKind, id: i64) -> Result<(), StoreError> {
    let table = kind.table();
    let tx = conn.transaction()?;
    tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table), [id])?;
    let remaining = ids_in_order(&tx, table)?;
    write_ranks(&tx, table, &remaining)?;
    tx.commit()?;
    Ok(())
}

/// Rewrite every rank so that `ids[i]` gets rank `i`.
pub(super) fn reorder(conn: &mut Connection, kind: ProcessorKind, ids: &[i64]) -> Result<(), StoreError> {
    let table = kind.table();
    let tx = conn.transaction()?;

    let mut existing = ids_in_order(&tx, table)?;
    let mut requested = ids.to_vec();
    existing.sort_unstable();
    requested.sort_unstable();
    if existing != requested {
        return Err(StoreError::InvalidOrder(format!(
            "{:?} is not a permutation of the {} ids",
            ids, table
        )));
    }

    write_ranks(&tx, table, ids)?;
    tx.commit()?;
    Ok(())
}

pub(super) fn list(conn: &Connection, kind: ProcessorKind) -> Result<Vec<ProcessorDefinition>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, type, params, order_num FROM {} ORDER BY order_num ASC, id ASC",
        kind.table()
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;

    let mut definitions = Vec::new();
    for row in rows {
        let (id, type_name, params, order) = row?;
        definitions.push(ProcessorDefinition {
            id,
            kind,
            type_name,
            params: serde_json::from_str(&params)?,
            order,
        });
    }
    Ok(definitions)
}

fn ids_in_order(conn: &Connection, table: &str) -> Result<Vec<i64>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT id FROM {} ORDER BY order_num ASC, id ASC", table))?;
    let ids = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn write_ranks(conn: &Connection, table: &str, ids: &[i64]) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(&format!("UPDATE {} SET order_num = ?1 WHERE id = ?2", table))?;
    for (rank, id) in ids.iter().enumerate() {
        stmt.execute(params![rank as i64, id])?;
    }
    Ok(())
}
