//! SQLite connection tuning shared by the writer and reader connections.

use rusqlite::Connection;
use std::time::Duration;

const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Apply durability PRAGMAs (WAL, NORMAL sync, busy timeout)
///
/// WAL lets the reader connection see a consistent snapshot while the writer
/// commits, which is what allows reads to skip the store's write mutex.
pub fn apply_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        log::warn!("SQLite refused WAL journal mode, running with {}", mode);
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// Same as [`apply_pragmas`] but also locks the connection to read-only queries.
pub fn apply_reader_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    apply_pragmas(conn)?;
    conn.pragma_update(None, "query_only", "ON")?;
    Ok(())
}
