//! Durable storage behind trait objects.
//!
//! All three stores share one SQLite database. Schema creation is
//! idempotent so the runtime can open a fresh or existing file the same
//! way; the external configuration surface owns the `sources` rows.

pub mod rounds;
pub mod signals;
pub mod sources;

use rusqlite::Connection;
use std::path::Path;

#[derive(Debug)]
pub enum StoreError {
    Database(String),
    /// Uniqueness violation on a natural key.
    Conflict(String),
    NotFound,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(err.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            _ => StoreError::Database(err.to_string()),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(msg) => write!(f, "database error: {}", msg),
            StoreError::Conflict(msg) => write!(f, "uniqueness conflict: {}", msg),
            StoreError::NotFound => write!(f, "row not found"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Open the database, apply the runtime PRAGMAs and create any missing
/// tables and indexes.
pub fn open_database(db_path: impl AsRef<Path>) -> Result<Connection, StoreError> {
    if let Some(parent) = db_path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Database(format!("create db directory: {}", e)))?;
        }
    }
    let conn = Connection::open(db_path)?;
    apply_pragmas(&conn)?;
    create_schema(&conn)?;
    log::info!("✅ SQLite database initialized with WAL mode");
    Ok(conn)
}

/// WAL + the usual write-heavy tuning set.
pub fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", -64000)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    Ok(())
}

pub fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            endpoint_url TEXT NOT NULL,
            handshake1 TEXT NOT NULL,
            handshake2 TEXT NOT NULL,
            handshake3 TEXT NOT NULL,
            decoder_mode TEXT NOT NULL DEFAULT 'auto',
            active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS rounds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL,
            round_id TEXT NOT NULL,
            bets_count INTEGER NOT NULL DEFAULT 0,
            total_bet_amount REAL NOT NULL DEFAULT 0,
            online_players INTEGER NOT NULL DEFAULT 0,
            max_multiplier REAL NOT NULL,
            total_cashout REAL NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(source_id, round_id)
        );
        CREATE INDEX IF NOT EXISTS idx_rounds_source_created
            ON rounds(source_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS signals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL,
            pattern TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            gale_used INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            resolved_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_signals_source_status
            ON signals(source_id, status);

        CREATE TABLE IF NOT EXISTS signal_attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            signal_id INTEGER NOT NULL,
            attempt_number INTEGER NOT NULL,
            result_multiplier REAL NOT NULL,
            is_win INTEGER NOT NULL,
            round_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY(signal_id) REFERENCES signals(id)
        );
        CREATE INDEX IF NOT EXISTS idx_attempts_signal
            ON signal_attempts(signal_id, attempt_number);
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_database_creates_schema() {
        let dir = tempdir().unwrap();
        let conn = open_database(dir.path().join("test.db")).unwrap();

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        for table in ["sources", "rounds", "signals", "signal_attempts"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }

    #[test]
    fn test_open_database_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        drop(open_database(&path).unwrap());
        drop(open_database(&path).unwrap());
    }

    #[test]
    fn test_natural_key_unique() {
        let dir = tempdir().unwrap();
        let conn = open_database(dir.path().join("test.db")).unwrap();
        conn.execute(
            "INSERT INTO rounds (source_id, round_id, max_multiplier, created_at, updated_at)
             VALUES (1, 'r1', 2.0, 0, 0)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO rounds (source_id, round_id, max_multiplier, created_at, updated_at)
             VALUES (1, 'r1', 3.0, 0, 0)",
            [],
        );
        assert!(matches!(
            dup.map_err(StoreError::from),
            Err(StoreError::Conflict(_))
        ));
    }
}
