//! Signal persistence.

use super::StoreError;
use async_trait::async_trait;
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Pending,
    Won,
    Lost,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Pending => "pending",
            SignalStatus::Won => "won",
            SignalStatus::Lost => "lost",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "won" => SignalStatus::Won,
            "lost" => SignalStatus::Lost,
            _ => SignalStatus::Pending,
        }
    }
}

/// One emitted signal. Created pending, mutated at most twice, then
/// immutable.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub id: i64,
    pub source_id: i64,
    /// The three multipliers that triggered the signal, newest first.
    pub pattern: [f64; 3],
    pub status: SignalStatus,
    pub gale_used: bool,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalAttempt {
    pub id: i64,
    pub signal_id: i64,
    pub attempt_number: i64,
    pub result_multiplier: f64,
    pub is_win: bool,
    pub round_id: String,
    pub created_at: i64,
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn create(
        &self,
        source_id: i64,
        pattern: [f64; 3],
        created_at: i64,
    ) -> Result<Signal, StoreError>;

    async fn record_attempt(
        &self,
        signal_id: i64,
        attempt_number: i64,
        result_multiplier: f64,
        is_win: bool,
        round_id: &str,
        created_at: i64,
    ) -> Result<SignalAttempt, StoreError>;

    async fn resolve(
        &self,
        signal_id: i64,
        status: SignalStatus,
        gale_used: bool,
        resolved_at: i64,
    ) -> Result<Signal, StoreError>;

    async fn pending_for_source(&self, source_id: i64) -> Result<Option<Signal>, StoreError>;

    async fn get(&self, signal_id: i64) -> Result<Signal, StoreError>;

    async fn attempts(&self, signal_id: i64) -> Result<Vec<SignalAttempt>, StoreError>;
}

pub struct SqliteSignalStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSignalStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

const SIGNAL_COLUMNS: &str =
    "id, source_id, pattern, status, gale_used, created_at, resolved_at";

fn row_to_signal(row: &Row) -> rusqlite::Result<Signal> {
    let pattern_json: String = row.get(2)?;
    let values: Vec<f64> = serde_json::from_str(&pattern_json).unwrap_or_default();
    let mut pattern = [0.0; 3];
    for (slot, value) in pattern.iter_mut().zip(values) {
        *slot = value;
    }
    let status: String = row.get(3)?;
    Ok(Signal {
        id: row.get(0)?,
        source_id: row.get(1)?,
        pattern,
        status: SignalStatus::parse(&status),
        gale_used: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        resolved_at: row.get(6)?,
    })
}

fn row_to_attempt(row: &Row) -> rusqlite::Result<SignalAttempt> {
    Ok(SignalAttempt {
        id: row.get(0)?,
        signal_id: row.get(1)?,
        attempt_number: row.get(2)?,
        result_multiplier: row.get(3)?,
        is_win: row.get::<_, i64>(4)? != 0,
        round_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[async_trait]
impl SignalStore for SqliteSignalStore {
    async fn create(
        &self,
        source_id: i64,
        pattern: [f64; 3],
        created_at: i64,
    ) -> Result<Signal, StoreError> {
        let pattern_json = serde_json::to_string(&pattern)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO signals (source_id, pattern, status, gale_used, created_at)
             VALUES (?1, ?2, 'pending', 0, ?3)",
            params![source_id, pattern_json, created_at],
        )?;
        let id = conn.last_insert_rowid();
        let signal = conn.query_row(
            &format!("SELECT {} FROM signals WHERE id = ?1", SIGNAL_COLUMNS),
            params![id],
            row_to_signal,
        )?;
        Ok(signal)
    }

    async fn record_attempt(
        &self,
        signal_id: i64,
        attempt_number: i64,
        result_multiplier: f64,
        is_win: bool,
        round_id: &str,
        created_at: i64,
    ) -> Result<SignalAttempt, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO signal_attempts
                (signal_id, attempt_number, result_multiplier, is_win, round_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                signal_id,
                attempt_number,
                result_multiplier,
                is_win as i64,
                round_id,
                created_at
            ],
        )?;
        let id = conn.last_insert_rowid();
        let attempt = conn.query_row(
            "SELECT id, signal_id, attempt_number, result_multiplier, is_win, round_id, created_at
             FROM signal_attempts WHERE id = ?1",
            params![id],
            row_to_attempt,
        )?;
        Ok(attempt)
    }

    async fn resolve(
        &self,
        signal_id: i64,
        status: SignalStatus,
        gale_used: bool,
        resolved_at: i64,
    ) -> Result<Signal, StoreError> {
        let conn = self.conn.lock().unwrap();
        let resolved_stamp = match status {
            SignalStatus::Pending => None,
            _ => Some(resolved_at),
        };
        let changed = conn.execute(
            "UPDATE signals SET status = ?1, gale_used = ?2, resolved_at = ?3 WHERE id = ?4",
            params![status.as_str(), gale_used as i64, resolved_stamp, signal_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        let signal = conn.query_row(
            &format!("SELECT {} FROM signals WHERE id = ?1", SIGNAL_COLUMNS),
            params![signal_id],
            row_to_signal,
        )?;
        Ok(signal)
    }

    async fn pending_for_source(&self, source_id: i64) -> Result<Option<Signal>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM signals
             WHERE source_id = ?1 AND status = 'pending'
             ORDER BY id DESC LIMIT 1",
            SIGNAL_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![source_id], row_to_signal)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn get(&self, signal_id: i64) -> Result<Signal, StoreError> {
        let conn = self.conn.lock().unwrap();
        let signal = conn.query_row(
            &format!("SELECT {} FROM signals WHERE id = ?1", SIGNAL_COLUMNS),
            params![signal_id],
            row_to_signal,
        )?;
        Ok(signal)
    }

    async fn attempts(&self, signal_id: i64) -> Result<Vec<SignalAttempt>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, signal_id, attempt_number, result_multiplier, is_win, round_id, created_at
             FROM signal_attempts WHERE signal_id = ?1 ORDER BY attempt_number ASC",
        )?;
        let rows = stmt.query_map(params![signal_id], row_to_attempt)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_database;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, SqliteSignalStore) {
        let dir = tempdir().unwrap();
        let conn = open_database(dir.path().join("signals.db")).unwrap();
        (dir, SqliteSignalStore::new(Arc::new(Mutex::new(conn))))
    }

    #[tokio::test]
    async fn test_create_and_pending_lookup() {
        let (_dir, store) = store();
        let signal = store.create(7, [1.8, 1.6, 1.9], 1000).await.unwrap();
        assert_eq!(signal.status, SignalStatus::Pending);
        assert_eq!(signal.pattern, [1.8, 1.6, 1.9]);

        let pending = store.pending_for_source(7).await.unwrap().unwrap();
        assert_eq!(pending.id, signal.id);
        assert!(store.pending_for_source(8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_clears_pending() {
        let (_dir, store) = store();
        let signal = store.create(7, [1.8, 1.6, 1.9], 1000).await.unwrap();

        let resolved = store
            .resolve(signal.id, SignalStatus::Won, false, 2000)
            .await
            .unwrap();
        assert_eq!(resolved.status, SignalStatus::Won);
        assert_eq!(resolved.resolved_at, Some(2000));
        assert!(!resolved.gale_used);
        assert!(store.pending_for_source(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attempts_recorded_in_order() {
        let (_dir, store) = store();
        let signal = store.create(3, [1.8, 1.6, 1.9], 1000).await.unwrap();

        store
            .record_attempt(signal.id, 1, 1.2, false, "r10", 1100)
            .await
            .unwrap();
        store
            .record_attempt(signal.id, 2, 1.8, true, "r11", 1200)
            .await
            .unwrap();

        let attempts = store.attempts(signal.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].attempt_number, 1);
        assert!(!attempts[0].is_win);
        assert_eq!(attempts[1].attempt_number, 2);
        assert!(attempts[1].is_win);
    }
}
