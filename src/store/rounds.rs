//! Round persistence.

use super::StoreError;
use async_trait::async_trait;
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// One durable round row. Unique on (source_id, round_id).
#[derive(Debug, Clone, Serialize)]
pub struct PersistedRound {
    pub id: i64,
    pub source_id: i64,
    pub round_id: String,
    pub bets_count: i64,
    pub total_bet_amount: f64,
    pub online_players: i64,
    pub max_multiplier: f64,
    pub total_cashout: f64,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
}

/// Insert/update payload for one round.
#[derive(Debug, Clone)]
pub struct RoundRecord {
    pub source_id: i64,
    pub round_id: String,
    pub bets_count: i64,
    pub total_bet_amount: f64,
    pub online_players: i64,
    pub max_multiplier: f64,
    pub total_cashout: f64,
    pub created_at: i64,
}

#[async_trait]
pub trait RoundStore: Send + Sync {
    async fn find_by_natural_key(
        &self,
        source_id: i64,
        round_id: &str,
    ) -> Result<Option<PersistedRound>, StoreError>;

    /// Most recent round for the source with a multiplier within
    /// `epsilon` and created on or after `since` (epoch millis).
    async fn find_similar(
        &self,
        source_id: i64,
        multiplier: f64,
        epsilon: f64,
        since: i64,
    ) -> Result<Option<PersistedRound>, StoreError>;

    /// Insert on a fresh natural key, update counts on a repeated one.
    async fn upsert(&self, record: RoundRecord) -> Result<PersistedRound, StoreError>;

    /// Rename an existing row's round id and refresh its fields.
    /// Fails with [`StoreError::Conflict`] if the new id is already taken.
    async fn rewrite_round_id(
        &self,
        row_id: i64,
        new_round_id: &str,
        record: &RoundRecord,
    ) -> Result<PersistedRound, StoreError>;

    /// Up to `n` most recent rounds for the source, deduplicated by
    /// round id, newest first.
    async fn recent(&self, source_id: i64, n: usize) -> Result<Vec<PersistedRound>, StoreError>;
}

pub struct SqliteRoundStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRoundStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

fn row_to_round(row: &Row) -> rusqlite::Result<PersistedRound> {
    Ok(PersistedRound {
        id: row.get(0)?,
        source_id: row.get(1)?,
        round_id: row.get(2)?,
        bets_count: row.get(3)?,
        total_bet_amount: row.get(4)?,
        online_players: row.get(5)?,
        max_multiplier: row.get(6)?,
        total_cashout: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const ROUND_COLUMNS: &str = "id, source_id, round_id, bets_count, total_bet_amount, \
     online_players, max_multiplier, total_cashout, created_at, updated_at";

#[async_trait]
impl RoundStore for SqliteRoundStore {
    async fn find_by_natural_key(
        &self,
        source_id: i64,
        round_id: &str,
    ) -> Result<Option<PersistedRound>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rounds WHERE source_id = ?1 AND round_id = ?2",
            ROUND_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![source_id, round_id], row_to_round)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn find_similar(
        &self,
        source_id: i64,
        multiplier: f64,
        epsilon: f64,
        since: i64,
    ) -> Result<Option<PersistedRound>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rounds
             WHERE source_id = ?1
               AND ABS(max_multiplier - ?2) <= ?3
               AND created_at >= ?4
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
            ROUND_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![source_id, multiplier, epsilon, since], row_to_round)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: RoundRecord) -> Result<PersistedRound, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO rounds (
                source_id, round_id, bets_count, total_bet_amount,
                online_players, max_multiplier, total_cashout,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ON CONFLICT(source_id, round_id) DO UPDATE SET
                bets_count = excluded.bets_count,
                total_bet_amount = excluded.total_bet_amount,
                online_players = excluded.online_players,
                max_multiplier = excluded.max_multiplier,
                total_cashout = excluded.total_cashout,
                updated_at = excluded.updated_at
            "#,
            params![
                record.source_id,
                record.round_id,
                record.bets_count,
                record.total_bet_amount,
                record.online_players,
                record.max_multiplier,
                record.total_cashout,
                record.created_at,
            ],
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rounds WHERE source_id = ?1 AND round_id = ?2",
            ROUND_COLUMNS
        ))?;
        let round = stmt.query_row(params![record.source_id, record.round_id], row_to_round)?;
        Ok(round)
    }

    async fn rewrite_round_id(
        &self,
        row_id: i64,
        new_round_id: &str,
        record: &RoundRecord,
    ) -> Result<PersistedRound, StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            UPDATE rounds SET
                round_id = ?1,
                bets_count = ?2,
                total_bet_amount = ?3,
                online_players = ?4,
                max_multiplier = ?5,
                total_cashout = ?6,
                updated_at = ?7
            WHERE id = ?8
            "#,
            params![
                new_round_id,
                record.bets_count,
                record.total_bet_amount,
                record.online_players,
                record.max_multiplier,
                record.total_cashout,
                record.created_at,
                row_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rounds WHERE id = ?1",
            ROUND_COLUMNS
        ))?;
        let round = stmt.query_row(params![row_id], row_to_round)?;
        Ok(round)
    }

    async fn recent(&self, source_id: i64, n: usize) -> Result<Vec<PersistedRound>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rounds WHERE source_id = ?1
             ORDER BY created_at DESC, id DESC",
            ROUND_COLUMNS
        ))?;
        let rows = stmt.query_map(params![source_id], row_to_round)?;

        // Duplicate round ids can exist transiently around id rewrites;
        // the contract is one entry per round id, newest first.
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::with_capacity(n);
        for row in rows {
            let round = row?;
            if seen.insert(round.round_id.clone()) {
                out.push(round);
                if out.len() >= n {
                    break;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_database;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, SqliteRoundStore) {
        let dir = tempdir().unwrap();
        let conn = open_database(dir.path().join("rounds.db")).unwrap();
        (dir, SqliteRoundStore::new(Arc::new(Mutex::new(conn))))
    }

    fn record(source_id: i64, round_id: &str, multiplier: f64, created_at: i64) -> RoundRecord {
        RoundRecord {
            source_id,
            round_id: round_id.to_string(),
            bets_count: 10,
            total_bet_amount: 250.0,
            online_players: 40,
            max_multiplier: multiplier,
            total_cashout: 120.0,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let (_dir, store) = store();
        let first = store.upsert(record(1, "r1", 2.0, 1000)).await.unwrap();
        assert_eq!(first.bets_count, 10);

        let mut updated = record(1, "r1", 2.5, 2000);
        updated.bets_count = 25;
        let second = store.upsert(updated).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.bets_count, 25);
        assert_eq!(second.max_multiplier, 2.5);
        assert_eq!(second.created_at, 1000); // Original insert time kept
        assert_eq!(second.updated_at, 2000);
    }

    #[tokio::test]
    async fn test_find_similar_respects_window_and_epsilon() {
        let (_dir, store) = store();
        store.upsert(record(1, "temp_1_1000", 2.0, 1000)).await.unwrap();

        let hit = store.find_similar(1, 2.005, 0.01, 900).await.unwrap();
        assert!(hit.is_some());

        // Outside the window
        let miss = store.find_similar(1, 2.0, 0.01, 5000).await.unwrap();
        assert!(miss.is_none());

        // Outside epsilon
        let miss = store.find_similar(1, 2.5, 0.01, 900).await.unwrap();
        assert!(miss.is_none());

        // Different source
        let miss = store.find_similar(2, 2.0, 0.01, 900).await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_rewrite_round_id() {
        let (_dir, store) = store();
        let row = store.upsert(record(1, "temp_1_1000", 2.0, 1000)).await.unwrap();

        let renamed = store
            .rewrite_round_id(row.id, "temp_1_2000", &record(1, "temp_1_2000", 2.0, 2000))
            .await
            .unwrap();
        assert_eq!(renamed.id, row.id);
        assert_eq!(renamed.round_id, "temp_1_2000");

        // Renaming onto a taken id conflicts
        let other = store.upsert(record(1, "r-real", 3.0, 3000)).await.unwrap();
        let clash = store
            .rewrite_round_id(other.id, "temp_1_2000", &record(1, "temp_1_2000", 3.0, 3000))
            .await;
        assert!(matches!(clash, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_recent_dedups_newest_first() {
        let (_dir, store) = store();
        for (i, (rid, mult)) in [("a", 1.9), ("b", 1.6), ("c", 1.8)].iter().enumerate() {
            store
                .upsert(record(1, rid, *mult, 1000 + i as i64 * 1000))
                .await
                .unwrap();
        }

        let recents = store.recent(1, 5).await.unwrap();
        assert_eq!(recents.len(), 3);
        assert_eq!(recents[0].round_id, "c");
        assert_eq!(recents[2].round_id, "a");

        let limited = store.recent(1, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }
}
