//! Dedup/persistence coordinator.
//!
//! Finalize can fire from three independent paths (state change, crash
//! message, chart-info backup) and sources reconnect mid-round, so the
//! same round reaches this point more than once and often without a
//! server-issued id. The coordinator owns the identity rules: synthesize
//! missing ids, skip replays, merge twin synthesized rounds, clamp
//! out-of-range numbers, and let the store's uniqueness constraint catch
//! whatever slips through.

use crate::cache::BoundedSet;
use crate::round::RoundSnapshot;
use crate::store::rounds::{PersistedRound, RoundRecord, RoundStore};
use crate::store::StoreError;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Multipliers this close count as the same outcome when merging
/// synthesized ids.
pub const MULTIPLIER_EPSILON: f64 = 0.01;
/// Storage maxima; values beyond these clamp, they never error.
pub const MAX_MULTIPLIER: f64 = 99_999_999.99;
pub const MAX_AMOUNT: f64 = 999_999_999_999.99;

/// Similarity search horizon for a synthesized id.
const SIMILAR_WINDOW_MS: i64 = 5 * 60 * 1000;
/// Horizon for collapsing two synthesized ids into one round.
const TEMP_MERGE_WINDOW_MS: i64 = 30 * 1000;
const TEMP_ID_PREFIX: &str = "temp_";
/// Capacity of the in-process recently-persisted set.
const RECENT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Multiplier missing, non-finite or not positive.
    UnusableMultiplier,
    /// Seen in the in-process recently-persisted set.
    RecentlyPersisted,
    /// A row already exists for the natural key.
    AlreadyStored,
}

#[derive(Debug)]
pub enum PersistOutcome {
    Persisted(PersistedRound),
    Skipped(SkipReason),
}

pub struct RoundCoordinator {
    store: Arc<dyn RoundStore>,
    recently_persisted: Mutex<BoundedSet<String>>,
    /// Best-effort JSONL side log for rounds the store refused.
    backup_log: Option<PathBuf>,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl RoundCoordinator {
    pub fn new(store: Arc<dyn RoundStore>, backup_log: Option<PathBuf>) -> Self {
        Self::with_now_fn(
            store,
            backup_log,
            Box::new(|| chrono::Utc::now().timestamp_millis()),
        )
    }

    /// Deterministic clock for the time-window tests.
    pub fn with_now_fn(
        store: Arc<dyn RoundStore>,
        backup_log: Option<PathBuf>,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            store,
            recently_persisted: Mutex::new(BoundedSet::new(RECENT_CAPACITY)),
            backup_log,
            now_fn,
        }
    }

    /// Persist one finalized snapshot exactly once. Errors are appended
    /// to the side log before they bubble up; the caller logs and moves
    /// on, one failed round never halts ingestion.
    pub async fn persist(
        &self,
        source_id: i64,
        snapshot: &RoundSnapshot,
    ) -> Result<PersistOutcome, StoreError> {
        match self.persist_inner(source_id, snapshot).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.backup(source_id, snapshot, &err);
                Err(err)
            }
        }
    }

    async fn persist_inner(
        &self,
        source_id: i64,
        snapshot: &RoundSnapshot,
    ) -> Result<PersistOutcome, StoreError> {
        let multiplier = snapshot.max_multiplier;
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Ok(PersistOutcome::Skipped(SkipReason::UnusableMultiplier));
        }

        let now = (self.now_fn)();
        let synthesized = snapshot.round_id.is_none();
        let round_id = match &snapshot.round_id {
            Some(id) => id.clone(),
            None => format!("{}{}_{}", TEMP_ID_PREFIX, source_id, now),
        };

        let seen_key = format!("{}:{}", source_id, round_id);
        if self.recently_persisted.lock().unwrap().contains(&seen_key) {
            return Ok(PersistOutcome::Skipped(SkipReason::RecentlyPersisted));
        }

        if self
            .store
            .find_by_natural_key(source_id, &round_id)
            .await?
            .is_some()
        {
            self.mark_seen(seen_key);
            return Ok(PersistOutcome::Skipped(SkipReason::AlreadyStored));
        }

        let record = RoundRecord {
            source_id,
            round_id: round_id.clone(),
            bets_count: snapshot.bets_count.max(0),
            total_bet_amount: clamp_amount(snapshot.total_bet_amount),
            online_players: snapshot.online_players.max(0),
            max_multiplier: multiplier.min(MAX_MULTIPLIER),
            total_cashout: clamp_amount(snapshot.total_cashout),
            created_at: now,
        };

        // A synthesized id may be a twin of a round that was already
        // persisted without its server id ever arriving. Only two
        // synthesized ids close in time are merged; a genuine server id
        // is never rewritten.
        if synthesized {
            let similar = self
                .store
                .find_similar(source_id, multiplier, MULTIPLIER_EPSILON, now - SIMILAR_WINDOW_MS)
                .await?;
            if let Some(existing) = similar {
                let both_synthesized = existing.round_id.starts_with(TEMP_ID_PREFIX);
                let within_merge_window = (now - existing.created_at).abs() <= TEMP_MERGE_WINDOW_MS;
                if both_synthesized && within_merge_window {
                    match self
                        .store
                        .rewrite_round_id(existing.id, &round_id, &record)
                        .await
                    {
                        Ok(renamed) => {
                            self.mark_seen(seen_key);
                            return Ok(PersistOutcome::Persisted(renamed));
                        }
                        Err(StoreError::Conflict(_)) => {
                            return self.recover_existing(source_id, &round_id, seen_key).await;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }

        match self.store.upsert(record).await {
            Ok(persisted) => {
                self.mark_seen(seen_key);
                Ok(PersistOutcome::Persisted(persisted))
            }
            Err(StoreError::Conflict(_)) => {
                // Lost a race despite the checks above; the stored row
                // is the canonical one.
                self.recover_existing(source_id, &round_id, seen_key).await
            }
            Err(err) => Err(err),
        }
    }

    async fn recover_existing(
        &self,
        source_id: i64,
        round_id: &str,
        seen_key: String,
    ) -> Result<PersistOutcome, StoreError> {
        let existing = self
            .store
            .find_by_natural_key(source_id, round_id)
            .await?
            .ok_or(StoreError::NotFound)?;
        self.mark_seen(seen_key);
        Ok(PersistOutcome::Persisted(existing))
    }

    fn mark_seen(&self, key: String) {
        self.recently_persisted.lock().unwrap().insert(key);
    }

    fn backup(&self, source_id: i64, snapshot: &RoundSnapshot, err: &StoreError) {
        let Some(path) = &self.backup_log else {
            return;
        };
        let line = json!({
            "source_id": source_id,
            "round_id": snapshot.round_id,
            "max_multiplier": snapshot.max_multiplier,
            "total_bet_amount": snapshot.total_bet_amount,
            "total_cashout": snapshot.total_cashout,
            "error": err.to_string(),
            "at": (self.now_fn)(),
        });
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}", line));
        if let Err(io_err) = result {
            log::error!("❌ Backup log write failed for source {}: {}", source_id, io_err);
        }
    }
}

fn clamp_amount(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(0.0, MAX_AMOUNT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_database;
    use crate::store::rounds::SqliteRoundStore;
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        coordinator: RoundCoordinator,
        clock: Arc<AtomicI64>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let conn = open_database(dir.path().join("rounds.db")).unwrap();
        let store = Arc::new(SqliteRoundStore::new(Arc::new(Mutex::new(conn))));
        let clock = Arc::new(AtomicI64::new(1_000_000));
        let clock_ref = clock.clone();
        let coordinator = RoundCoordinator::with_now_fn(
            store,
            None,
            Box::new(move || clock_ref.load(Ordering::SeqCst)),
        );
        Fixture {
            _dir: dir,
            coordinator,
            clock,
        }
    }

    fn snapshot(round_id: Option<&str>, multiplier: f64) -> RoundSnapshot {
        RoundSnapshot {
            round_id: round_id.map(str::to_string),
            bets_count: 5,
            total_bet_amount: 100.0,
            online_players: 20,
            max_multiplier: multiplier,
            total_cashout: 50.0,
        }
    }

    fn count_rounds(fx: &Fixture) -> i64 {
        // The coordinator's store owns the connection; open a second one
        let path = fx._dir.path().join("rounds.db");
        let conn = Connection::open(path).unwrap();
        conn.query_row("SELECT COUNT(*) FROM rounds", [], |r| r.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_server_issued_id_persists_exactly_once() {
        let fx = fixture();
        for _ in 0..5 {
            fx.coordinator
                .persist(1, &snapshot(Some("r-42"), 2.0))
                .await
                .unwrap();
        }
        assert_eq!(count_rounds(&fx), 1);
    }

    #[tokio::test]
    async fn test_distinct_real_ids_with_equal_multiplier() {
        let fx = fixture();
        fx.coordinator
            .persist(1, &snapshot(Some("r-1"), 2.0))
            .await
            .unwrap();
        fx.coordinator
            .persist(1, &snapshot(Some("r-2"), 2.0))
            .await
            .unwrap();
        assert_eq!(count_rounds(&fx), 2);
    }

    #[tokio::test]
    async fn test_temp_ids_merge_within_30s() {
        let fx = fixture();
        let first = fx.coordinator.persist(1, &snapshot(None, 2.0)).await.unwrap();
        let PersistOutcome::Persisted(first) = first else {
            panic!("expected persist");
        };

        fx.clock.fetch_add(10_000, Ordering::SeqCst); // +10s
        let second = fx.coordinator.persist(1, &snapshot(None, 2.005)).await.unwrap();
        let PersistOutcome::Persisted(second) = second else {
            panic!("expected persist");
        };

        assert_eq!(count_rounds(&fx), 1);
        assert_eq!(second.id, first.id);
        assert_ne!(second.round_id, first.round_id); // Id rewritten forward
    }

    #[tokio::test]
    async fn test_temp_ids_apart_stay_distinct() {
        let fx = fixture();
        fx.coordinator.persist(1, &snapshot(None, 2.0)).await.unwrap();
        fx.clock.fetch_add(45_000, Ordering::SeqCst); // +45s
        fx.coordinator.persist(1, &snapshot(None, 2.0)).await.unwrap();
        assert_eq!(count_rounds(&fx), 2);
    }

    #[tokio::test]
    async fn test_temp_id_never_merges_into_real_id() {
        let fx = fixture();
        fx.coordinator
            .persist(1, &snapshot(Some("r-real"), 2.0))
            .await
            .unwrap();
        fx.clock.fetch_add(5_000, Ordering::SeqCst);
        fx.coordinator.persist(1, &snapshot(None, 2.0)).await.unwrap();
        assert_eq!(count_rounds(&fx), 2);
    }

    #[tokio::test]
    async fn test_unusable_multipliers_rejected() {
        let fx = fixture();
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let outcome = fx
                .coordinator
                .persist(1, &snapshot(Some("r-bad"), bad))
                .await
                .unwrap();
            assert!(matches!(
                outcome,
                PersistOutcome::Skipped(SkipReason::UnusableMultiplier)
            ));
        }
        assert_eq!(count_rounds(&fx), 0);
    }

    #[tokio::test]
    async fn test_overflow_clamps_to_storage_max() {
        let fx = fixture();
        let mut snap = snapshot(Some("r-huge"), 1e30);
        snap.total_bet_amount = 1e30;
        let outcome = fx.coordinator.persist(1, &snap).await.unwrap();
        let PersistOutcome::Persisted(round) = outcome else {
            panic!("expected persist");
        };
        assert_eq!(round.max_multiplier, MAX_MULTIPLIER);
        assert_eq!(round.total_bet_amount, MAX_AMOUNT);
        assert!(round.max_multiplier > 0.0);
    }

    #[tokio::test]
    async fn test_recently_persisted_set_skips_replay() {
        let fx = fixture();
        let first = fx
            .coordinator
            .persist(1, &snapshot(Some("r-9"), 2.0))
            .await
            .unwrap();
        assert!(matches!(first, PersistOutcome::Persisted(_)));
        let replay = fx
            .coordinator
            .persist(1, &snapshot(Some("r-9"), 2.0))
            .await
            .unwrap();
        assert!(matches!(
            replay,
            PersistOutcome::Skipped(SkipReason::RecentlyPersisted)
        ));
    }

    #[tokio::test]
    async fn test_backup_log_written_on_store_failure() {
        // Poison the schema so the upsert fails
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("rounds.db");
        let conn = open_database(&db_path).unwrap();
        conn.execute_batch("DROP TABLE rounds").unwrap();
        let store = Arc::new(SqliteRoundStore::new(Arc::new(Mutex::new(conn))));
        let backup = dir.path().join("failed_rounds.jsonl");
        let coordinator = RoundCoordinator::with_now_fn(
            store,
            Some(backup.clone()),
            Box::new(|| 1_000_000),
        );

        let result = coordinator.persist(1, &snapshot(Some("r-1"), 2.0)).await;
        assert!(result.is_err());
        let contents = std::fs::read_to_string(backup).unwrap();
        assert!(contents.contains("\"r-1\""));
    }
}
