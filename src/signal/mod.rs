//! Pattern signal engine.
//!
//! Consumes the persisted-round stream one source at a time. Each new
//! round first resolves any pending signal for its source (two attempts
//! at most, the second being the gale), then tests the three most recent
//! outcomes against the entry pattern and opens a new pending signal on a
//! match. At most one signal is pending per source at any moment.

use crate::bus::{BusEvent, EventPublisher};
use crate::cache::BoundedSet;
use crate::store::rounds::RoundStore;
use crate::store::signals::{SignalStatus, SignalStore};
use crate::store::StoreError;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

/// An attempt wins when the round crashes above this multiplier.
pub const WIN_THRESHOLD: f64 = 1.50;
/// Entry pattern, newest first: two results above the win threshold
/// followed by one below this cap.
pub const PATTERN_CAP: f64 = 2.00;

/// How many recent rounds to fetch; the pattern needs the newest 3
/// distinct ones.
const RECENT_LOOKBACK: usize = 5;
/// Idempotency guard capacity.
const PROCESSED_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy)]
struct PendingSlot {
    signal_id: i64,
    awaiting_gale: bool,
}

pub struct SignalEngine {
    rounds: Arc<dyn RoundStore>,
    signals: Arc<dyn SignalStore>,
    publisher: Arc<dyn EventPublisher>,
    /// source id -> open signal. Hydrated lazily from the store so a
    /// restart resumes mid-signal.
    pending: Mutex<HashMap<i64, PendingSlot>>,
    /// Duplicate-delivery guard keyed by (source, round, multiplier).
    processed: StdMutex<BoundedSet<String>>,
}

impl SignalEngine {
    pub fn new(
        rounds: Arc<dyn RoundStore>,
        signals: Arc<dyn SignalStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            rounds,
            signals,
            publisher,
            pending: Mutex::new(HashMap::new()),
            processed: StdMutex::new(BoundedSet::new(PROCESSED_CAPACITY)),
        }
    }

    /// Feed one newly persisted round through resolution and detection.
    pub async fn on_round_persisted(
        &self,
        source_id: i64,
        round_id: &str,
        multiplier: f64,
    ) -> Result<(), StoreError> {
        let guard_key = format!("{}:{}:{:.4}", source_id, round_id, multiplier);
        if !self.processed.lock().unwrap().insert(guard_key) {
            log::debug!(
                "Signal engine ignoring duplicate delivery: source={} round={}",
                source_id,
                round_id
            );
            return Ok(());
        }

        let mut pending = self.pending.lock().await;

        if let Some(slot) = self.load_slot(&mut pending, source_id).await? {
            self.resolve_attempt(&mut pending, source_id, slot, round_id, multiplier)
                .await?;
        }

        if !pending.contains_key(&source_id) {
            self.detect(&mut pending, source_id).await?;
        }
        Ok(())
    }

    /// Pending slot for the source, falling back to the store after a
    /// restart.
    async fn load_slot(
        &self,
        pending: &mut HashMap<i64, PendingSlot>,
        source_id: i64,
    ) -> Result<Option<PendingSlot>, StoreError> {
        if let Some(slot) = pending.get(&source_id) {
            return Ok(Some(*slot));
        }
        let Some(signal) = self.signals.pending_for_source(source_id).await? else {
            return Ok(None);
        };
        let attempts = self.signals.attempts(signal.id).await?;
        let slot = PendingSlot {
            signal_id: signal.id,
            awaiting_gale: !attempts.is_empty(),
        };
        pending.insert(source_id, slot);
        Ok(Some(slot))
    }

    async fn resolve_attempt(
        &self,
        pending: &mut HashMap<i64, PendingSlot>,
        source_id: i64,
        slot: PendingSlot,
        round_id: &str,
        multiplier: f64,
    ) -> Result<(), StoreError> {
        let is_win = multiplier > WIN_THRESHOLD;
        let attempt_number = if slot.awaiting_gale { 2 } else { 1 };
        let now = chrono::Utc::now().timestamp_millis();

        self.signals
            .record_attempt(slot.signal_id, attempt_number, multiplier, is_win, round_id, now)
            .await?;

        if attempt_number == 1 && !is_win {
            // First attempt lost: hold the slot for the gale round
            pending.insert(
                source_id,
                PendingSlot {
                    signal_id: slot.signal_id,
                    awaiting_gale: true,
                },
            );
            log::info!(
                "🔁 Signal {} source {} lost attempt 1 at {:.2}x, awaiting gale",
                slot.signal_id,
                source_id,
                multiplier
            );
            return Ok(());
        }

        let status = if is_win {
            SignalStatus::Won
        } else {
            SignalStatus::Lost
        };
        let gale_used = attempt_number == 2;
        let resolved = self
            .signals
            .resolve(slot.signal_id, status, gale_used, now)
            .await?;
        pending.remove(&source_id);

        log::info!(
            "🏁 Signal {} source {} {} at {:.2}x (gale: {})",
            slot.signal_id,
            source_id,
            status.as_str(),
            multiplier,
            gale_used
        );
        self.publisher.publish(BusEvent::SignalResult {
            source_id,
            signal: resolved,
        });
        Ok(())
    }

    async fn detect(
        &self,
        pending: &mut HashMap<i64, PendingSlot>,
        source_id: i64,
    ) -> Result<(), StoreError> {
        let recents = self.rounds.recent(source_id, RECENT_LOOKBACK).await?;
        if recents.len() < 3 {
            return Ok(());
        }
        let pattern = [
            recents[0].max_multiplier,
            recents[1].max_multiplier,
            recents[2].max_multiplier,
        ];
        let matched = pattern[0] > WIN_THRESHOLD
            && pattern[1] > WIN_THRESHOLD
            && pattern[2] < PATTERN_CAP;
        if !matched {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();
        let signal = self.signals.create(source_id, pattern, now).await?;
        pending.insert(
            source_id,
            PendingSlot {
                signal_id: signal.id,
                awaiting_gale: false,
            },
        );
        log::info!(
            "🚨 Signal {} emitted for source {} on pattern [{:.2}, {:.2}, {:.2}]",
            signal.id,
            source_id,
            pattern[0],
            pattern[1],
            pattern[2]
        );
        self.publisher.publish(BusEvent::SignalEmitted { source_id, signal });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::RecordingPublisher;
    use crate::store::open_database;
    use crate::store::rounds::{RoundRecord, SqliteRoundStore};
    use crate::store::signals::SqliteSignalStore;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        rounds: Arc<SqliteRoundStore>,
        signals: Arc<SqliteSignalStore>,
        publisher: Arc<RecordingPublisher>,
        engine: SignalEngine,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let conn = open_database(dir.path().join("signals.db")).unwrap();
        let conn = Arc::new(StdMutex::new(conn));
        let rounds = Arc::new(SqliteRoundStore::new(conn.clone()));
        let signals = Arc::new(SqliteSignalStore::new(conn));
        let publisher = Arc::new(RecordingPublisher::new());
        let engine = SignalEngine::new(rounds.clone(), signals.clone(), publisher.clone());
        Fixture {
            _dir: dir,
            rounds,
            signals,
            publisher,
            engine,
        }
    }

    /// Persist a round directly and feed it to the engine.
    async fn feed(fx: &Fixture, source_id: i64, round_id: &str, multiplier: f64, at: i64) {
        fx.rounds
            .upsert(RoundRecord {
                source_id,
                round_id: round_id.to_string(),
                bets_count: 0,
                total_bet_amount: 0.0,
                online_players: 0,
                max_multiplier: multiplier,
                total_cashout: 0.0,
                created_at: at,
            })
            .await
            .unwrap();
        fx.engine
            .on_round_persisted(source_id, round_id, multiplier)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pattern_emits_signal() {
        let fx = fixture();
        // Oldest to newest: 1.90, 1.60, 1.80 -> newest-first [1.80, 1.60, 1.90]
        feed(&fx, 1, "r1", 1.90, 1000).await;
        feed(&fx, 1, "r2", 1.60, 2000).await;
        feed(&fx, 1, "r3", 1.80, 3000).await;

        let pending = fx.signals.pending_for_source(1).await.unwrap().unwrap();
        assert_eq!(pending.pattern, [1.80, 1.60, 1.90]);
        assert!(fx
            .publisher
            .events()
            .iter()
            .any(|e| matches!(e, BusEvent::SignalEmitted { source_id: 1, .. })));
    }

    #[tokio::test]
    async fn test_pattern_rejects_high_third_result() {
        let fx = fixture();
        // Newest-first [1.80, 1.60, 2.10]: third result too high
        feed(&fx, 1, "r1", 2.10, 1000).await;
        feed(&fx, 1, "r2", 1.60, 2000).await;
        feed(&fx, 1, "r3", 1.80, 3000).await;
        assert!(fx.signals.pending_for_source(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pattern_rejects_low_newest_result() {
        let fx = fixture();
        // Newest-first [1.40, 1.60, 1.90]: newest below the threshold
        feed(&fx, 1, "r1", 1.90, 1000).await;
        feed(&fx, 1, "r2", 1.60, 2000).await;
        feed(&fx, 1, "r3", 1.40, 3000).await;
        assert!(fx.signals.pending_for_source(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_first_attempt_win_closes_signal() {
        let fx = fixture();
        feed(&fx, 1, "r1", 1.90, 1000).await;
        feed(&fx, 1, "r2", 1.60, 2000).await;
        feed(&fx, 1, "r3", 1.80, 3000).await;
        let signal = fx.signals.pending_for_source(1).await.unwrap().unwrap();

        feed(&fx, 1, "r4", 1.80, 4000).await;

        let attempts = fx.signals.attempts(signal.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].is_win);

        let resolved = resolved_signal(&fx, signal.id).await;
        assert_eq!(resolved.status, SignalStatus::Won);
        assert!(!resolved.gale_used);
    }

    #[tokio::test]
    async fn test_gale_win_after_first_loss() {
        let fx = fixture();
        feed(&fx, 1, "r1", 1.90, 1000).await;
        feed(&fx, 1, "r2", 1.60, 2000).await;
        feed(&fx, 1, "r3", 1.80, 3000).await;
        let signal = fx.signals.pending_for_source(1).await.unwrap().unwrap();

        feed(&fx, 1, "r4", 1.20, 4000).await; // Attempt 1: loss
        assert!(fx.signals.pending_for_source(1).await.unwrap().is_some());

        feed(&fx, 1, "r5", 1.80, 5000).await; // Attempt 2: win

        let attempts = fx.signals.attempts(signal.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].is_win);
        assert!(attempts[1].is_win);

        let resolved = resolved_signal(&fx, signal.id).await;
        assert_eq!(resolved.status, SignalStatus::Won);
        assert!(resolved.gale_used);
    }

    #[tokio::test]
    async fn test_two_losses_resolve_lost() {
        let fx = fixture();
        feed(&fx, 1, "r1", 1.90, 1000).await;
        feed(&fx, 1, "r2", 1.60, 2000).await;
        feed(&fx, 1, "r3", 1.80, 3000).await;
        let signal = fx.signals.pending_for_source(1).await.unwrap().unwrap();

        feed(&fx, 1, "r4", 1.10, 4000).await;
        feed(&fx, 1, "r5", 1.30, 5000).await;

        let resolved = resolved_signal(&fx, signal.id).await;
        assert_eq!(resolved.status, SignalStatus::Lost);
        assert!(resolved.gale_used);
        assert_eq!(fx.signals.attempts(signal.id).await.unwrap().len(), 2);
        assert!(fx
            .publisher
            .events()
            .iter()
            .any(|e| matches!(e, BusEvent::SignalResult { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_ignored() {
        let fx = fixture();
        feed(&fx, 1, "r1", 1.90, 1000).await;
        feed(&fx, 1, "r2", 1.60, 2000).await;
        feed(&fx, 1, "r3", 1.80, 3000).await;
        let signal = fx.signals.pending_for_source(1).await.unwrap().unwrap();

        feed(&fx, 1, "r4", 1.20, 4000).await;
        // Same round delivered again must not consume the gale attempt
        fx.engine.on_round_persisted(1, "r4", 1.20).await.unwrap();

        let attempts = fx.signals.attempts(signal.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(fx.signals.pending_for_source(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sources_hold_independent_slots() {
        let fx = fixture();
        for (src, base) in [(1i64, 0i64), (2, 100_000)] {
            feed(&fx, src, "r1", 1.90, base + 1000).await;
            feed(&fx, src, "r2", 1.60, base + 2000).await;
            feed(&fx, src, "r3", 1.80, base + 3000).await;
        }
        assert!(fx.signals.pending_for_source(1).await.unwrap().is_some());
        assert!(fx.signals.pending_for_source(2).await.unwrap().is_some());
    }

    async fn resolved_signal(
        fx: &Fixture,
        signal_id: i64,
    ) -> crate::store::signals::Signal {
        let signal = fx.signals.get(signal_id).await.unwrap();
        assert_ne!(signal.status, SignalStatus::Pending);
        signal
    }
}
