//! Source health classification and the periodic monitor loop.

use super::supervisor::Supervisor;
use super::ConnectionStatus;
use crate::bus::{BusEvent, EventPublisher, HealthStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Silence thresholds, seconds since the last decoded message.
pub const WARNING_AFTER_SECS: i64 = 120;
pub const DOWN_AFTER_SECS: i64 = 300;
/// Consecutive down classifications that force a reconnect.
pub const DOWN_STREAK_LIMIT: u32 = 3;

/// Classify one source by connection presence and recency of activity.
pub fn classify(
    status: ConnectionStatus,
    last_activity_secs: Option<i64>,
    now_secs: i64,
) -> HealthStatus {
    if status != ConnectionStatus::Connected {
        return HealthStatus::Disconnected;
    }
    let Some(last) = last_activity_secs else {
        return HealthStatus::Down;
    };
    let silent_for = now_secs - last;
    if silent_for < WARNING_AFTER_SECS {
        HealthStatus::Healthy
    } else if silent_for < DOWN_AFTER_SECS {
        HealthStatus::Warning
    } else {
        HealthStatus::Down
    }
}

/// Tracks consecutive down classifications per source.
pub struct DownTracker {
    streaks: HashMap<i64, u32>,
    limit: u32,
}

impl DownTracker {
    pub fn new(limit: u32) -> Self {
        Self {
            streaks: HashMap::new(),
            limit,
        }
    }

    /// Record one classification. Returns true when the source just hit
    /// the streak limit and should be reconnected; the streak resets so
    /// the next trigger needs another full run of downs.
    pub fn observe(&mut self, source_id: i64, status: HealthStatus) -> bool {
        if status != HealthStatus::Down {
            self.streaks.remove(&source_id);
            return false;
        }
        let streak = self.streaks.entry(source_id).or_insert(0);
        *streak += 1;
        if *streak >= self.limit {
            self.streaks.remove(&source_id);
            return true;
        }
        false
    }
}

/// Periodic monitor: classify every source, force reconnects for
/// persistent downs, broadcast the snapshot.
pub async fn run_health_monitor(
    supervisor: Arc<Supervisor>,
    publisher: Arc<dyn EventPublisher>,
    period: Duration,
) {
    log::info!("🩺 Health monitor started (every {}s)", period.as_secs());
    let mut tracker = DownTracker::new(DOWN_STREAK_LIMIT);
    let mut timer = interval(period);
    timer.tick().await; // First tick fires immediately, skip it
    loop {
        timer.tick().await;
        let now = chrono::Utc::now().timestamp();
        let snapshot = supervisor.health_overview(now);
        for entry in &snapshot {
            if tracker.observe(entry.source_id, entry.status) {
                log::warn!(
                    "🔄 Source {} down for {} consecutive checks, forcing reconnect",
                    entry.source_id,
                    DOWN_STREAK_LIMIT
                );
                supervisor.force_reconnect(entry.source_id);
            }
        }
        publisher.publish(BusEvent::HealthSnapshot { sources: snapshot });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_thresholds() {
        let now = 10_000;
        // 130s silent -> warning
        assert_eq!(
            classify(ConnectionStatus::Connected, Some(now - 130), now),
            HealthStatus::Warning
        );
        // 310s silent -> down
        assert_eq!(
            classify(ConnectionStatus::Connected, Some(now - 310), now),
            HealthStatus::Down
        );
        // 30s silent -> healthy
        assert_eq!(
            classify(ConnectionStatus::Connected, Some(now - 30), now),
            HealthStatus::Healthy
        );
        // Boundary values
        assert_eq!(
            classify(ConnectionStatus::Connected, Some(now - 119), now),
            HealthStatus::Healthy
        );
        assert_eq!(
            classify(ConnectionStatus::Connected, Some(now - 120), now),
            HealthStatus::Warning
        );
        assert_eq!(
            classify(ConnectionStatus::Connected, Some(now - 300), now),
            HealthStatus::Down
        );
    }

    #[test]
    fn test_no_connection_is_disconnected() {
        let now = 10_000;
        assert_eq!(
            classify(ConnectionStatus::Reconnecting, Some(now - 10), now),
            HealthStatus::Disconnected
        );
        assert_eq!(
            classify(ConnectionStatus::Disconnected, None, now),
            HealthStatus::Disconnected
        );
    }

    #[test]
    fn test_three_consecutive_downs_trigger_reconnect() {
        let mut tracker = DownTracker::new(3);
        assert!(!tracker.observe(1, HealthStatus::Down));
        assert!(!tracker.observe(1, HealthStatus::Down));
        assert!(tracker.observe(1, HealthStatus::Down)); // Third one fires

        // Streak restarts after the trigger
        assert!(!tracker.observe(1, HealthStatus::Down));
    }

    #[test]
    fn test_recovery_resets_streak() {
        let mut tracker = DownTracker::new(3);
        tracker.observe(1, HealthStatus::Down);
        tracker.observe(1, HealthStatus::Down);
        tracker.observe(1, HealthStatus::Healthy); // Recovered
        assert!(!tracker.observe(1, HealthStatus::Down));
        assert!(!tracker.observe(1, HealthStatus::Down));
        assert!(tracker.observe(1, HealthStatus::Down));
    }

    #[test]
    fn test_streaks_are_per_source() {
        let mut tracker = DownTracker::new(3);
        tracker.observe(1, HealthStatus::Down);
        tracker.observe(1, HealthStatus::Down);
        assert!(!tracker.observe(2, HealthStatus::Down));
        assert!(tracker.observe(1, HealthStatus::Down));
    }
}
