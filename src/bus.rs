//! Best-effort event fan-out.
//!
//! Every externally visible occurrence (live round updates, persisted
//! rounds, signals, health snapshots) is published as a named,
//! per-source-scoped event. Publishing never blocks ingestion and is
//! fire-and-forget: a full or receiver-less channel drops the event.

use crate::round::LiveRound;
use crate::store::rounds::PersistedRound;
use crate::store::signals::Signal;
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Health classification for one source, included in health snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Down,
    Disconnected,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source_id: i64,
    pub status: HealthStatus,
    pub seconds_since_activity: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum BusEvent {
    /// Live aggregate snapshot, emitted on every processed message.
    Round { source_id: i64, round: LiveRound },
    /// A new betting phase opened.
    NewRound { source_id: i64 },
    /// Live multiplier tick while a round is running.
    Multiplier { source_id: i64, value: f64 },
    /// Backup chart-info payload observed on the wire.
    RoundChartInfo {
        source_id: i64,
        round_id: Option<String>,
        max_multiplier: f64,
    },
    /// A round reached durable storage.
    RoundPersisted { source_id: i64, round: PersistedRound },
    SignalEmitted { source_id: i64, signal: Signal },
    SignalResult { source_id: i64, signal: Signal },
    HealthSnapshot { sources: Vec<SourceHealth> },
}

/// Injected publishing capability.
///
/// Production fans out through a broadcast channel; tests swap in
/// [`RecordingPublisher`] and assert on the captured events.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: BusEvent);
}

/// Publisher backed by a `tokio::sync::broadcast` channel.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<BusEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<BusEvent>) {
        let (tx, rx) = broadcast::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: BusEvent) {
        // No receivers is not an error for a best-effort bus.
        let _ = self.tx.send(event);
    }
}

/// Captures published events for assertions.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<BusEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.events.lock().expect("recording publisher poisoned").clone()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: BusEvent) {
        self.events
            .lock()
            .expect("recording publisher poisoned")
            .push(event);
    }
}
