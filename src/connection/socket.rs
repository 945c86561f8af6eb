//! Per-source socket driver.
//!
//! One task per source owns the WebSocket, the round accumulator and all
//! per-source timers inside a single select loop, so message handling,
//! heartbeats and deferred finalize/reset never race each other. The
//! outer loop reconnects with linear backoff and parks the source once
//! the attempt ceiling is reached.

use super::supervisor::Services;
use super::{ConnectionShared, ConnectionStatus, ValidatedSource};
use crate::bus::BusEvent;
use crate::config::RuntimeConfig;
use crate::coordinator::{PersistOutcome, SkipReason};
use crate::protocol;
use crate::round::{Effect, RoundAggregate, RoundSnapshot};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval_at, sleep, sleep_until, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Debug)]
pub enum ConnectionError {
    Connect(String),
    Socket(String),
    Closed,
    HeartbeatFailed(String),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Connect(msg) => write!(f, "connect failed: {}", msg),
            ConnectionError::Socket(msg) => write!(f, "socket error: {}", msg),
            ConnectionError::Closed => write!(f, "connection closed by peer"),
            ConnectionError::HeartbeatFailed(msg) => write!(f, "heartbeat send failed: {}", msg),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Outer per-source loop: connect, run, best-effort save, back off,
/// repeat. Returns when shutdown is requested, the retry ceiling is
/// reached, or a full rebuild is in progress.
pub async fn run_source(
    validated: ValidatedSource,
    shared: Arc<ConnectionShared>,
    services: Services,
    config: Arc<RuntimeConfig>,
    resetting: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let source_id = validated.source.id;
    let mut aggregate = RoundAggregate::new();
    let mut attempt: u32 = 0;

    loop {
        let result = run_connection(
            &validated,
            &shared,
            &services,
            &config,
            &mut aggregate,
            &shutdown,
        )
        .await;

        match result {
            Ok(()) => {
                // Shutdown requested; save whatever round is in flight
                final_save(source_id, &aggregate, &services, config.shutdown_grace).await;
                shared.set_status(ConnectionStatus::Disconnected);
                return;
            }
            Err(err) => {
                log::warn!("⚠️  Source {} connection lost: {}", source_id, err);
                final_save(source_id, &aggregate, &services, config.shutdown_grace).await;

                // A stint that reached Connected restarts the backoff ladder
                if shared.status() == ConnectionStatus::Connected {
                    attempt = 1;
                } else {
                    attempt += 1;
                }
                shared.set_retry_count(attempt);

                if attempt > config.reconnect_max_attempts {
                    log::error!(
                        "❌ Source {} exhausted {} reconnect attempts, staying disconnected until reconfigured",
                        source_id,
                        config.reconnect_max_attempts
                    );
                    shared.set_status(ConnectionStatus::Disconnected);
                    return;
                }
                if resetting.load(Ordering::Relaxed) {
                    // Full rebuild in progress, the supervisor respawns us
                    shared.set_status(ConnectionStatus::Disconnected);
                    return;
                }

                let delay = config
                    .reconnect_base_delay
                    .saturating_mul(attempt)
                    .min(config.reconnect_max_delay);
                log::info!(
                    "⏳ Source {} reconnecting in {}s (attempt {} of {})",
                    source_id,
                    delay.as_secs(),
                    attempt,
                    config.reconnect_max_attempts
                );
                shared.set_status(ConnectionStatus::Reconnecting);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.notified() => {
                        shared.set_status(ConnectionStatus::Disconnected);
                        return;
                    }
                }
            }
        }
    }
}

/// One connection stint. `Ok(())` means shutdown was requested; every
/// other exit is a reconnectable error. The accumulator outlives the
/// stint so an interrupted round resumes after reconnect.
async fn run_connection(
    validated: &ValidatedSource,
    shared: &ConnectionShared,
    services: &Services,
    config: &RuntimeConfig,
    aggregate: &mut RoundAggregate,
    shutdown: &Notify,
) -> Result<(), ConnectionError> {
    let source_id = validated.source.id;
    let url = &validated.source.endpoint_url;

    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| ConnectionError::Connect(e.to_string()))?;
    let (mut sink, mut stream) = ws.split();

    log::info!("🔗 Source {} connected to {}", source_id, url);
    shared.set_status(ConnectionStatus::Connected);
    shared.touch_activity(chrono::Utc::now().timestamp());

    sink.send(Message::Binary(validated.handshakes[0].clone()))
        .await
        .map_err(|e| ConnectionError::Socket(e.to_string()))?;

    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    let mut sent_second_handshake = false;
    let mut decode_failures = DecodeFailureLog::new();
    let mut finalize_at: Option<Instant> = None;
    let mut reset_at: Option<Instant> = None;

    loop {
        tokio::select! {
            inbound = stream.next() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return Err(ConnectionError::Socket(e.to_string())),
                    None => return Err(ConnectionError::Closed),
                };
                let bytes = match message {
                    Message::Binary(bytes) => bytes,
                    Message::Text(text) => text.into_bytes(),
                    Message::Close(_) => return Err(ConnectionError::Closed),
                    _ => continue,
                };
                match protocol::decode(&bytes, validated.mode) {
                    Ok(envelope) => {
                        shared.touch_activity(chrono::Utc::now().timestamp());
                        if !sent_second_handshake {
                            sink.send(Message::Binary(validated.handshakes[1].clone()))
                                .await
                                .map_err(|e| ConnectionError::Socket(e.to_string()))?;
                            sent_second_handshake = true;
                        }
                        let effects = aggregate.apply(&envelope);
                        perform_effects(
                            effects,
                            source_id,
                            services,
                            config,
                            &mut finalize_at,
                            &mut reset_at,
                        )
                        .await;
                    }
                    Err(err) => decode_failures.record(source_id, &err),
                }
            }
            _ = heartbeat.tick() => {
                sink.send(Message::Binary(validated.handshakes[2].clone()))
                    .await
                    .map_err(|e| ConnectionError::HeartbeatFailed(e.to_string()))?;
            }
            _ = maybe_sleep(finalize_at) => {
                // Grace window expired without a late multiplier message
                finalize_at = None;
                if aggregate.has_usable_multiplier() {
                    let snapshot = aggregate.snapshot();
                    if persist_round(source_id, &snapshot, services).await {
                        reset_at = Some(Instant::now() + config.reset_delay);
                    }
                } else {
                    log::debug!(
                        "Source {} round ended without a usable multiplier, dropping",
                        source_id
                    );
                }
            }
            _ = maybe_sleep(reset_at) => {
                reset_at = None;
                aggregate.reset();
            }
            _ = shutdown.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Apply accumulator effects: broadcasts, finalization, timer updates.
async fn perform_effects(
    effects: Vec<Effect>,
    source_id: i64,
    services: &Services,
    config: &RuntimeConfig,
    finalize_at: &mut Option<Instant>,
    reset_at: &mut Option<Instant>,
) {
    for effect in effects {
        match effect {
            Effect::NewRound => {
                services.publisher.publish(BusEvent::NewRound { source_id });
            }
            Effect::Multiplier(value) => {
                services
                    .publisher
                    .publish(BusEvent::Multiplier { source_id, value });
            }
            Effect::ChartInfo {
                round_id,
                max_multiplier,
            } => {
                services.publisher.publish(BusEvent::RoundChartInfo {
                    source_id,
                    round_id,
                    max_multiplier,
                });
            }
            Effect::Live(round) => {
                services
                    .publisher
                    .publish(BusEvent::Round { source_id, round });
            }
            Effect::Finalize(snapshot) => {
                *finalize_at = None;
                if persist_round(source_id, &snapshot, services).await {
                    *reset_at = Some(Instant::now() + config.reset_delay);
                }
            }
            Effect::FinalizeAfterGrace => {
                *finalize_at = Some(Instant::now() + config.finalize_grace);
            }
        }
    }
}

/// Hand one snapshot to the coordinator and fan out the results.
/// Returns true when the round is durably stored (fresh or already),
/// which is the cue to schedule the aggregate reset.
async fn persist_round(source_id: i64, snapshot: &RoundSnapshot, services: &Services) -> bool {
    match services.coordinator.persist(source_id, snapshot).await {
        Ok(PersistOutcome::Persisted(round)) => {
            log::info!(
                "💾 Source {} round {} persisted at {:.2}x",
                source_id,
                round.round_id,
                round.max_multiplier
            );
            services.publisher.publish(BusEvent::RoundPersisted {
                source_id,
                round: round.clone(),
            });
            if let Err(err) = services
                .signal_engine
                .on_round_persisted(source_id, &round.round_id, round.max_multiplier)
                .await
            {
                log::error!("❌ Signal engine failed for source {}: {}", source_id, err);
            }
            true
        }
        Ok(PersistOutcome::Skipped(SkipReason::UnusableMultiplier)) => false,
        Ok(PersistOutcome::Skipped(reason)) => {
            log::debug!("Source {} round skipped: {:?}", source_id, reason);
            true
        }
        Err(err) => {
            log::error!("❌ Source {} round persist failed: {}", source_id, err);
            false
        }
    }
}

/// Best-effort save of the in-flight round, bounded by the grace period.
async fn final_save(
    source_id: i64,
    aggregate: &RoundAggregate,
    services: &Services,
    grace: Duration,
) {
    if !aggregate.has_usable_multiplier() {
        return;
    }
    let snapshot = aggregate.snapshot();
    let save = persist_round(source_id, &snapshot, services);
    if tokio::time::timeout(grace, save).await.is_err() {
        log::warn!("⚠️  Source {} final save timed out", source_id);
    }
}

/// Decode failures are expected noise on these feeds; log one line per
/// window with a suppressed-count instead of one per frame.
struct DecodeFailureLog {
    window_start: Option<Instant>,
    suppressed: u64,
}

const DECODE_LOG_WINDOW: Duration = Duration::from_secs(10);

impl DecodeFailureLog {
    fn new() -> Self {
        Self {
            window_start: None,
            suppressed: 0,
        }
    }

    fn record(&mut self, source_id: i64, err: &protocol::DecodeError) {
        let now = Instant::now();
        let in_window = self
            .window_start
            .is_some_and(|start| now.duration_since(start) < DECODE_LOG_WINDOW);
        if in_window {
            self.suppressed += 1;
            return;
        }
        if self.suppressed > 0 {
            log::warn!(
                "⚠️  Source {} undecodable frame: {} ({} more suppressed)",
                source_id,
                err,
                self.suppressed
            );
        } else {
            log::warn!("⚠️  Source {} undecodable frame: {}", source_id, err);
        }
        self.window_start = Some(now);
        self.suppressed = 0;
    }
}
