//! Source supervision.
//!
//! Owns one task per active source and reconciles the running set
//! against the configuration table: newly valid sources get connections,
//! deactivated or invalidated ones are closed, and a parked source is
//! respawned only when its row actually changed. A process-wide
//! `resetting` flag freezes reconnects and reconciliation while a full
//! rebuild tears everything down.

use super::socket;
use super::{validate_source, ConnectionShared, ConnectionStatus};
use crate::bus::{EventPublisher, SourceHealth};
use crate::config::RuntimeConfig;
use crate::connection::health;
use crate::coordinator::RoundCoordinator;
use crate::signal::SignalEngine;
use crate::store::sources::{Source, SourceConfigReader};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Shared downstream capabilities handed to every source task.
#[derive(Clone)]
pub struct Services {
    pub coordinator: Arc<RoundCoordinator>,
    pub signal_engine: Arc<SignalEngine>,
    pub publisher: Arc<dyn EventPublisher>,
}

struct SourceHandle {
    /// The configuration this task was spawned with; compared against
    /// fresh rows to detect reconfiguration.
    source: Source,
    shared: Arc<ConnectionShared>,
    task: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

pub struct Supervisor {
    config: Arc<RuntimeConfig>,
    reader: Arc<dyn SourceConfigReader>,
    services: Services,
    handles: Mutex<HashMap<i64, SourceHandle>>,
    resetting: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(
        config: Arc<RuntimeConfig>,
        reader: Arc<dyn SourceConfigReader>,
        services: Services,
    ) -> Self {
        Self {
            config,
            reader,
            services,
            handles: Mutex::new(HashMap::new()),
            resetting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Align running connections with the source table. Called at
    /// startup and then periodically.
    pub async fn reconcile(&self) {
        if self.resetting.load(Ordering::Relaxed) {
            log::debug!("Reconciliation skipped, rebuild in progress");
            return;
        }
        let sources = match self.reader.load_active().await {
            Ok(sources) => sources,
            Err(err) => {
                log::error!("❌ Failed to load source config: {}", err);
                return;
            }
        };
        let desired: HashMap<i64, Source> =
            sources.into_iter().map(|s| (s.id, s)).collect();

        let mut handles = self.handles.lock().unwrap();

        // Close connections whose source went away or inactive
        let stale: Vec<i64> = handles
            .keys()
            .filter(|id| !desired.contains_key(id))
            .copied()
            .collect();
        for id in stale {
            if let Some(handle) = handles.remove(&id) {
                log::info!("🔌 Source {} deactivated, closing connection", id);
                handle.shutdown.notify_one();
            }
        }

        for (id, source) in desired {
            let reconfigured = handles.get(&id).map(|handle| handle.source != source);
            match reconfigured {
                None => {
                    Self::spawn_into(
                        &mut handles,
                        source,
                        &self.services,
                        &self.config,
                        &self.resetting,
                    );
                }
                Some(true) => {
                    // Restart with the fresh row. This is also how an
                    // exhausted source comes back.
                    log::info!("🔄 Source {} reconfigured, restarting connection", id);
                    if let Some(old) = handles.remove(&id) {
                        old.shutdown.notify_one();
                        old.task.abort();
                    }
                    Self::spawn_into(
                        &mut handles,
                        source,
                        &self.services,
                        &self.config,
                        &self.resetting,
                    );
                }
                Some(false) => {}
            }
        }
    }

    fn spawn_into(
        handles: &mut HashMap<i64, SourceHandle>,
        source: Source,
        services: &Services,
        config: &Arc<RuntimeConfig>,
        resetting: &Arc<AtomicBool>,
    ) {
        let validated = match validate_source(&source) {
            Ok(validated) => validated,
            Err(err) => {
                // Skipped entirely; the next reconciliation re-checks it
                log::warn!("⚠️  Source {} skipped, invalid config: {}", source.id, err);
                return;
            }
        };
        log::info!(
            "🚀 Source {} ({}) starting, decoder mode {}",
            source.id,
            source.name,
            validated.mode
        );
        let shared = Arc::new(ConnectionShared::new());
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(socket::run_source(
            validated,
            shared.clone(),
            services.clone(),
            config.clone(),
            resetting.clone(),
            shutdown.clone(),
        ));
        handles.insert(
            source.id,
            SourceHandle {
                source,
                shared,
                task,
                shutdown,
            },
        );
    }

    /// Tear down and respawn one source. Used by the health monitor
    /// after repeated down classifications.
    pub fn force_reconnect(&self, source_id: i64) {
        if self.resetting.load(Ordering::Relaxed) {
            return;
        }
        let mut handles = self.handles.lock().unwrap();
        if let Some(handle) = handles.remove(&source_id) {
            log::warn!("🔄 Source {} forced reconnect", source_id);
            handle.task.abort();
            Self::spawn_into(
                &mut handles,
                handle.source,
                &self.services,
                &self.config,
                &self.resetting,
            );
        }
    }

    /// Tear everything down and rebuild from a fresh config read.
    pub async fn reset_all(&self) {
        self.resetting.store(true, Ordering::Relaxed);
        log::info!("🔄 Full connection rebuild started");
        self.drain_all().await;
        self.resetting.store(false, Ordering::Relaxed);
        self.reconcile().await;
        log::info!("✅ Full connection rebuild complete");
    }

    /// Graceful stop: ask every source to close, give each a bounded
    /// grace period for its final save, then abort stragglers.
    pub async fn shutdown(&self) {
        self.resetting.store(true, Ordering::Relaxed);
        self.drain_all().await;
    }

    async fn drain_all(&self) {
        let drained: Vec<SourceHandle> = {
            let mut handles = self.handles.lock().unwrap();
            handles.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &drained {
            handle.shutdown.notify_one();
        }
        for handle in drained {
            let source_id = handle.source.id;
            let abort = handle.task.abort_handle();
            match tokio::time::timeout(self.config.shutdown_grace, handle.task).await {
                Ok(_) => log::info!("🔌 Source {} closed", source_id),
                Err(_) => {
                    log::warn!("⚠️  Source {} did not close in time, aborting", source_id);
                    abort.abort();
                }
            }
        }
    }

    /// Health view over every supervised source.
    pub fn health_overview(&self, now_secs: i64) -> Vec<SourceHealth> {
        let handles = self.handles.lock().unwrap();
        let mut overview: Vec<SourceHealth> = handles
            .values()
            .map(|handle| {
                let status = if handle.task.is_finished() {
                    ConnectionStatus::Disconnected
                } else {
                    handle.shared.status()
                };
                let last_activity = handle.shared.last_activity_at();
                SourceHealth {
                    source_id: handle.source.id,
                    status: health::classify(status, last_activity, now_secs),
                    seconds_since_activity: last_activity.map(|ts| now_secs - ts),
                }
            })
            .collect();
        overview.sort_by_key(|entry| entry.source_id);
        overview
    }

    /// Number of supervised sources, for startup logging.
    pub fn source_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}
