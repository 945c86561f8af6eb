//! Ingestion runtime.
//!
//! Orchestrates the full pipeline:
//! - Opens the SQLite database and creates any missing schema
//! - Builds the round coordinator and signal engine
//! - Spawns one supervised connection per active source
//! - Runs the periodic reconciliation and health monitor loops
//!
//! Usage:
//!   cargo run --release --bin ingest_runtime
//!
//! Environment variables:
//!   CRASHFLOW_DB_PATH       - SQLite database path (default: crashflow.db)
//!   CRASHFLOW_BACKUP_LOG    - JSONL side log path (default: failed_rounds.jsonl)
//!   RECONCILE_INTERVAL_SECS - Source config poll interval (default: 60)
//!   HEALTH_INTERVAL_SECS    - Health check interval (default: 30)
//!   RUST_LOG                - Log filter (default: info)

use crashflow::bus::BroadcastPublisher;
use crashflow::config::RuntimeConfig;
use crashflow::connection::{health, Services, Supervisor};
use crashflow::coordinator::RoundCoordinator;
use crashflow::signal::SignalEngine;
use crashflow::store;
use crashflow::store::rounds::SqliteRoundStore;
use crashflow::store::signals::SqliteSignalStore;
use crashflow::store::sources::SqliteSourceReader;
use log::info;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::interval;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    // NOTE: Workaround for rustls issue
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Can't set crypto provider to aws_lc_rs");

    let config = Arc::new(RuntimeConfig::from_env()?);

    info!("🚀 Starting Crashflow ingestion runtime");
    info!("📊 Configuration:");
    info!("   Database: {}", config.db_path);
    info!("   Backup log: {}", config.backup_log_path);
    info!("   Reconcile every: {}s", config.reconcile_interval.as_secs());
    info!("   Health check every: {}s", config.health_interval.as_secs());

    let conn = store::open_database(&config.db_path)?;
    let conn = Arc::new(Mutex::new(conn));

    let round_store = Arc::new(SqliteRoundStore::new(conn.clone()));
    let signal_store = Arc::new(SqliteSignalStore::new(conn.clone()));
    let source_reader = Arc::new(SqliteSourceReader::new(conn));

    let (publisher, events_rx) = BroadcastPublisher::new(config.broadcast_capacity);
    let publisher = Arc::new(publisher);

    // Drain the broadcast channel so events are observable in the logs;
    // external consumers subscribe the same way.
    tokio::spawn(async move {
        let mut rx = events_rx;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        log::debug!("📢 {}", json);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("📢 Broadcast consumer lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let coordinator = Arc::new(RoundCoordinator::new(
        round_store.clone(),
        Some(PathBuf::from(&config.backup_log_path)),
    ));
    let signal_engine = Arc::new(SignalEngine::new(
        round_store,
        signal_store,
        publisher.clone(),
    ));

    let services = Services {
        coordinator,
        signal_engine,
        publisher: publisher.clone(),
    };
    let supervisor = Arc::new(Supervisor::new(config.clone(), source_reader, services));

    supervisor.reconcile().await;
    info!("📡 Supervising {} sources", supervisor.source_count());

    // Periodic source-config reconciliation
    let reconcile_supervisor = supervisor.clone();
    let reconcile_interval = config.reconcile_interval;
    tokio::spawn(async move {
        let mut timer = interval(reconcile_interval);
        timer.tick().await; // Initial reconcile already ran
        loop {
            timer.tick().await;
            reconcile_supervisor.reconcile().await;
        }
    });

    // Health monitor with forced reconnects
    tokio::spawn(health::run_health_monitor(
        supervisor.clone(),
        publisher,
        config.health_interval,
    ));

    info!("✅ All systems operational");
    tokio::signal::ctrl_c().await?;

    info!("🛑 Shutdown requested, closing sources...");
    supervisor.shutdown().await;
    info!("✅ Shutdown complete");
    Ok(())
}
