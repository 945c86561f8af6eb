//! Per-source connection ownership: validation, the socket driver, the
//! supervisor that keeps one task per active source, and the health
//! monitor that watches them all.

pub mod health;
pub mod socket;
pub mod supervisor;

pub use supervisor::{Services, Supervisor};

use crate::protocol::DecoderMode;
use crate::store::sources::Source;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Ephemeral per-source connection state, shared between the source task
/// and the health monitor. Recreated on every (re)spawn.
#[derive(Debug)]
pub struct ConnectionShared {
    status: Mutex<ConnectionStatus>,
    /// Epoch seconds of the last successfully decoded message; 0 until
    /// the first connect.
    last_activity_at: AtomicI64,
    retry_count: AtomicU32,
}

impl ConnectionShared {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(ConnectionStatus::Connecting),
            last_activity_at: AtomicI64::new(0),
            retry_count: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn touch_activity(&self, now_secs: i64) {
        self.last_activity_at.store(now_secs, Ordering::Relaxed);
    }

    pub fn last_activity_at(&self) -> Option<i64> {
        match self.last_activity_at.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(secs),
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    pub fn set_retry_count(&self, count: u32) {
        self.retry_count.store(count, Ordering::Relaxed);
    }
}

impl Default for ConnectionShared {
    fn default() -> Self {
        Self::new()
    }
}

/// A source whose configuration passed validation, with the handshake
/// payloads decoded and the decoder mode resolved.
#[derive(Debug, Clone)]
pub struct ValidatedSource {
    pub source: Source,
    pub mode: DecoderMode,
    pub handshakes: [Vec<u8>; 3],
}

#[derive(Debug)]
pub enum SourceConfigError {
    InsecureEndpoint(String),
    MissingHandshake(usize),
    MalformedHandshake(usize),
}

impl std::fmt::Display for SourceConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceConfigError::InsecureEndpoint(url) => {
                write!(f, "endpoint must use wss://, got: {}", url)
            }
            SourceConfigError::MissingHandshake(n) => {
                write!(f, "handshake payload {} is missing", n)
            }
            SourceConfigError::MalformedHandshake(n) => {
                write!(f, "handshake payload {} is not valid hex", n)
            }
        }
    }
}

impl std::error::Error for SourceConfigError {}

/// Check a source row before opening a connection. Invalid sources are
/// skipped entirely and re-checked on the next reconciliation pass.
pub fn validate_source(source: &Source) -> Result<ValidatedSource, SourceConfigError> {
    if !source.endpoint_url.starts_with("wss://") {
        return Err(SourceConfigError::InsecureEndpoint(
            source.endpoint_url.clone(),
        ));
    }
    let raw = [&source.handshake1, &source.handshake2, &source.handshake3];
    let mut handshakes: [Vec<u8>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    for (index, payload) in raw.iter().enumerate() {
        if payload.trim().is_empty() {
            return Err(SourceConfigError::MissingHandshake(index + 1));
        }
        handshakes[index] = hex::decode(payload.trim())
            .map_err(|_| SourceConfigError::MalformedHandshake(index + 1))?;
    }
    Ok(ValidatedSource {
        source: source.clone(),
        mode: DecoderMode::parse(&source.decoder_mode),
        handshakes,
    })
}
