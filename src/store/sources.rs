//! Source configuration reader.
//!
//! The `sources` table is owned by the external configuration surface;
//! this side only reads it, on startup and on every reconciliation pass.

use super::StoreError;
use async_trait::async_trait;
use rusqlite::{params, Connection, Row};
use std::sync::{Arc, Mutex};

/// One configured upstream game server.
///
/// The handshake payloads are opaque hex-encoded byte strings replayed
/// verbatim on the wire. `PartialEq` is how the supervisor detects that
/// a parked source was reconfigured.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub endpoint_url: String,
    pub handshake1: String,
    pub handshake2: String,
    pub handshake3: String,
    pub decoder_mode: String,
    pub active: bool,
}

#[async_trait]
pub trait SourceConfigReader: Send + Sync {
    /// All sources currently flagged active.
    async fn load_active(&self) -> Result<Vec<Source>, StoreError>;
}

pub struct SqliteSourceReader {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSourceReader {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

fn row_to_source(row: &Row) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get(0)?,
        name: row.get(1)?,
        endpoint_url: row.get(2)?,
        handshake1: row.get(3)?,
        handshake2: row.get(4)?,
        handshake3: row.get(5)?,
        decoder_mode: row.get(6)?,
        active: row.get::<_, i64>(7)? != 0,
    })
}

#[async_trait]
impl SourceConfigReader for SqliteSourceReader {
    async fn load_active(&self) -> Result<Vec<Source>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, endpoint_url, handshake1, handshake2, handshake3,
                    decoder_mode, active
             FROM sources WHERE active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![], row_to_source)?;
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

    #[tokio::test]
    async fn test_load_active_filters_inactive() {
        let dir = tempdir().unwrap();
        let conn = open_database(dir.path().join("sources.db")).unwrap();
        conn.execute(
            "INSERT INTO sources (id, name, endpoint_url, handshake1, handshake2, handshake3, decoder_mode, active)
             VALUES (1, 'alpha', 'wss://a.example/ws', 'dead', 'beef', 'f00d', 'auto', 1),
                    (2, 'beta', 'wss://b.example/ws', 'aa', 'bb', 'cc', 'format_b', 0)",
            [],
        )
        .unwrap();

        let reader = SqliteSourceReader::new(Arc::new(Mutex::new(conn)));
        let sources = reader.load_active().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name, "alpha");
        assert!(sources[0].active);
    }
}
