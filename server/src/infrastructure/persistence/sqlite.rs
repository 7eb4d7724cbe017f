use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::info;

use crate::domain::{ChannelId, Document};
use crate::ports::{PersistenceError, PersistencePort};

const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
";

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS channel_state (
    key        TEXT PRIMARY KEY,
    document   TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (unixepoch())
);
";

fn record_key(channel: &ChannelId) -> String {
    format!("state:{channel}")
}

fn unavailable(e: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::Unavailable(e.to_string())
}

/// One JSON row per channel; every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| unavailable(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "sqlite store opened");
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, PersistenceError> {
        Self::init(Connection::open_in_memory().map_err(unavailable)?)
    }

    fn init(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch(PRAGMAS)
            .map_err(|e| unavailable(format!("pragmas: {e}")))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| unavailable(format!("schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(&Connection) -> Result<T, PersistenceError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let conn = guard
                .as_ref()
                .ok_or_else(|| PersistenceError::Unavailable("store closed".into()))?;
            f(conn)
        })
        .await
        .map_err(unavailable)?
    }
}

#[async_trait]
impl PersistencePort for SqliteStore {
    async fn load(&self, channel: &ChannelId) -> Result<Option<Document>, PersistenceError> {
        let key = record_key(channel);
        let raw: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT document FROM channel_state WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(unavailable)
            })
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(document)) => Ok(Some(document)),
            Ok(other) => Err(PersistenceError::Corrupt(format!(
                "expected an object, found {other}"
            ))),
            Err(e) => Err(PersistenceError::Corrupt(e.to_string())),
        }
    }

    async fn save(&self, channel: &ChannelId, document: &Document) -> Result<(), PersistenceError> {
        let key = record_key(channel);
        let raw = serde_json::to_string(document).map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO channel_state (key, document, updated_at) VALUES (?1, ?2, unixepoch())
                 ON CONFLICT(key) DO UPDATE SET document = excluded.document, updated_at = excluded.updated_at",
                params![key, raw],
            )
            .map(|_| ())
            .map_err(unavailable)
        })
        .await
    }

    async fn delete(&self, channel: &ChannelId) -> Result<(), PersistenceError> {
        let key = record_key(channel);
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM channel_state WHERE key = ?1", params![key])
                .map(|_| ())
                .map_err(unavailable)
        })
        .await
    }

    async fn close(&self) -> Result<(), PersistenceError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            if let Some(conn) = conn.lock().take() {
                conn.close().map_err(|(_, e)| unavailable(e))?;
                info!("sqlite store closed");
            }
            Ok(())
        })
        .await
        .map_err(unavailable)?
    }
}
