mod sqlite;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::info;

use crate::domain::{ChannelId, Document};
use crate::ports::{PersistenceError, PersistencePort};

pub use sqlite::SqliteStore;

/// Shared handle to the backend that bounds every call with a timeout.
#[derive(Clone)]
pub struct Persistence {
    port: Arc<dyn PersistencePort>,
    timeout: Duration,
}

impl Persistence {
    pub fn new(port: Arc<dyn PersistencePort>, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    pub async fn load(&self, channel: &ChannelId) -> Result<Option<Document>, PersistenceError> {
        self.bounded(self.port.load(channel)).await
    }

    pub async fn save(&self, channel: &ChannelId, document: &Document) -> Result<(), PersistenceError> {
        self.bounded(self.port.save(channel, document)).await
    }

    pub async fn delete(&self, channel: &ChannelId) -> Result<(), PersistenceError> {
        self.bounded(self.port.delete(channel)).await
    }

    pub async fn close(&self) -> Result<(), PersistenceError> {
        self.bounded(self.port.close()).await
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, PersistenceError>>,
    ) -> Result<T, PersistenceError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PersistenceError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

/// Accepted forms are `sqlite://<path>`, `sqlite::memory:` and a bare path.
pub fn open_persistence(url: &str, timeout: Duration) -> anyhow::Result<Persistence> {
    let store = if url == "sqlite::memory:" || url == ":memory:" {
        SqliteStore::in_memory()?
    } else if let Some(path) = url.strip_prefix("sqlite://") {
        SqliteStore::open(Path::new(path)).with_context(|| format!("open sqlite store at {path}"))?
    } else if url.contains("://") {
        bail!("unsupported persistence backend: {url}");
    } else {
        SqliteStore::open(Path::new(url)).with_context(|| format!("open sqlite store at {url}"))?
    };
    info!(url, "persistence enabled");
    Ok(Persistence::new(Arc::new(store), timeout))
}


#[cfg(test)]
mod tests {
    use super::testing::StalledStore;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stalled_backend_times_out() {
        let persistence = Persistence::new(Arc::new(StalledStore), Duration::from_millis(250));
        let err = persistence.load(&"a".into()).await.unwrap_err();
        assert_eq!(err, PersistenceError::Timeout(250));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(open_persistence("redis://localhost:6379", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn memory_url_opens() {
        assert!(open_persistence("sqlite::memory:", Duration::from_secs(1)).is_ok());
    }
}
