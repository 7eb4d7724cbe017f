use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{ChannelId, Document};
use crate::infrastructure::persistence::Persistence;

struct Inner {
    document: Option<Document>,
    /// Bumped on every `set`.
    revision: u64,
    /// Highest revision a save was attempted for.
    saved: u64,
    flushing: bool,
}

/// One channel's document behind a single lock that is never held across an await.
pub struct ChannelState {
    id: ChannelId,
    inner: Arc<Mutex<Inner>>,
    persistence: Option<Persistence>,
}

impl ChannelState {
    /// `None` means "no document yet", which is distinct from an empty one.
    pub fn new(id: ChannelId, initial: Option<Document>, persistence: Option<Persistence>) -> Self {
        Self {
            id,
            inner: Arc::new(Mutex::new(Inner {
                document: initial,
                revision: 0,
                saved: 0,
                flushing: false,
            })),
            persistence,
        }
    }

    /// Overlays the persisted record. A record arriving after a local write is discarded.
    pub async fn load(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        match persistence.load(&self.id).await {
            Ok(Some(document)) => {
                let mut inner = self.inner.lock();
                if inner.revision == 0 {
                    inner.document = Some(document);
                    debug!(channel = %self.id, "loaded persisted document");
                } else {
                    warn!(channel = %self.id, "discarding persisted document, channel already written");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(channel = %self.id, error = %e, "failed to load persisted document");
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().document.as_ref()?.get(key).cloned()
    }

    pub fn get_all(&self) -> Option<Document> {
        self.inner.lock().document.clone()
    }

    pub fn snapshot_with<R>(&self, f: impl FnOnce(Option<&Document>) -> R) -> R {
        let inner = self.inner.lock();
        f(inner.document.as_ref())
    }

    pub fn set(&self, key: String, value: Value) -> Value {
        self.set_with(key, value, |_, _| {})
    }

    /// Runs `after` on the stored pair before the lock is released.
    ///
    /// Saves are coalesced: one flush task per channel writes the latest
    /// document until nothing newer is pending. Spawning it needs a tokio
    /// runtime when a backend is configured.
    pub fn set_with(&self, key: String, value: Value, after: impl FnOnce(&str, &Value)) -> Value {
        let start_flush = {
            let mut inner = self.inner.lock();
            inner.revision += 1;
            let document = inner.document.get_or_insert_with(Document::new);
            document.insert(key.clone(), value.clone());
            after(&key, &value);
            let start = self.persistence.is_some() && !inner.flushing;
            if start {
                inner.flushing = true;
            }
            start
        };

        if let (true, Some(persistence)) = (start_flush, &self.persistence) {
            tokio::spawn(flush(
                self.id.clone(),
                Arc::clone(&self.inner),
                persistence.clone(),
            ));
        }

        value
    }

    pub async fn delete_persisted(&self) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.delete(&self.id).await {
                warn!(channel = %self.id, error = %e, "failed to delete persisted document");
            }
        }
    }
}

async fn flush(channel: ChannelId, inner: Arc<Mutex<Inner>>, persistence: Persistence) {
    loop {
        let (revision, document) = {
            let mut guard = inner.lock();
            if guard.saved >= guard.revision {
                guard.flushing = false;
                return;
            }
            (guard.revision, guard.document.clone().unwrap_or_default())
        };
        if let Err(e) = persistence.save(&channel, &document).await {
            warn!(channel = %channel, revision, error = %e, "failed to persist document");
        }
        inner.lock().saved = revision;
    }
}
