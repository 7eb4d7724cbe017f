use async_trait::async_trait;

use crate::domain::{ChannelId, Document};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
    #[error("persistence call timed out after {0}ms")]
    Timeout(u64),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Best-effort mirror of channel documents. Callers log failures and carry on in memory.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn load(&self, channel: &ChannelId) -> Result<Option<Document>, PersistenceError>;

    /// Overwrites the record for `channel`.
    async fn save(&self, channel: &ChannelId, document: &Document) -> Result<(), PersistenceError>;

    async fn delete(&self, channel: &ChannelId) -> Result<(), PersistenceError>;

    /// Releases the backing connection. Later calls fail with `Unavailable`.
    async fn close(&self) -> Result<(), PersistenceError>;
}
