pub mod gateway;
pub mod persistence;
pub mod state;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::domain::{ChannelId, Document};
use crate::infrastructure::persistence::Persistence;
use crate::infrastructure::state::ChannelState;

pub const DEFAULT_MAX_CHANNELS: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("max of {max} channels reached")]
    CapacityExceeded { max: usize },
}

/// Filled once by whichever caller first runs the load; the rest await it.
type Slot = Arc<OnceCell<Arc<ChannelState>>>;

/// Channels stay resident until deleted; nothing is evicted on idle.
pub struct ChannelStore {
    channels: DashMap<ChannelId, Slot>,
    /// Slots handed out, including those still loading.
    reserved: AtomicUsize,
    max_channels: usize,
    persistence: Option<Persistence>,
}

impl ChannelStore {
    pub fn new(max_channels: usize, persistence: Option<Persistence>) -> Self {
        Self {
            channels: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_channels,
            persistence,
        }
    }

    pub async fn get_or_create(&self, id: &ChannelId) -> Result<Arc<ChannelState>, RegistryError> {
        self.get_or_create_with(id, None).await
    }

    /// `initial` only applies when this call creates the channel.
    pub async fn get_or_create_with(
        &self,
        id: &ChannelId,
        initial: Option<Document>,
    ) -> Result<Arc<ChannelState>, RegistryError> {
        let slot = match self.channels.entry(id.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                self.reserve()?;
                debug!(channel = %id, "registering channel");
                Arc::clone(entry.insert(Arc::new(OnceCell::new())).value())
            }
        };

        let state = slot
            .get_or_init(|| {
                let id = id.clone();
                let persistence = self.persistence.clone();
                async move {
                    let state = ChannelState::new(id, initial, persistence);
                    state.load().await;
                    Arc::new(state)
                }
            })
            .await;
        Ok(Arc::clone(state))
    }

    pub fn get(&self, id: &ChannelId) -> Option<Arc<ChannelState>> {
        self.channels.get(id).and_then(|slot| slot.get().cloned())
    }

    /// Drops the channel and its persisted record. Missing ids are a no-op.
    pub async fn delete(&self, id: &ChannelId) {
        let Some((_, slot)) = self.channels.remove(id) else {
            return;
        };
        self.reserved.fetch_sub(1, Ordering::AcqRel);
        if let Some(state) = slot.get() {
            state.delete_persisted().await;
        }
        info!(channel = %id, "channel deleted");
    }

    pub fn count(&self) -> usize {
        self.channels.len()
    }

    /// Releases the persistence connection. In-memory documents are not flushed.
    pub async fn shutdown(&self) {
        if let Some(persistence) = &self.persistence {
            match persistence.close().await {
                Ok(()) => info!(channels = self.count(), "persistence closed"),
                Err(e) => warn!(error = %e, "failed to close persistence"),
            }
        }
    }

    fn reserve(&self) -> Result<(), RegistryError> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_channels).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| {
                warn!(max = self.max_channels, "channel capacity reached");
                RegistryError::CapacityExceeded { max: self.max_channels }
            })
    }
}
