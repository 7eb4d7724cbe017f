//! Shared key/value documents per channel, kept in sync over websockets.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod ports;
pub mod telemetry;

use std::sync::Arc;

use crate::application::AppState;
use crate::config::Config;
use crate::infrastructure::gateway::ConnectionGateway;
use crate::infrastructure::persistence::open_persistence;
use crate::infrastructure::ChannelStore;

pub fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let persistence = config
        .database_url
        .as_deref()
        .map(|url| open_persistence(url, config.persistence_timeout()))
        .transpose()?;
    if persistence.is_none() {
        tracing::info!("persistence disabled, channels are in-memory only");
    }

    let channels = Arc::new(ChannelStore::new(config.max_channels, persistence));
    let gateway = Arc::new(ConnectionGateway::new(
        config.broadcast_capacity,
        config.self_delivery,
    ));
    Ok(AppState::new(channels, gateway))
}
