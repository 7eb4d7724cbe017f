use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;

use crate::domain::SelfDelivery;
use crate::infrastructure::DEFAULT_MAX_CHANNELS;

#[derive(Debug, Clone, Parser)]
#[command(name = "chanstate-server", version, about = "Shared channel state over websockets")]
pub struct Config {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[arg(long, env = "PORT", default_value_t = 3001)]
    pub port: u16,

    /// Persistence connection string; omit to run purely in memory.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "MAX_CHANNELS", default_value_t = DEFAULT_MAX_CHANNELS)]
    pub max_channels: usize,

    /// Upper bound on every persistence call.
    #[arg(long, env = "PERSISTENCE_TIMEOUT_MS", default_value_t = 2000)]
    pub persistence_timeout_ms: u64,

    /// Frames buffered per channel before a slow subscriber is resynced.
    #[arg(long, env = "BROADCAST_CAPACITY", default_value_t = 256)]
    pub broadcast_capacity: usize,

    #[arg(long, env = "SELF_DELIVERY", value_enum, default_value_t = SelfDelivery::Exclude)]
    pub self_delivery: SelfDelivery,
}

impl Config {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }
}
