pub mod protocol;

use std::fmt;

use serde_json::{Map, Value};
use uuid::Uuid;

pub type Document = Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(String);

impl ChannelId {
    const GENERATED_LEN: usize = 8;

    /// Short random id. Collisions are tolerated, not prevented.
    pub fn generate() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(Self::GENERATED_LEN);
        Self(id)
    }

    /// The supplied id is used verbatim unless it is missing or empty.
    pub fn from_query(supplied: Option<&str>) -> Self {
        match supplied {
            Some(id) if !id.is_empty() => Self(id.to_string()),
            _ => Self::generate(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl Default for ConnectionId {
    fn default() -> Self {
        Self(Uuid::now_v7())
    }
}

impl ConnectionId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0.simple())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum SelfDelivery {
    #[default]
    Exclude,
    Include,
}

impl SelfDelivery {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelfDelivery::Exclude => "exclude",
            SelfDelivery::Include => "include",
        }
    }
}
