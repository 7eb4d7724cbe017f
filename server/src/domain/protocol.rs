//! Wire framing: every frame is a JSON object.

use std::fmt;

use serde::de::{self, Deserializer, IgnoredAny, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Document;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Only the first field of the object is honored; the rest are skipped
/// without being buffered.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub key: String,
    pub value: Value,
}

impl Mutation {
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let mutation: Mutation =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if mutation.key.is_empty() {
            return Err(ProtocolError::Malformed("key must be a non-empty string".into()));
        }
        Ok(mutation)
    }
}

impl<'de> Deserialize<'de> for Mutation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FirstEntry;

        impl<'de> Visitor<'de> for FirstEntry {
            type Value = Mutation;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object with one field")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Mutation, A::Error> {
                let (key, value) = map
                    .next_entry::<String, Value>()?
                    .ok_or_else(|| de::Error::custom("object has no fields"))?;
                while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
                Ok(Mutation { key, value })
            }
        }

        deserializer.deserialize_map(FirstEntry)
    }
}

/// Outbound single-field update, serialized as `{"<key>": <value>}`.
#[derive(Debug, Clone, Copy)]
pub struct Update<'a> {
    pub key: &'a str,
    pub value: &'a Value,
}

impl Serialize for Update<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.key, self.value)?;
        map.end()
    }
}

impl Update<'_> {
    pub fn encode(&self) -> String {
        // A string-keyed map of JSON values always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Join frame. A channel without a document is sent as an empty object.
pub fn encode_snapshot(document: Option<&Document>) -> String {
    document
        .and_then(|doc| serde_json::to_string(doc).ok())
        .unwrap_or_else(|| "{}".to_string())
}
