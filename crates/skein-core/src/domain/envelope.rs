//! Payload envelope.
//!
//! Adapters store user data inside an envelope so backend-native fields
//! never collide with user keys. Unwrapping is defensive: a value that is not
//! an envelope written by this crate is returned as-is, as plain data.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::Metadata;

/// Marker key identifying an envelope.
pub const ENVELOPE_KEY: &str = "__skein";

/// Current envelope format version.
pub const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Header {
    v: u32,
    name: String,
}

/// The stored form of a job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    #[serde(rename = "__skein")]
    header: Header,
    pub data: Value,
    #[serde(default)]
    pub metadata: Metadata,
}

impl PayloadEnvelope {
    pub fn new(name: impl Into<String>, data: Value, metadata: Metadata) -> Self {
        Self {
            header: Header {
                v: ENVELOPE_VERSION,
                name: name.into(),
            },
            data,
            metadata,
        }
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    /// Wrap into the backend-native JSON value.
    pub fn wrap(self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert(
            ENVELOPE_KEY.to_string(),
            serde_json::json!({ "v": self.header.v, "name": self.header.name }),
        );
        obj.insert("data".to_string(), self.data);
        obj.insert(
            "metadata".to_string(),
            Value::Object(self.metadata.into_iter().collect()),
        );
        Value::Object(obj)
    }

    /// Unwrap a stored value.
    ///
    /// Returns `(name, data, metadata)`; `name` is `None` when the value was
    /// not produced by [`PayloadEnvelope::wrap`].
    pub fn unwrap(stored: Value) -> (Option<String>, Value, Metadata) {
        let is_envelope = stored
            .as_object()
            .is_some_and(|o| o.get(ENVELOPE_KEY).is_some_and(Value::is_object));
        if !is_envelope {
            return (None, stored, Metadata::new());
        }
        match serde_json::from_value::<PayloadEnvelope>(stored.clone()) {
            Ok(env) => (Some(env.header.name), env.data, env.metadata),
            Err(_) => (None, stored, Metadata::new()),
        }
    }
}
