//! The `{action, data}` wire unit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ProtocolError, Result};

/// Wire envelope.
///
/// The only unit exchanged over the connection. Fields are private so an
/// envelope cannot be mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    action: String,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    /// Largest frame accepted by [`Envelope::decode`], checked before parsing.
    pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

    /// Create an envelope from an action string and its payload.
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self { action: action.into(), data }
    }

    /// Action string identifying the payload type.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Raw JSON payload.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Split into action and payload.
    pub fn into_parts(self) -> (String, Value) {
        (self.action, self.data)
    }

    /// String field of the payload. `None` if absent or not a string.
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::JsonEncode` if serialization fails
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::JsonEncode(e.to_string()))
    }

    /// Parse a JSON text frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooLarge` if `text` exceeds `MAX_FRAME_SIZE`
    /// - `ProtocolError::MalformedEnvelope` if `text` is not an envelope
    pub fn decode(text: &str) -> Result<Self> {
        Self::decode_bytes(text.as_bytes())
    }

    /// Parse a binary frame carrying UTF-8 JSON.
    ///
    /// # Errors
    ///
    /// Same as [`Envelope::decode`].
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > Self::MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: Self::MAX_FRAME_SIZE,
            });
        }

        serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))
    }
}
