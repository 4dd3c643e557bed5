//! Protocol error types.

use thiserror::Error;

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding frames.
///
/// Every variant describes a single frame. None of them imply the connection
/// is unusable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is not a JSON envelope
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Frame exceeds [`crate::Envelope::MAX_FRAME_SIZE`]
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Size of the rejected frame
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Action string not recognized by this client
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// Envelope is well-formed but `data` does not match the action's schema
    #[error("invalid payload for {action}: {reason}")]
    InvalidPayload {
        /// Action whose payload failed to decode
        action: String,
        /// Decoder message
        reason: String,
    },

    /// Serialization of an outbound payload failed
    #[error("json encode failed: {0}")]
    JsonEncode(String),
}

impl ProtocolError {
    /// Returns true if the frame came from a newer protocol revision and
    /// should be ignored rather than reported.
    pub fn is_unknown_action(&self) -> bool {
        matches!(self, Self::UnknownAction(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unknown_action_is_forward_compatible() {
        assert!(ProtocolError::UnknownAction("presence:update".into()).is_unknown_action());
        assert!(!ProtocolError::MalformedEnvelope("eof".into()).is_unknown_action());
        assert!(
            !ProtocolError::InvalidPayload { action: "message:typing".into(), reason: "x".into() }
                .is_unknown_action()
        );
    }
}
