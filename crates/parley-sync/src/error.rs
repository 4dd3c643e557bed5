//! Sync engine errors.

use parley_core::ConnectionError;
use parley_proto::{ConversationId, MessageId, ProtocolError};
use thiserror::Error;

use crate::store::StorageError;

/// Errors returned by [`crate::SyncEngine`] operations.
///
/// Storage failures during reconciliation are logged and never surface here:
/// the in-memory view stays authoritative for the session. Only operations
/// that cannot proceed at all return an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Connection layer rejected the operation
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Outbound payload could not be encoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Local cache failed on an operation that needs it
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Message is not in the local view
    #[error("unknown message {message_id} in conversation {conversation_id}")]
    UnknownMessage {
        /// Conversation searched
        conversation_id: ConversationId,
        /// Missing message id
        message_id: MessageId,
    },

    /// Only failed optimistic messages can be retried
    #[error("message {message_id} is not a failed send")]
    NotRetryable {
        /// Message that was asked to be retried
        message_id: MessageId,
    },
}
