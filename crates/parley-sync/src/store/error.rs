//! Storage error types.

use thiserror::Error;

/// Errors from a [`super::MessageStore`] backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Database or lock failure
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Stored value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Conversation id too long to encode in a key
    #[error("conversation id of {len} bytes exceeds the {max} byte key limit")]
    KeyTooLong {
        /// Id length in bytes
        len: usize,
        /// Longest id the backend accepts
        max: usize,
    },
}
