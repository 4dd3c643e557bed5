//! Client error types.

use parley_sync::{EngineError, StorageError};
use thiserror::Error;

use crate::{config::ConfigError, history::HistoryError};

/// Errors returned by [`crate::SyncClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The engine rejected the operation
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The local cache could not be opened
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A history request failed
    #[error("history error: {0}")]
    History(#[from] HistoryError),

    /// The runtime task has stopped
    #[error("sync runtime stopped")]
    Closed,
}
